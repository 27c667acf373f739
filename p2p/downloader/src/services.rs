//! Tower seams to the subsystem's external collaborators.
//!
//! Each collaborator is a request/response enum pair behind a boxed
//! [`tower::Service`]: the validator manager, the two transports and the
//! overlay. Tests stand these in with `tower::service_fn` closures.

use std::time::Duration;

use bytes::Bytes;
use tokio::{sync::OwnedSemaphorePermit, time::Instant};
use tower::util::BoxCloneService;

use galena_types::{BlockHandle, BlockId, OverlayId, PeerId};

use crate::protocol::{BulkQuery, BulkResponse, ControlQuery, ControlResponse};

/// What a download token is being acquired for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DownloadKind {
    ArchiveSlice,
    Block,
    Proof,
    KeyBlocks,
    State,
}

/// A bounded-concurrency admission ticket issued by the manager.
///
/// Dropping the token returns the slot, mirroring the connection guards of
/// the P2P core.
#[derive(Debug)]
pub struct DownloadToken {
    _permit: Option<OwnedSemaphorePermit>,
}

impl DownloadToken {
    /// A token backed by a semaphore permit.
    pub fn new(permit: OwnedSemaphorePermit) -> Self {
        Self {
            _permit: Some(permit),
        }
    }

    /// A token for managers that do not bound concurrency.
    pub const fn unlimited() -> Self {
        Self { _permit: None }
    }
}

/// A request to the validator manager.
pub enum ManagerRequest {
    /// Resolve (or create) the local handle for a block.
    GetBlockHandle {
        block_id: BlockId,
        create_if_missing: bool,
    },
    /// Fetch block data through the handle's usual read path.
    GetBlockData(BlockHandle),
    /// Fetch block data directly from the database.
    GetBlockDataFromDb(BlockHandle),
    /// Validate a full proof for a block.
    ValidateBlockProof { block_id: BlockId, proof: Bytes },
    /// Validate a proof link for a block.
    ValidateBlockProofLink { block_id: BlockId, proof: Bytes },
    /// Validate a proof relative to an already-accepted block.
    ValidateBlockProofRel {
        block_id: BlockId,
        relative_to: BlockId,
        proof: Bytes,
    },
    /// Validate that `next_id` is the successor of `prev_id`.
    ValidateBlockIsNextProof {
        prev_id: BlockId,
        next_id: BlockId,
        proof: Bytes,
    },
    /// Look up a cached persistent state (`mc_block_id = None` for zero
    /// states).
    GetPersistentState {
        block_id: BlockId,
        mc_block_id: Option<BlockId>,
    },
    /// Acquire a download admission token.
    GetDownloadToken {
        kind: DownloadKind,
        priority: u32,
        deadline: Instant,
    },
}

/// A response from the validator manager.
pub enum ManagerResponse {
    /// `None` when the handle does not exist and creation was not requested.
    BlockHandle(Option<BlockHandle>),
    BlockData(Bytes),
    /// The proof was accepted. Rejections surface as service errors.
    Validated,
    /// `None` when no state is cached.
    PersistentState(Option<Bytes>),
    DownloadToken(DownloadToken),
}

/// A control-transport query.
///
/// `peer: None` routes through the external-client bypass (the subsystem
/// acting as a thin client of another node).
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub peer: Option<PeerId>,
    pub local_id: PeerId,
    pub overlay_id: OverlayId,
    pub query: ControlQuery,
    pub timeout: Duration,
}

/// A bulk-transport query with a payload size cap.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub peer: Option<PeerId>,
    pub local_id: PeerId,
    pub overlay_id: OverlayId,
    pub query: BulkQuery,
    pub timeout: Duration,
    pub max_size: u64,
}

/// A request to the overlay membership layer.
#[derive(Debug, Clone)]
pub enum OverlayRequest {
    GetRandomPeers { overlay_id: OverlayId, count: usize },
}

/// A response from the overlay membership layer.
#[derive(Debug, Clone)]
pub enum OverlayResponse {
    Peers(Vec<PeerId>),
}

pub type ManagerService = BoxCloneService<ManagerRequest, ManagerResponse, tower::BoxError>;
pub type ControlService = BoxCloneService<ControlRequest, ControlResponse, tower::BoxError>;
pub type BulkService = BoxCloneService<BulkRequest, BulkResponse, tower::BoxError>;
pub type OverlayService = BoxCloneService<OverlayRequest, OverlayResponse, tower::BoxError>;
