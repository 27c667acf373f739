//! # Galena Downloader
//!
//! The peer-selection and archive/block download subsystem of a full node:
//! the logic that pulls historical archive slices, individual blocks, block
//! proofs, key-block chains and persistent state snapshots from other nodes
//! on the P2P overlay.
//!
//! Peers come from a noisy, adversarial pool, so every downloader leans on
//! three shared pieces of state:
//!
//! - the [peer quality registry](peer_quality::PeerQualityRegistry), which
//!   remembers per-peer success/failure/usage statistics and derives a
//!   selection score and blacklist state;
//! - the [block availability registry](availability::BlockAvailabilityRegistry),
//!   which backs off seqnos that look unavailable fleet-wide;
//! - the [selector](selector::select_peers), which ranks candidates with an
//!   explore/exploit split and usage-based burden sharing.
//!
//! Each download is one straight-line async task: acquire a token, choose a
//! peer, issue a control query, fetch the payload, validate it, update the
//! registries, deliver the result. Every payload is checked against its
//! expected file hash (or validated as a proof chain) before it is handed
//! over.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use rand::{rngs::StdRng, SeedableRng};
use tower::{Service, ServiceExt};

use galena_types::{BlockHandle, BlockId, OverlayId, PeerId};

pub mod availability;
pub mod capabilities;
pub mod constants;
mod error;
pub mod peer_quality;
pub mod progress;
pub mod protocol;
pub mod selector;
pub mod services;

mod archive;
mod block;
mod key_blocks;
mod next_block;
mod proof;
mod state;

pub use archive::{ArchiveSliceDownload, ArchiveSliceRequest};
pub use block::{BlockDownload, BlockDownloadRequest, ReceivedBlock};
pub use capabilities::{fetch_capabilities, BlockDownloadVariant};
pub use error::{DownloadError, DownloadResult, FailureKind};
pub use key_blocks::{KeyBlockWalk, KeyBlockWalkRequest};
pub use next_block::{NextBlockDownload, NextBlockRequest};
pub use proof::{ProofDownload, ProofKind, ProofRequest};
pub use state::{StateDownload, StateDownloadRequest};

use protocol::{BulkQuery, BulkResponse, ControlQuery, ControlResponse};
use services::{
    BulkRequest, BulkService, ControlRequest, ControlService, DownloadKind, DownloadToken,
    ManagerRequest, ManagerResponse, ManagerService, OverlayRequest, OverlayResponse,
    OverlayService,
};

/// Payload size caps for bulk transport calls.
#[derive(Debug, Copy, Clone)]
pub struct Limits {
    pub max_block_size: u64,
    pub max_proof_size: u64,
    pub max_state_size: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_block_size: constants::MAX_BLOCK_SIZE,
            max_proof_size: constants::MAX_PROOF_SIZE,
            max_state_size: constants::MAX_STATE_SIZE,
        }
    }
}

/// The registries shared by every concurrent download task.
///
/// One instance per process in production; tests instantiate their own.
#[derive(Debug, Default)]
pub struct Registries {
    pub peer_quality: peer_quality::PeerQualityRegistry,
    pub availability: availability::BlockAvailabilityRegistry,
    pub capabilities: capabilities::CapabilityRegistry,
    /// Peers currently carrying out a download, for diagnostics.
    pub active_attempts: Mutex<HashSet<PeerId>>,
}

impl Registries {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

/// Everything a download task needs: the service handles, the shared
/// registries, our identity and the size limits.
#[derive(Clone)]
pub struct DownloaderContext {
    pub local_id: PeerId,
    pub overlay_id: OverlayId,
    pub manager: ManagerService,
    pub control: ControlService,
    pub bulk: BulkService,
    pub overlay: OverlayService,
    /// Route queries through the external-client bypass instead of the
    /// overlay (the subsystem acting as a thin client of another node).
    pub via_client: bool,
    pub registries: Arc<Registries>,
    pub limits: Limits,
    pub progress: progress::ProgressChannel,
}

impl DownloaderContext {
    /// Issues a control query, enforcing `timeout` locally as well.
    pub(crate) async fn control_query(
        &mut self,
        peer: Option<PeerId>,
        query: ControlQuery,
        timeout: Duration,
    ) -> DownloadResult<ControlResponse> {
        let request = ControlRequest {
            peer,
            local_id: self.local_id,
            overlay_id: self.overlay_id,
            query,
            timeout,
        };

        tokio::time::timeout(timeout, async {
            Ok::<_, DownloadError>(self.control.ready().await?.call(request).await?)
        })
        .await
        .map_err(DownloadError::from_elapsed)?
    }

    /// Issues a bulk fetch with a payload size cap.
    pub(crate) async fn bulk_query(
        &mut self,
        peer: Option<PeerId>,
        query: BulkQuery,
        timeout: Duration,
        max_size: u64,
    ) -> DownloadResult<BulkResponse> {
        let request = BulkRequest {
            peer,
            local_id: self.local_id,
            overlay_id: self.overlay_id,
            query,
            timeout,
            max_size,
        };

        tokio::time::timeout(timeout, async {
            Ok::<_, DownloadError>(self.bulk.ready().await?.call(request).await?)
        })
        .await
        .map_err(DownloadError::from_elapsed)?
    }

    /// Asks the overlay for random peers.
    pub(crate) async fn random_peers(&mut self, count: usize) -> DownloadResult<Vec<PeerId>> {
        let request = OverlayRequest::GetRandomPeers {
            overlay_id: self.overlay_id,
            count,
        };

        let OverlayResponse::Peers(peers) = self.overlay.ready().await?.call(request).await?;
        Ok(peers)
    }

    pub(crate) async fn manager_call(
        &mut self,
        request: ManagerRequest,
    ) -> Result<ManagerResponse, tower::BoxError> {
        self.manager.ready().await?.call(request).await
    }

    /// Resolves the local block handle; `None` when it does not exist and
    /// creation was not requested.
    pub(crate) async fn get_block_handle(
        &mut self,
        block_id: BlockId,
        create_if_missing: bool,
    ) -> DownloadResult<Option<BlockHandle>> {
        match self
            .manager_call(ManagerRequest::GetBlockHandle {
                block_id,
                create_if_missing,
            })
            .await?
        {
            ManagerResponse::BlockHandle(handle) => Ok(handle),
            _ => panic!("Manager returned wrong response."),
        }
    }

    /// Runs a proof validation request; a manager error means the proof was
    /// rejected.
    pub(crate) async fn validate_proof(&mut self, request: ManagerRequest) -> DownloadResult<()> {
        match self.manager_call(request).await {
            Ok(ManagerResponse::Validated) => Ok(()),
            Ok(_) => panic!("Manager returned wrong response."),
            Err(error) => {
                tracing::debug!(%error, "proof rejected");
                Err(DownloadError::ProofInvalid)
            }
        }
    }

    /// Acquires a download admission token at the given priority.
    pub(crate) async fn get_download_token(
        &mut self,
        kind: DownloadKind,
        priority: u32,
        deadline: tokio::time::Instant,
    ) -> DownloadResult<DownloadToken> {
        match self
            .manager_call(ManagerRequest::GetDownloadToken {
                kind,
                priority,
                deadline,
            })
            .await?
        {
            ManagerResponse::DownloadToken(token) => Ok(token),
            _ => panic!("Manager returned wrong response."),
        }
    }

    /// Records a failure against the peer, when the error blames one.
    pub(crate) fn note_failure(&self, peer: Option<PeerId>, error: &DownloadError) {
        if let (Some(peer), Some(kind)) = (peer, error.failure_kind()) {
            self.registries.peer_quality.record_failure(peer, kind);
        }
    }

    /// A fresh task-owned RNG. Deterministic tests replace it through the
    /// request structs.
    pub(crate) fn task_rng() -> StdRng {
        StdRng::from_entropy()
    }
}
