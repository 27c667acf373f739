//! The queries downloaders issue and the replies they expect.
//!
//! These are the subsystem-internal shapes of the §wire protocol; the
//! transport layer owns the actual serialization. Control queries travel
//! over the overlay's small-query channel, bulk queries over the reliable
//! large-datagram transport with an explicit size cap.

use bytes::Bytes;

use galena_types::{BlockId, PeerCapabilities, Seqno, ShardIdent};

/// A small control query, round trips in about a second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlQuery {
    /// Asks whether the peer holds the archive slice covering a
    /// masterchain seqno for the given shard.
    GetArchiveInfo { mc_seqno: Seqno, shard: ShardIdent },
    /// Asks the peer to stage block data for download.
    PrepareBlock(BlockId),
    /// Asks the peer to stage a proof; `allow_partial` admits proof links.
    PrepareBlockProof {
        block_id: BlockId,
        allow_partial: bool,
    },
    /// Asks for the id of the block following `BlockId`.
    GetNextBlockDescription(BlockId),
    /// Asks for up to `max` key-block ids following the anchor.
    GetNextKeyBlockIds { block_id: BlockId, max: u32 },
    /// Asks the peer to stage a persistent state snapshot.
    PreparePersistentState {
        block_id: BlockId,
        mc_block_id: BlockId,
    },
    /// Asks the peer to stage the zero state.
    PrepareZeroState(BlockId),
    /// Advisory query for the staged state's size.
    GetPersistentStateSize {
        block_id: BlockId,
        mc_block_id: BlockId,
    },
    /// Capability ping.
    GetCapabilities,
}

/// The reply to a [`ControlQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    /// The archive exists; `id` keys subsequent slice fetches.
    ArchiveInfo { id: u64 },
    ArchiveNotFound,
    Prepared,
    NotFound,
    PreparedProof,
    PreparedProofLink,
    ProofEmpty,
    /// `None` when the peer does not know a successor.
    NextBlockDescription(Option<BlockId>),
    KeyBlockIds { ids: Vec<BlockId>, error: bool },
    PreparedState,
    NotFoundState,
    PersistentStateSize(u64),
    Capabilities(PeerCapabilities),
}

/// A bulk fetch over the reliable large-datagram transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkQuery {
    GetArchiveSlice {
        archive_id: u64,
        offset: u64,
        max_size: u64,
    },
    DownloadBlock(BlockId),
    DownloadBlockProof(BlockId),
    DownloadBlockProofLink(BlockId),
    /// One-round-trip block fetch: data and proof together.
    DownloadBlockFull(BlockId),
    /// Like [`BulkQuery::DownloadBlockFull`] but keyed by the predecessor.
    DownloadNextBlockFull(BlockId),
    DownloadPersistentStateSlice {
        block_id: BlockId,
        mc_block_id: BlockId,
        offset: u64,
        max_size: u64,
    },
    DownloadZeroState(BlockId),
}

/// The reply to a [`BulkQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkResponse {
    /// Raw payload bytes, at most the request's size cap.
    Data(Bytes),
    /// The combined reply to the full-block queries.
    BlockFull {
        id: BlockId,
        block: Bytes,
        proof: Bytes,
        is_link: bool,
    },
    /// The peer does not hold the requested data.
    Empty,
}
