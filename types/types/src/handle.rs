use crate::block_id::BlockId;

/// A snapshot of the local descriptor of a block's state.
///
/// Handles are owned by the validator manager; the download subsystem only
/// ever sees point-in-time copies and re-reads them after manager calls that
/// may have advanced the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHandle {
    pub id: BlockId,
    /// Block data has been received and stored.
    pub has_data: bool,
    /// A full proof has been validated for this block.
    pub has_proof: bool,
    /// A proof link has been validated for this block.
    pub has_proof_link: bool,
    /// The block's header designates it as a validator-set change point.
    pub is_key_block: bool,
    /// The id of the canonical (left) successor, if known locally.
    pub next_left: Option<BlockId>,
}

impl BlockHandle {
    /// A handle for a block nothing is known about yet.
    pub const fn new(id: BlockId) -> Self {
        Self {
            id,
            has_data: false,
            has_proof: false,
            has_proof_link: false,
            is_key_block: false,
            next_left: None,
        }
    }

    /// Whether the proof state satisfies the given proof policy.
    ///
    /// Masterchain blocks require a full proof; elsewhere a proof link is
    /// acceptable (`allow_partial`).
    pub const fn has_acceptable_proof(&self, allow_partial: bool) -> bool {
        self.has_proof || (allow_partial && self.has_proof_link)
    }
}
