/// A peer's advertised protocol version and capability flags.
///
/// Exchanged opportunistically via the `get_capabilities` overlay query.
/// Absence of a record never blocks a download, callers fall back to the
/// legacy protocol.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PeerCapabilities {
    pub version: u32,
    pub flags: u64,
}

impl PeerCapabilities {
    /// The version and flags this node advertises.
    pub const OURS: Self = Self {
        version: 1,
        flags: 0,
    };

    /// Whether the peer understands the one-round-trip block download
    /// queries (`download_block_full` / `download_next_block_full`).
    pub const fn supports_full_block_download(&self) -> bool {
        self.version >= 1
    }
}
