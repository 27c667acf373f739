/// An error that terminated a download task.
///
/// Every task delivers exactly one outcome: the payload on success or one of
/// these on failure. Which variant a failure maps to also decides how the
/// peer is treated in the quality registry, see [`DownloadError::failure_kind`].
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("The task's deadline elapsed.")]
    Timeout,
    #[error("The target data is absent on this peer or is backed off.")]
    NotReady,
    #[error("The peer's reply was unparseable or semantically invalid.")]
    Protocol,
    #[error("The downloaded payload does not match the expected file hash.")]
    IntegrityMismatch,
    #[error("The validator rejected the downloaded proof.")]
    ProofInvalid,
    #[error("The caller dropped the result sink.")]
    Cancelled,
    #[error("No usable peers: the overlay or the selector came up empty.")]
    ResourceExhausted,
    #[error("Temp file I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Service error: {0}")]
    Service(#[from] tower::BoxError),
}

/// How a failure is recorded against the peer that served the download.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Any failure that reflects on the peer's reliability.
    Generic,
    /// The peer answered correctly but does not hold the archive. Tracked
    /// separately so data gaps blacklist more gently than misbehavior.
    ArchiveNotFound,
}

impl DownloadError {
    /// The registry bookkeeping this error calls for, if any.
    ///
    /// [`Cancelled`](Self::Cancelled) and
    /// [`ResourceExhausted`](Self::ResourceExhausted) never blame a peer.
    pub(crate) fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Timeout
            | Self::NotReady
            | Self::Protocol
            | Self::IntegrityMismatch
            | Self::ProofInvalid
            | Self::Io(_)
            | Self::Service(_) => Some(FailureKind::Generic),
            Self::Cancelled | Self::ResourceExhausted => None,
        }
    }
}

/// The outcome type every downloader resolves to.
pub type DownloadResult<T> = Result<T, DownloadError>;

impl DownloadError {
    /// Maps a `tokio::time::timeout` expiry onto the task deadline error.
    pub(crate) fn from_elapsed(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
