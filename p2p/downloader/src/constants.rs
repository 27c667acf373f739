use std::time::Duration;

/// The chunk size used by archive and persistent-state downloads.
pub const SLICE_SIZE: u64 = 2 * 1024 * 1024;

/// The timeout for the `get_archive_info` control query.
pub(crate) const ARCHIVE_INFO_TIMEOUT: Duration = Duration::from_secs(2);

/// `get_archive_info` timeout when going through the external client.
pub(crate) const ARCHIVE_INFO_CLIENT_TIMEOUT: Duration = Duration::from_secs(1);

/// The timeout for a single `get_archive_slice` bulk query.
pub(crate) const ARCHIVE_SLICE_TIMEOUT: Duration = Duration::from_secs(25);

/// `get_archive_slice` timeout when going through the external client.
pub(crate) const ARCHIVE_SLICE_CLIENT_TIMEOUT: Duration = Duration::from_secs(20);

/// The timeout for small control queries (prepare, descriptions, key block ids).
pub(crate) const CONTROL_QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// The timeout for proof and full-block bulk fetches.
pub(crate) const PROOF_QUERY_TIMEOUT: Duration = Duration::from_secs(3);

/// The timeout for a block data bulk fetch.
pub(crate) const BLOCK_QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// The timeout for a persistent-state slice bulk fetch.
pub(crate) const STATE_SLICE_TIMEOUT: Duration = Duration::from_secs(20);

/// Minimum wall-clock time between archive download progress reports.
pub(crate) const PROGRESS_LOG_INTERVAL_ARCHIVE: Duration = Duration::from_secs(3);

/// Minimum wall-clock time between state download progress reports.
pub(crate) const PROGRESS_LOG_INTERVAL_STATE: Duration = Duration::from_secs(5);

/// The cap on ids per `get_next_key_block_ids` query.
pub const KEY_BLOCK_WALK_LIMIT: u32 = 8;

/// How many random peers to ask the overlay for on the first attempt.
pub(crate) const OVERLAY_PEERS_INITIAL: usize = 6;

/// How many random peers to ask for when the first batch was unusable.
pub(crate) const OVERLAY_PEERS_FALLBACK: usize = 12;

/// How many candidates the peer selector is asked to rank for archives.
pub(crate) const ARCHIVE_SELECT_COUNT: usize = 3;

/// The percentage chance of exploiting a known-good peer instead of
/// exploring the overlay.
pub(crate) const EXPLOIT_KNOWN_PEER_PERCENT: u32 = 60;

/// Size of the randomized pick window among top-scored known-good peers.
pub(crate) const KNOWN_PEER_PICK_WINDOW: usize = 5;

/// A peer idle for at least this long counts as lightly used.
pub(crate) const LIGHTLY_USED_IDLE: Duration = Duration::from_secs(900);

/// The rolling window for recent-usage accounting.
pub(crate) const RECENT_USAGE_WINDOW: Duration = Duration::from_secs(3600);

/// More than this many uses inside [`RECENT_USAGE_WINDOW`] marks a peer
/// as overused.
pub(crate) const OVERUSE_THRESHOLD: u32 = 3;

/// A second `record_usage` within this window is a duplicate of the
/// commit-time one and is suppressed.
pub(crate) const USAGE_DEBOUNCE: Duration = Duration::from_secs(1);

/// How long a recent failure keeps penalizing a peer's score.
pub(crate) const FAILURE_PENALTY_WINDOW: Duration = Duration::from_secs(1800);

/// Blacklist window after three or more consecutive failures.
pub(crate) const BLACKLIST_CONSECUTIVE: Duration = Duration::from_secs(1800);

/// Default blacklist window.
pub(crate) const BLACKLIST_DEFAULT: Duration = Duration::from_secs(1800);

/// Shorter blacklist window when most failures were "archive not found",
/// the peer is healthy and merely lacks the data.
pub(crate) const BLACKLIST_NOT_FOUND: Duration = Duration::from_secs(900);

/// Extended blacklist window for peers that almost never succeed.
pub(crate) const BLACKLIST_UNRELIABLE: Duration = Duration::from_secs(3600);

/// Every downloaded byte per second up to this grants speed bonus score.
pub(crate) const SPEED_BONUS_DIVISOR: f64 = 8_000_000.0;

/// Recent "not found" replies within this window feed the availability
/// back-off.
pub(crate) const AVAILABILITY_WINDOW: Duration = Duration::from_secs(300);

/// The longest availability back-off delay.
pub(crate) const AVAILABILITY_MAX_DELAY: Duration = Duration::from_secs(300);

/// Back-off delay granted per recorded "not found" reply.
pub(crate) const AVAILABILITY_DELAY_PER_MISS: Duration = Duration::from_secs(30);

/// Every this many archive successes, a burden-sharing usage summary is
/// logged.
pub(crate) const USAGE_SUMMARY_EVERY: u32 = 5;

/// Default cap for a single block payload.
pub const MAX_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Default cap for a proof or proof-link payload.
pub const MAX_PROOF_SIZE: u64 = 4 * 1024 * 1024;

/// Default cap for a full persistent-state payload.
pub const MAX_STATE_SIZE: u64 = 4 * 1024 * 1024 * 1024;
