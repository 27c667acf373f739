//! # Peer Quality Registry
//!
//! Process-wide record of how well each peer has served us: success and
//! failure counters, usage accounting for burden sharing, download speed,
//! and the derived score/blacklist state the [selector](crate::selector)
//! ranks peers by.
//!
//! All mutations go through [`PeerQualityRegistry::record_success`],
//! [`PeerQualityRegistry::record_failure`] and
//! [`PeerQualityRegistry::record_usage`] so the counter invariants hold by
//! construction. Derived values are pure functions of a record plus a `now`
//! instant and may be computed on slightly stale snapshots.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;

use galena_types::PeerId;

use crate::{
    constants::{
        BLACKLIST_CONSECUTIVE, BLACKLIST_DEFAULT, BLACKLIST_NOT_FOUND, BLACKLIST_UNRELIABLE,
        FAILURE_PENALTY_WINDOW, OVERUSE_THRESHOLD, RECENT_USAGE_WINDOW, SPEED_BONUS_DIVISOR,
        USAGE_DEBOUNCE,
    },
    error::FailureKind,
};

/// Everything we remember about one peer.
///
/// Records are created lazily on first observation and kept for the life of
/// the process.
#[derive(Debug, Clone)]
pub struct PeerQuality {
    pub successes: u32,
    pub failures: u32,
    /// How many of the failures were "archive not found" replies.
    pub archive_not_found_count: u32,
    /// Failures since the last success.
    pub consecutive_failures: u32,

    pub first_seen: Instant,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub last_used: Option<Instant>,

    pub usage_count: u32,
    pub recent_usage_count: u32,
    pub recent_usage_window_start: Option<Instant>,

    /// Running mean download speed over successful downloads, bytes/sec.
    pub avg_speed: f64,
    /// Total seconds spent in successful downloads.
    pub total_download_time: f64,
}

impl PeerQuality {
    fn new(now: Instant) -> Self {
        Self {
            successes: 0,
            failures: 0,
            archive_not_found_count: 0,
            consecutive_failures: 0,
            first_seen: now,
            last_success: None,
            last_failure: None,
            last_used: None,
            usage_count: 0,
            recent_usage_count: 0,
            recent_usage_window_start: None,
            avg_speed: 0.0,
            total_download_time: 0.0,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.successes + self.failures
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_attempts() == 0 {
            return 0.0;
        }
        f64::from(self.successes) / f64::from(self.total_attempts())
    }

    /// A peer with fewer than 3 attempts is still being explored.
    pub fn is_new_node(&self) -> bool {
        self.total_attempts() < 3
    }

    /// Whether the peer was leaned on too much inside the current usage
    /// window.
    pub fn is_overused(&self, now: Instant) -> bool {
        let Some(window_start) = self.recent_usage_window_start else {
            return false;
        };
        now.duration_since(window_start) <= RECENT_USAGE_WINDOW
            && self.recent_usage_count > OVERUSE_THRESHOLD
    }

    /// The burden-sharing penalty applied to recently used peers.
    pub fn usage_penalty(&self, now: Instant) -> f64 {
        let mut penalty = 0.0;

        if let Some(last_used) = self.last_used {
            let since_use = now.duration_since(last_used);
            if since_use < Duration::from_secs(300) {
                penalty += 0.3;
            } else if since_use < Duration::from_secs(900) {
                penalty += 0.2;
            } else if since_use < Duration::from_secs(1800) {
                penalty += 0.1;
            }
        }

        if self.is_overused(now) {
            penalty += 0.4;
        }

        penalty
    }

    /// The selection score, in `[0, 1]`.
    pub fn score(&self, now: Instant) -> f64 {
        if self.total_attempts() == 0 {
            return 0.5;
        }

        let base = self.success_rate();

        let exploration_bonus = if self.is_new_node() && self.successes > 0 {
            0.1
        } else if self.total_attempts() < 10 && self.success_rate() >= 0.5 {
            0.05
        } else {
            0.0
        };

        let mut time_penalty = 0.0;
        if self.failures > 0 {
            if let Some(last_failure) = self.last_failure {
                if now.duration_since(last_failure) < FAILURE_PENALTY_WINDOW {
                    time_penalty = 0.2;
                    if self.consecutive_failures >= 3 {
                        time_penalty += 0.15;
                    }
                    // Data gaps are not misbehavior, soften the penalty.
                    if f64::from(self.archive_not_found_count) > f64::from(self.failures) * 0.8 {
                        time_penalty *= 0.7;
                    }
                }
            }
        }

        let success_penalty = if self.total_attempts() >= 3 && self.success_rate() < 0.2 {
            0.3
        } else {
            0.0
        };

        let speed_bonus = if self.successes > 0 {
            (self.avg_speed / SPEED_BONUS_DIVISOR).min(0.15)
        } else {
            0.0
        };

        (base + exploration_bonus - time_penalty - success_penalty + speed_bonus
            - self.usage_penalty(now))
        .clamp(0.0, 1.0)
    }

    /// Whether the peer is currently excluded from selection.
    pub fn is_blacklisted(&self, now: Instant) -> bool {
        let since_failure = |window: Duration| {
            self.last_failure
                .is_some_and(|at| now.duration_since(at) < window)
        };

        if self.consecutive_failures >= 3 {
            return since_failure(BLACKLIST_CONSECUTIVE);
        }

        if self.failures < 3 {
            return false;
        }

        if self.successes * 2 > self.failures {
            return false;
        }

        let mut window = BLACKLIST_DEFAULT;
        if f64::from(self.archive_not_found_count) > f64::from(self.failures) * 0.7 {
            window = BLACKLIST_NOT_FOUND;
        }
        if self.success_rate() < 0.1 && self.total_attempts() >= 5 {
            window = BLACKLIST_UNRELIABLE;
        }

        since_failure(window)
    }
}

/// One line of the burden-sharing diagnostic summary.
#[derive(Debug, Clone)]
pub struct UsageSummaryEntry {
    pub peer: PeerId,
    pub usage_count: u32,
    pub recent_usage_count: u32,
    pub success_rate: f64,
    pub overused: bool,
}

/// The process-wide peer quality store.
///
/// Shared by every concurrent download task; a single lock serializes
/// per-record updates.
#[derive(Debug, Default)]
pub struct PeerQualityRegistry {
    peers: Mutex<HashMap<PeerId, PeerQuality>>,
}

impl PeerQualityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of the peer's record, creating a fresh one (with
    /// `first_seen = now`) if the peer was never observed.
    pub fn get_or_create(&self, peer: PeerId) -> PeerQuality {
        let now = Instant::now();
        self.peers
            .lock()
            .unwrap()
            .entry(peer)
            .or_insert_with(|| {
                tracing::info!(%peer, "discovered new peer");
                PeerQuality::new(now)
            })
            .clone()
    }

    /// Returns a snapshot of the peer's record, if one exists.
    pub fn get(&self, peer: PeerId) -> Option<PeerQuality> {
        self.peers.lock().unwrap().get(&peer).cloned()
    }

    /// Records a completed download of `bytes` bytes over `elapsed`.
    ///
    /// Resets `consecutive_failures` and folds the observed speed into the
    /// success-weighted running mean.
    pub fn record_success(&self, peer: PeerId, bytes: u64, elapsed: Duration) {
        let now = Instant::now();
        let mut peers = self.peers.lock().unwrap();
        let quality = peers.entry(peer).or_insert_with(|| PeerQuality::new(now));

        quality.successes += 1;
        quality.consecutive_failures = 0;
        quality.last_success = Some(now);

        let download_time = if elapsed > Duration::ZERO {
            elapsed.as_secs_f64()
        } else {
            1.0
        };
        let speed = bytes as f64 / download_time;

        if quality.successes == 1 {
            quality.avg_speed = speed;
            quality.total_download_time = download_time;
        } else {
            quality.total_download_time += download_time;
            quality.avg_speed = (quality.avg_speed * f64::from(quality.successes - 1) + speed)
                / f64::from(quality.successes);
        }

        tracing::info!(
            %peer,
            score = quality.score(now),
            success_rate = quality.success_rate(),
            attempts = quality.total_attempts(),
            speed = %galena_helper::fmt::as_size(speed as u64),
            "peer success",
        );
    }

    /// Records a failed download of the given kind.
    pub fn record_failure(&self, peer: PeerId, kind: FailureKind) {
        let now = Instant::now();
        let mut peers = self.peers.lock().unwrap();
        let quality = peers.entry(peer).or_insert_with(|| PeerQuality::new(now));

        quality.failures += 1;
        quality.consecutive_failures += 1;
        quality.last_failure = Some(now);
        if kind == FailureKind::ArchiveNotFound {
            quality.archive_not_found_count += 1;
        }

        tracing::warn!(
            %peer,
            ?kind,
            score = quality.score(now),
            consecutive_failures = quality.consecutive_failures,
            "peer failure",
        );
    }

    /// Records that the peer was committed to for a download.
    ///
    /// Advances (or resets) the rolling usage window. A repeat call within
    /// [`USAGE_DEBOUNCE`] is a duplicate of the commit-time record and is
    /// dropped; returns whether the usage was counted.
    pub fn record_usage(&self, peer: PeerId) -> bool {
        let now = Instant::now();
        let mut peers = self.peers.lock().unwrap();
        let quality = peers.entry(peer).or_insert_with(|| PeerQuality::new(now));

        if quality
            .last_used
            .is_some_and(|at| now.duration_since(at) <= USAGE_DEBOUNCE)
        {
            return false;
        }

        quality.usage_count += 1;
        quality.last_used = Some(now);

        let window_expired = quality
            .recent_usage_window_start
            .is_none_or(|start| now.duration_since(start) > RECENT_USAGE_WINDOW);
        if window_expired {
            quality.recent_usage_count = 1;
            quality.recent_usage_window_start = Some(now);
        } else {
            quality.recent_usage_count += 1;
        }

        true
    }

    /// Peers that have earned trust: high success rate over at least two
    /// attempts and not currently blacklisted.
    pub fn known_good_peers(&self, now: Instant) -> Vec<PeerId> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, q)| {
                !q.is_blacklisted(now) && q.success_rate() >= 0.7 && q.total_attempts() >= 2
            })
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// The top `n` peers by usage count, for burden-sharing diagnostics.
    pub fn usage_summary(&self, n: usize) -> Vec<UsageSummaryEntry> {
        let now = Instant::now();
        let mut entries = self
            .peers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, q)| q.total_attempts() > 0)
            .map(|(peer, q)| UsageSummaryEntry {
                peer: *peer,
                usage_count: q.usage_count,
                recent_usage_count: q.recent_usage_count,
                success_rate: q.success_rate(),
                overused: q.is_overused(now),
            })
            .collect::<Vec<_>>();

        entries.sort_by(|a, b| b.usage_count.cmp(&a.usage_count));
        entries.truncate(n);
        entries
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn peer(byte: u8) -> PeerId {
        PeerId::new([byte; 32])
    }

    /// `successes + failures == total_attempts` under any operation
    /// sequence, and `record_success` zeroes the consecutive counter.
    #[test]
    fn counter_laws() {
        proptest!(|(ops in proptest::collection::vec(any::<bool>(), 0..64))| {
            let registry = PeerQualityRegistry::new();
            let mut successes = 0_u32;
            let mut failures = 0_u32;
            let mut consecutive = 0_u32;

            for success in ops {
                if success {
                    registry.record_success(peer(1), 1024, Duration::from_secs(1));
                    successes += 1;
                    consecutive = 0;
                } else {
                    registry.record_failure(peer(1), FailureKind::Generic);
                    failures += 1;
                    consecutive += 1;
                }

                let q = registry.get(peer(1)).unwrap();
                prop_assert_eq!(q.successes, successes);
                prop_assert_eq!(q.failures, failures);
                prop_assert_eq!(q.total_attempts(), successes + failures);
                prop_assert_eq!(q.consecutive_failures, consecutive);
            }
        });
    }

    /// A blacklisted peer always unblacklists once the window passes with
    /// no further failures.
    #[tokio::test(start_paused = true)]
    async fn blacklist_expires() {
        let registry = PeerQualityRegistry::new();
        for _ in 0..3 {
            registry.record_failure(peer(2), FailureKind::Generic);
        }

        let q = registry.get(peer(2)).unwrap();
        assert!(q.is_blacklisted(Instant::now()));

        tokio::time::advance(BLACKLIST_CONSECUTIVE).await;
        assert!(!q.is_blacklisted(Instant::now()));
    }

    /// The extended window applies to peers that almost never succeed.
    #[tokio::test(start_paused = true)]
    async fn unreliable_peers_blacklist_longer() {
        let registry = PeerQualityRegistry::new();
        registry.record_success(peer(3), 1024, Duration::from_secs(1));
        for _ in 0..19 {
            registry.record_failure(peer(3), FailureKind::Generic);
        }

        let q = registry.get(peer(3)).unwrap();
        assert!(q.success_rate() < 0.1);

        // The consecutive-failure window has lapsed, the unreliable-peer
        // window has not.
        tokio::time::advance(BLACKLIST_DEFAULT).await;
        assert!(q.is_blacklisted(Instant::now()));

        tokio::time::advance(BLACKLIST_UNRELIABLE - BLACKLIST_DEFAULT).await;
        assert!(!q.is_blacklisted(Instant::now()));
    }

    /// `score` stays in `[0, 1]` for any reachable state.
    #[test]
    fn score_is_bounded() {
        proptest!(|(
            successes in 0_u32..100,
            failures in 0_u32..100,
            not_found in 0_u32..100,
            used in any::<bool>(),
            speed in 0.0_f64..1e9,
        )| {
            let now = Instant::now();
            let mut q = PeerQuality::new(now);
            q.successes = successes;
            q.failures = failures;
            q.archive_not_found_count = not_found.min(failures);
            q.consecutive_failures = failures.min(5);
            q.last_failure = (failures > 0).then_some(now);
            q.last_used = used.then_some(now);
            q.avg_speed = speed;

            let score = q.score(now);
            prop_assert!((0.0..=1.0).contains(&score));
        });
    }

    /// Unknown peers score exactly 0.5 and `first_seen` is set once.
    #[tokio::test(start_paused = true)]
    async fn fresh_record_defaults() {
        let registry = PeerQualityRegistry::new();

        let created = registry.get_or_create(peer(4));
        assert_eq!(created.score(Instant::now()), 0.5);
        assert_eq!(created.total_attempts(), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        let again = registry.get_or_create(peer(4));
        assert_eq!(again.first_seen, created.first_seen);
    }

    /// The usage window resets after an hour: touches at `t`, `t + 1s` and
    /// `t + 3601s` leave a single recent use with the window restarted.
    #[tokio::test(start_paused = true)]
    async fn usage_window_reset() {
        let registry = PeerQualityRegistry::new();

        assert!(registry.record_usage(peer(5)));
        tokio::time::advance(Duration::from_secs(1)).await;
        // Within the debounce window the touch would be dropped, but one
        // second on the dot is the boundary.
        assert!(!registry.record_usage(peer(5)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(registry.record_usage(peer(5)));

        tokio::time::advance(Duration::from_secs(3600)).await;
        let window_reset_at = Instant::now();
        assert!(registry.record_usage(peer(5)));

        let q = registry.get(peer(5)).unwrap();
        assert_eq!(q.recent_usage_count, 1);
        assert_eq!(q.recent_usage_window_start, Some(window_reset_at));
        assert_eq!(q.usage_count, 3);
        assert!(q.usage_count >= q.recent_usage_count);
    }

    /// Speed aggregates form a success-weighted running mean.
    #[test]
    fn avg_speed_running_mean() {
        let registry = PeerQualityRegistry::new();
        registry.record_success(peer(6), 1_000_000, Duration::from_secs(1));
        registry.record_success(peer(6), 3_000_000, Duration::from_secs(1));

        let q = registry.get(peer(6)).unwrap();
        assert!((q.avg_speed - 2_000_000.0).abs() < 1.0);
        assert!((q.total_download_time - 2.0).abs() < f64::EPSILON);
    }
}
