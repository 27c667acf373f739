//! Download progress reporting.
//!
//! Long downloads publish periodic "bytes so far, speed" lines on a
//! text-keyed channel for whoever renders node status, and mirror them to
//! the log. [`ProgressTracker`] owns the rate limiting: one update per
//! configured interval at most.

use std::{fmt, time::Duration};

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::Instant,
};

use galena_helper::fmt::as_size;

/// One progress line.
#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// The status key, e.g. `"download_archive_slice"`.
    pub key: &'static str,
    /// What is being downloaded.
    pub target: String,
    pub bytes: u64,
    /// Advisory total, when the remote announced one.
    pub total: Option<u64>,
    /// Instantaneous speed since the previous update, bytes/sec.
    pub speed_bps: u64,
}

impl fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.target, as_size(self.bytes))?;
        if let Some(total) = self.total {
            write!(f, "/{}", as_size(total))?;
        }
        write!(f, " ({}/s", as_size(self.speed_bps))?;
        if let Some(total) = self.total.filter(|total| *total > 0) {
            let percent = self.bytes as f64 / total as f64 * 100.0;
            write!(f, ", {percent:.2}%")?;
            if self.speed_bps > 0 && total >= self.bytes {
                let remaining = (total - self.bytes) / self.speed_bps;
                write!(f, ", {remaining}s remaining")?;
            }
        }
        write!(f, ")")
    }
}

/// The publishing side of the status channel. Cheap to clone; a disabled
/// channel only logs.
#[derive(Debug, Clone, Default)]
pub struct ProgressChannel {
    tx: Option<UnboundedSender<ProgressUpdate>>,
}

impl ProgressChannel {
    /// A connected channel plus its receiving end.
    pub fn new() -> (Self, UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A channel that only logs.
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, update: ProgressUpdate) {
        tracing::info!(key = update.key, "{update}");
        if let Some(tx) = &self.tx {
            let _ = tx.send(update);
        }
    }
}

/// Rate-limited progress accounting for a single download.
#[derive(Debug)]
pub struct ProgressTracker {
    key: &'static str,
    target: String,
    interval: Duration,
    started: Instant,
    last_logged: Instant,
    last_logged_bytes: u64,
}

impl ProgressTracker {
    pub fn new(key: &'static str, target: String, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            key,
            target,
            interval,
            started: now,
            last_logged: now,
            last_logged_bytes: 0,
        }
    }

    /// Total elapsed time since the tracker was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Publishes an update if at least one interval passed since the last
    /// one. Returns whether an update went out.
    pub fn tick(&mut self, channel: &ProgressChannel, bytes: u64, total: Option<u64>) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_logged);
        if elapsed < self.interval {
            return false;
        }

        let speed_bps = ((bytes - self.last_logged_bytes) as f64 / elapsed.as_secs_f64()) as u64;
        channel.publish(ProgressUpdate {
            key: self.key,
            target: self.target.clone(),
            bytes,
            total,
            speed_bps,
        });

        self.last_logged = now;
        self.last_logged_bytes = bytes;
        true
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn display_with_total() {
        let update = ProgressUpdate {
            key: "download_state",
            target: "(0:8000000000000000, 5)".into(),
            bytes: 2 * 1024 * 1024,
            total: Some(8 * 1024 * 1024),
            speed_bps: 1024 * 1024,
        };

        assert_eq!(
            update.to_string(),
            "(0:8000000000000000, 5): 2.00 MiB/8.00 MiB (1.00 MiB/s, 25.00%, 6s remaining)"
        );
    }

    #[test]
    fn display_without_total() {
        let update = ProgressUpdate {
            key: "download_archive_slice",
            target: "archive #42".into(),
            bytes: 512,
            total: None,
            speed_bps: 256,
        };

        assert_eq!(update.to_string(), "archive #42: 512 B (256 B/s)");
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_rate_limits() {
        let (channel, mut rx) = ProgressChannel::new();
        let mut tracker =
            ProgressTracker::new("test", "t".into(), Duration::from_secs(3));

        assert!(!tracker.tick(&channel, 100, None));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(tracker.tick(&channel, 400, None));

        let update = rx.try_recv().unwrap();
        assert_eq!(update.bytes, 400);
        // Speed counts from the last published update (none yet), not from
        // the suppressed tick.
        assert_eq!(update.speed_bps, 133);
    }
}
