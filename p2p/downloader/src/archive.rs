//! # Archive-Slice Downloader
//!
//! Streams one archive slice (multi-MB) into a temp file, 2 MiB chunks at a
//! time, from a single chosen peer.
//!
//! Peer choice is where the explore/exploit policy lives: with known-good
//! peers available the task usually sticks with one of them (preferring
//! lightly used ones for burden sharing), otherwise it samples random
//! overlay peers through the selector. A seqno that keeps coming back "not
//! found" fleet-wide defers before touching the network at all.

use std::{path::PathBuf, sync::Arc};

use rand::{rngs::StdRng, Rng};
use tokio::time::Instant;
use tracing::instrument;

use galena_helper::fs::TempFile;
use galena_types::{PeerId, Seqno, ShardIdent};

use crate::{
    constants::{
        ARCHIVE_INFO_CLIENT_TIMEOUT, ARCHIVE_INFO_TIMEOUT, ARCHIVE_SELECT_COUNT,
        ARCHIVE_SLICE_CLIENT_TIMEOUT, ARCHIVE_SLICE_TIMEOUT, EXPLOIT_KNOWN_PEER_PERCENT,
        KNOWN_PEER_PICK_WINDOW, LIGHTLY_USED_IDLE, OVERLAY_PEERS_FALLBACK, OVERLAY_PEERS_INITIAL,
        PROGRESS_LOG_INTERVAL_ARCHIVE, SLICE_SIZE, USAGE_SUMMARY_EVERY,
    },
    error::{DownloadError, DownloadResult, FailureKind},
    progress::ProgressTracker,
    protocol::{BulkQuery, BulkResponse, ControlQuery, ControlResponse},
    selector::select_peers,
    services::DownloadKind,
    DownloaderContext, Registries,
};

/// Parameters of one archive-slice download.
#[derive(Debug)]
pub struct ArchiveSliceRequest {
    pub mc_seqno: Seqno,
    pub shard: ShardIdent,
    /// Directory the temp file is created in.
    pub temp_dir: PathBuf,
    /// An explicit peer to download from, skipping selection.
    pub peer: Option<PeerId>,
    pub priority: u32,
    pub deadline: Instant,
    /// Task RNG override for deterministic tests.
    pub rng: Option<StdRng>,
}

/// One archive-slice download task. Runs to completion exactly once and
/// resolves to the path of the downloaded file.
pub struct ArchiveSliceDownload {
    request: ArchiveSliceRequest,
    ctx: DownloaderContext,
    rng: StdRng,
    peer: Option<PeerId>,
    /// Erases the peer from `active_attempts` however the task ends.
    active_attempt: Option<ActiveAttempt>,
    /// Set when the peer answered "archive not found", to classify the
    /// failure and feed the availability registry.
    not_found: bool,
}

/// Membership in the `active_attempts` diagnostic set, released on drop so
/// cancelled tasks do not leak entries.
struct ActiveAttempt {
    peer: PeerId,
    registries: Arc<Registries>,
}

impl ActiveAttempt {
    fn insert(peer: PeerId, registries: Arc<Registries>) -> Self {
        registries.active_attempts.lock().unwrap().insert(peer);
        Self { peer, registries }
    }
}

impl Drop for ActiveAttempt {
    fn drop(&mut self) {
        self.registries.active_attempts.lock().unwrap().remove(&self.peer);
    }
}

/// What a finished slice loop hands back to the bookkeeping wrapper.
struct Downloaded {
    file: TempFile,
    bytes: u64,
    elapsed: std::time::Duration,
}

impl ArchiveSliceDownload {
    pub fn new(mut request: ArchiveSliceRequest, ctx: DownloaderContext) -> Self {
        let rng = request
            .rng
            .take()
            .unwrap_or_else(DownloaderContext::task_rng);
        Self {
            request,
            ctx,
            rng,
            peer: None,
            active_attempt: None,
            not_found: false,
        }
    }

    #[instrument(
        level = "info",
        name = "download_archive_slice",
        skip_all,
        fields(seqno = self.request.mc_seqno, shard = %self.request.shard)
    )]
    pub async fn run(mut self) -> DownloadResult<PathBuf> {
        let deadline = self.request.deadline;

        let result = match tokio::time::timeout_at(deadline, self.run_inner()).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout),
        };

        self.finish(result).await
    }

    async fn run_inner(&mut self) -> DownloadResult<Downloaded> {
        let file = TempFile::create_in(&self.request.temp_dir).await?;

        // Availability gate: if this seqno looks unavailable fleet-wide,
        // defer once instead of hammering more peers. The delay is read
        // before this attempt is counted, so the gate reflects only
        // completed attempts.
        let seqno = self.request.mc_seqno;
        let delay = self.ctx.registries.availability.recommended_delay(seqno);
        self.ctx.registries.availability.note_attempt(seqno);
        if delay > std::time::Duration::ZERO {
            tracing::warn!(?delay, "seqno looks unavailable fleet-wide, deferring");
            tokio::time::sleep(delay).await;
        }

        let _token = self
            .ctx
            .get_download_token(
                DownloadKind::ArchiveSlice,
                self.request.priority,
                self.request.deadline,
            )
            .await?;

        let peer = self.choose_peer().await?;
        self.commit_peer(peer)?;

        let archive_id = self.fetch_archive_info(peer).await?;
        self.fetch_slices(peer, archive_id, file).await
    }

    /// Picks the peer to download from.
    ///
    /// An explicit peer or the external-client bypass short-circuits.
    /// Otherwise: with known-good peers on record, a weighted coin decides
    /// between exploiting one of them and exploring the overlay.
    async fn choose_peer(&mut self) -> DownloadResult<Option<PeerId>> {
        if let Some(peer) = self.request.peer {
            return Ok(Some(peer));
        }
        if self.ctx.via_client {
            return Ok(None);
        }

        let now = Instant::now();
        let registry = &self.ctx.registries.peer_quality;
        let known_good = registry.known_good_peers(now);

        if !known_good.is_empty()
            && self.rng.gen_range(1..=100) <= EXPLOIT_KNOWN_PEER_PERCENT
        {
            let available: Vec<PeerId> = known_good
                .iter()
                .copied()
                .filter(|&peer| {
                    registry
                        .get(peer)
                        .is_some_and(|q| !q.is_overused(now))
                })
                .collect();

            let lightly_used: Vec<PeerId> = available
                .iter()
                .copied()
                .filter(|&peer| {
                    registry.get(peer).is_some_and(|q| {
                        q.last_used
                            .is_none_or(|at| now.duration_since(at) > LIGHTLY_USED_IDLE)
                    })
                })
                .collect();

            let mut pool = if lightly_used.is_empty() {
                available
            } else {
                lightly_used
            };

            if !pool.is_empty() {
                pool.sort_by(|&a, &b| {
                    let score = |peer| {
                        registry
                            .get(peer)
                            .map_or(0.0, |q| q.score(now))
                    };
                    score(b).total_cmp(&score(a))
                });

                // Randomize among the top few for load balancing.
                let window = pool.len().min(KNOWN_PEER_PICK_WINDOW);
                let picked = pool[self.rng.gen_range(0..window)];
                tracing::info!(peer = %picked, "exploiting known-good peer");
                return Ok(Some(picked));
            }
            tracing::info!("all known-good peers overused, exploring instead");
        }

        // Explore: sample the overlay and run the candidates through the
        // selector.
        let candidates = self.ctx.random_peers(OVERLAY_PEERS_INITIAL).await?;
        if candidates.is_empty() {
            return Err(DownloadError::ResourceExhausted);
        }

        let best = select_peers(
            &candidates,
            ARCHIVE_SELECT_COUNT,
            &self.ctx.registries.peer_quality,
            &mut self.rng,
        );
        if let Some(&peer) = best.first() {
            return Ok(Some(peer));
        }

        // Everything was blacklisted or filtered; one last, wider ask.
        tracing::warn!("initial candidates all filtered, requesting more");
        let fallback = self.ctx.random_peers(OVERLAY_PEERS_FALLBACK).await?;
        match fallback.first() {
            Some(&peer) => Ok(Some(peer)),
            None => Err(DownloadError::ResourceExhausted),
        }
    }

    /// Commits to the chosen peer: blacklist re-check, usage accounting,
    /// `active_attempts` membership.
    fn commit_peer(&mut self, peer: Option<PeerId>) -> DownloadResult<()> {
        let Some(peer) = peer else {
            return Ok(());
        };

        let registries = &self.ctx.registries;
        if let Some(quality) = registries.peer_quality.get(peer) {
            if quality.is_blacklisted(Instant::now()) {
                tracing::warn!(%peer, "chosen peer is blacklisted");
                return Err(DownloadError::NotReady);
            }
        }

        self.peer = Some(peer);
        self.active_attempt = Some(ActiveAttempt::insert(
            peer,
            Arc::clone(&self.ctx.registries),
        ));
        registries.peer_quality.record_usage(peer);
        Ok(())
    }

    async fn fetch_archive_info(&mut self, peer: Option<PeerId>) -> DownloadResult<u64> {
        let timeout = if self.ctx.via_client {
            ARCHIVE_INFO_CLIENT_TIMEOUT
        } else {
            ARCHIVE_INFO_TIMEOUT
        };

        let query = ControlQuery::GetArchiveInfo {
            mc_seqno: self.request.mc_seqno,
            shard: self.request.shard,
        };

        match self.ctx.control_query(peer, query, timeout).await? {
            ControlResponse::ArchiveInfo { id } => {
                tracing::info!(archive_id = id, "found archive info, starting download");
                Ok(id)
            }
            ControlResponse::ArchiveNotFound => {
                self.not_found = true;
                Err(DownloadError::NotReady)
            }
            _ => Err(DownloadError::Protocol),
        }
    }

    async fn fetch_slices(
        &mut self,
        peer: Option<PeerId>,
        archive_id: u64,
        mut file: TempFile,
    ) -> DownloadResult<Downloaded> {
        let timeout = if self.ctx.via_client {
            ARCHIVE_SLICE_CLIENT_TIMEOUT
        } else {
            ARCHIVE_SLICE_TIMEOUT
        };

        let mut tracker = ProgressTracker::new(
            "download_archive_slice",
            format!("archive #{} {}", self.request.mc_seqno, self.request.shard),
            PROGRESS_LOG_INTERVAL_ARCHIVE,
        );

        let mut offset = 0_u64;
        loop {
            let query = BulkQuery::GetArchiveSlice {
                archive_id,
                offset,
                max_size: SLICE_SIZE,
            };

            let response = self
                .ctx
                .bulk_query(peer, query, timeout, SLICE_SIZE + 1024)
                .await?;
            let BulkResponse::Data(data) = response else {
                return Err(DownloadError::Protocol);
            };
            if data.len() as u64 > SLICE_SIZE {
                return Err(DownloadError::Protocol);
            }

            file.write_all(&data).await?;
            offset += data.len() as u64;

            tracker.tick(&self.ctx.progress, offset, None);

            if (data.len() as u64) < SLICE_SIZE {
                return Ok(Downloaded {
                    file,
                    bytes: offset,
                    elapsed: tracker.elapsed(),
                });
            }
        }
    }

    /// Final bookkeeping: registry updates, `active_attempts` erase, temp
    /// file persistence or (via drop) unlinking.
    async fn finish(self, result: DownloadResult<Downloaded>) -> DownloadResult<PathBuf> {
        let registries = &self.ctx.registries;

        match result {
            Ok(downloaded) => {
                if let Some(peer) = self.peer {
                    registries
                        .peer_quality
                        .record_success(peer, downloaded.bytes, downloaded.elapsed);

                    let successes = registries
                        .peer_quality
                        .get(peer)
                        .map_or(0, |q| q.successes);
                    if successes % USAGE_SUMMARY_EVERY == 0 {
                        log_usage_summary(registries);
                    }
                }

                tracing::info!(
                    size = %galena_helper::fmt::as_size(downloaded.bytes),
                    "archive slice downloaded",
                );
                Ok(downloaded.file.persist().await?)
            }
            Err(error) => {
                if self.not_found {
                    if let Some(peer) = self.peer {
                        registries
                            .peer_quality
                            .record_failure(peer, FailureKind::ArchiveNotFound);
                    }
                    registries.availability.note_not_found(self.request.mc_seqno);
                } else {
                    self.ctx.note_failure(self.peer, &error);
                }

                tracing::warn!(%error, "failed to download archive slice");
                Err(error)
            }
        }
    }
}

/// Logs the burden-sharing summary: the most used peers and whether the
/// load is skewing onto overused ones.
fn log_usage_summary(registries: &crate::Registries) {
    let summary = registries.peer_quality.usage_summary(5);
    let overused = summary.iter().filter(|entry| entry.overused).count();

    for (rank, entry) in summary.iter().enumerate() {
        tracing::info!(
            rank = rank + 1,
            peer = %entry.peer,
            usage = entry.usage_count,
            recent = entry.recent_usage_count,
            success_rate = entry.success_rate,
            overused = entry.overused,
            "usage summary",
        );
    }
    tracing::info!(tracked = summary.len(), overused, "usage summary totals");
}
