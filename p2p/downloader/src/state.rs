//! # Persistent-State Downloader
//!
//! Pulls a zero state or a persistent state snapshot. Persistent states
//! come down in sequential 2 MiB slices that are reassembled in memory;
//! zero states are small enough for a single fetch. State contents are
//! validated by the manager after receipt, not here.

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::instrument;

use galena_types::{BlockId, PeerId};

use crate::{
    constants::{
        CONTROL_QUERY_TIMEOUT, PROGRESS_LOG_INTERVAL_STATE, PROOF_QUERY_TIMEOUT, SLICE_SIZE,
        STATE_SLICE_TIMEOUT,
    },
    error::{DownloadError, DownloadResult},
    progress::ProgressTracker,
    protocol::{BulkQuery, BulkResponse, ControlQuery, ControlResponse},
    services::{DownloadKind, ManagerRequest, ManagerResponse},
    DownloaderContext,
};

/// Parameters of one state download.
#[derive(Debug)]
pub struct StateDownloadRequest {
    pub block_id: BlockId,
    /// The masterchain anchor the snapshot belongs to; `None` downloads
    /// the zero state instead.
    pub mc_block_id: Option<BlockId>,
    pub peer: Option<PeerId>,
    pub priority: u32,
    pub deadline: Instant,
}

/// One state download task. Resolves to the full state bytes.
pub struct StateDownload {
    request: StateDownloadRequest,
    ctx: DownloaderContext,
    peer: Option<PeerId>,
}

impl StateDownload {
    pub fn new(request: StateDownloadRequest, ctx: DownloaderContext) -> Self {
        Self {
            request,
            ctx,
            peer: None,
        }
    }

    #[instrument(
        level = "info",
        name = "download_state",
        skip_all,
        fields(block_id = %self.request.block_id)
    )]
    pub async fn run(mut self) -> DownloadResult<Bytes> {
        let deadline = self.request.deadline;
        let started = Instant::now();

        let result = match tokio::time::timeout_at(deadline, self.run_inner()).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout),
        };

        match &result {
            Ok(state) => {
                if let Some(peer) = self.peer {
                    self.ctx.registries.peer_quality.record_success(
                        peer,
                        state.len() as u64,
                        started.elapsed(),
                    );
                }
                tracing::info!(
                    size = %galena_helper::fmt::as_size(state.len() as u64),
                    "finished downloading state",
                );
            }
            Err(error) => {
                self.ctx.note_failure(self.peer, error);
                tracing::warn!(%error, "failed to download state");
            }
        }

        result
    }

    async fn run_inner(&mut self) -> DownloadResult<Bytes> {
        // The manager may already hold the snapshot.
        match self
            .ctx
            .manager_call(ManagerRequest::GetPersistentState {
                block_id: self.request.block_id,
                mc_block_id: self.request.mc_block_id,
            })
            .await?
        {
            ManagerResponse::PersistentState(Some(state)) => {
                tracing::info!("state served from local cache");
                return Ok(state);
            }
            ManagerResponse::PersistentState(None) => {}
            _ => panic!("Manager returned wrong response."),
        }

        let _handle = self.ctx.get_block_handle(self.request.block_id, true).await?;

        let _token = self
            .ctx
            .get_download_token(DownloadKind::State, self.request.priority, self.request.deadline)
            .await?;
        let peer = self.choose_peer().await?;

        let prepare = match self.request.mc_block_id {
            Some(mc_block_id) => ControlQuery::PreparePersistentState {
                block_id: self.request.block_id,
                mc_block_id,
            },
            None => ControlQuery::PrepareZeroState(self.request.block_id),
        };
        match self
            .ctx
            .control_query(peer, prepare, CONTROL_QUERY_TIMEOUT)
            .await?
        {
            ControlResponse::PreparedState => {}
            ControlResponse::NotFoundState => return Err(DownloadError::NotReady),
            _ => return Err(DownloadError::Protocol),
        }

        match self.request.mc_block_id {
            Some(mc_block_id) => self.fetch_slices(peer, mc_block_id).await,
            None => self.fetch_zero_state(peer).await,
        }
    }

    async fn fetch_zero_state(&mut self, peer: Option<PeerId>) -> DownloadResult<Bytes> {
        let response = self
            .ctx
            .bulk_query(
                peer,
                BulkQuery::DownloadZeroState(self.request.block_id),
                PROOF_QUERY_TIMEOUT,
                self.ctx.limits.max_state_size,
            )
            .await?;

        match response {
            BulkResponse::Data(state) => Ok(state),
            BulkResponse::Empty => Err(DownloadError::NotReady),
            BulkResponse::BlockFull { .. } => Err(DownloadError::Protocol),
        }
    }

    async fn fetch_slices(
        &mut self,
        peer: Option<PeerId>,
        mc_block_id: BlockId,
    ) -> DownloadResult<Bytes> {
        // Advisory only: the announced size feeds the progress/ETA lines
        // and is never trusted for allocation or termination.
        let total_size = self.fetch_total_size(peer, mc_block_id).await;

        let mut tracker = ProgressTracker::new(
            "download_state",
            self.request.block_id.to_string(),
            PROGRESS_LOG_INTERVAL_STATE,
        );

        let mut parts: Vec<Bytes> = Vec::new();
        let mut sum = 0_u64;
        loop {
            let query = BulkQuery::DownloadPersistentStateSlice {
                block_id: self.request.block_id,
                mc_block_id,
                offset: sum,
                max_size: SLICE_SIZE,
            };
            let response = self
                .ctx
                .bulk_query(peer, query, STATE_SLICE_TIMEOUT, SLICE_SIZE + 1024)
                .await?;
            let BulkResponse::Data(part) = response else {
                return Err(DownloadError::Protocol);
            };
            if part.len() as u64 > SLICE_SIZE {
                return Err(DownloadError::Protocol);
            }

            let last = (part.len() as u64) < SLICE_SIZE;
            sum += part.len() as u64;
            parts.push(part);

            tracker.tick(&self.ctx.progress, sum, total_size);

            if last {
                return reassemble(parts, sum);
            }
        }
    }

    /// Queries the announced state size, tolerating every failure.
    async fn fetch_total_size(
        &mut self,
        peer: Option<PeerId>,
        mc_block_id: BlockId,
    ) -> Option<u64> {
        let query = ControlQuery::GetPersistentStateSize {
            block_id: self.request.block_id,
            mc_block_id,
        };

        match self.ctx.control_query(peer, query, PROOF_QUERY_TIMEOUT).await {
            Ok(ControlResponse::PersistentStateSize(size)) => Some(size),
            Ok(_) | Err(_) => None,
        }
    }

    async fn choose_peer(&mut self) -> DownloadResult<Option<PeerId>> {
        if let Some(peer) = self.request.peer {
            self.peer = Some(peer);
            return Ok(Some(peer));
        }
        if self.ctx.via_client {
            return Ok(None);
        }

        let peers = self.ctx.random_peers(1).await?;
        let Some(&peer) = peers.first() else {
            return Err(DownloadError::ResourceExhausted);
        };

        self.peer = Some(peer);
        tracing::info!(%peer, "downloading state");
        Ok(Some(peer))
    }
}

/// Concatenates the slice list, checking the result against the
/// accumulated offset.
fn reassemble(parts: Vec<Bytes>, expected_len: u64) -> DownloadResult<Bytes> {
    let mut combined = BytesMut::with_capacity(expected_len as usize);
    for part in parts {
        combined.extend_from_slice(&part);
    }

    if combined.len() as u64 != expected_len {
        return Err(DownloadError::Protocol);
    }
    Ok(combined.freeze())
}
