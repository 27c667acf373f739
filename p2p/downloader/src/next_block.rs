//! # Next-Block Descriptor
//!
//! Given a predecessor's handle, discovers the id of the canonical next
//! block (locally when the handle records it, otherwise by asking a peer)
//! and delegates the actual download to the [block downloader](crate::block).

use tokio::time::Instant;
use tracing::instrument;

use galena_types::{BlockHandle, BlockId, PeerId};

use crate::{
    block::{BlockDownload, BlockDownloadRequest, ReceivedBlock},
    capabilities::BlockDownloadVariant,
    constants::CONTROL_QUERY_TIMEOUT,
    error::{DownloadError, DownloadResult},
    protocol::{ControlQuery, ControlResponse},
    DownloaderContext,
};

/// Parameters of one next-block download.
#[derive(Debug)]
pub struct NextBlockRequest {
    pub prev: BlockHandle,
    pub peer: Option<PeerId>,
    pub priority: u32,
    pub deadline: Instant,
}

/// One next-block discovery + download task.
pub struct NextBlockDownload {
    request: NextBlockRequest,
    ctx: DownloaderContext,
}

impl NextBlockDownload {
    pub fn new(request: NextBlockRequest, ctx: DownloaderContext) -> Self {
        Self { request, ctx }
    }

    #[instrument(
        level = "debug",
        name = "download_next_block",
        skip_all,
        fields(prev = %self.request.prev.id)
    )]
    pub async fn run(mut self) -> DownloadResult<ReceivedBlock> {
        let deadline = self.request.deadline;

        let (next_id, peer) = match tokio::time::timeout_at(deadline, self.discover()).await {
            Ok(result) => result?,
            Err(_) => return Err(DownloadError::Timeout),
        };

        // The descriptor itself fetches no data; hand the discovered id to
        // the block downloader in next-of-predecessor mode.
        let variant = match peer {
            Some(peer) => self.ctx.registries.capabilities.block_variant_for(peer),
            None => BlockDownloadVariant::Legacy,
        };

        let request = BlockDownloadRequest {
            block_id: Some(next_id),
            prev: Some(self.request.prev),
            peer,
            priority: self.request.priority,
            deadline,
        };
        BlockDownload::new(request, variant, self.ctx).run().await
    }

    /// Resolves the successor id, preferring local knowledge.
    async fn discover(&mut self) -> DownloadResult<(BlockId, Option<PeerId>)> {
        if let Some(next) = self.request.prev.next_left {
            tracing::debug!(next = %next, "successor known locally");
            return Ok((next, self.request.peer));
        }

        let peer = self.choose_peer().await?;

        let response = self
            .ctx
            .control_query(
                peer,
                ControlQuery::GetNextBlockDescription(self.request.prev.id),
                CONTROL_QUERY_TIMEOUT,
            )
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.ctx.note_failure(peer, &error);
                return Err(error);
            }
        };

        match response {
            ControlResponse::NextBlockDescription(Some(next_id)) => Ok((next_id, peer)),
            ControlResponse::NextBlockDescription(None) => Err(DownloadError::NotReady),
            _ => {
                let error = DownloadError::Protocol;
                self.ctx.note_failure(peer, &error);
                Err(error)
            }
        }
    }

    async fn choose_peer(&mut self) -> DownloadResult<Option<PeerId>> {
        if let Some(peer) = self.request.peer {
            return Ok(Some(peer));
        }
        if self.ctx.via_client {
            return Ok(None);
        }

        let peers = self.ctx.random_peers(1).await?;
        match peers.first() {
            Some(&peer) => Ok(Some(peer)),
            None => Err(DownloadError::ResourceExhausted),
        }
    }
}
