//! # Key-Block Walker
//!
//! Asks a peer for the ids of the key blocks following an anchor, then
//! validates each one's proof relative to the previously accepted id. The
//! walker is the one place in the subsystem that surfaces partial success:
//! if it dies mid-chain with some ids already accepted, those are delivered
//! instead of an error.

use tokio::time::Instant;
use tracing::instrument;

use galena_types::{BlockId, PeerId};

use crate::{
    constants::{CONTROL_QUERY_TIMEOUT, KEY_BLOCK_WALK_LIMIT},
    error::{DownloadError, DownloadResult},
    proof::{ProofDownload, ProofKind, ProofRequest},
    protocol::{ControlQuery, ControlResponse},
    services::DownloadKind,
    DownloaderContext,
};

/// Parameters of one key-block walk.
#[derive(Debug)]
pub struct KeyBlockWalkRequest {
    /// The last key block we already trust.
    pub anchor: BlockId,
    /// How many successors to ask for, capped at
    /// [`KEY_BLOCK_WALK_LIMIT`].
    pub limit: u32,
    pub peer: Option<PeerId>,
    pub priority: u32,
    pub deadline: Instant,
}

/// One key-block walk task. Resolves to the accepted ids in chain order.
pub struct KeyBlockWalk {
    request: KeyBlockWalkRequest,
    ctx: DownloaderContext,
    accepted: Vec<BlockId>,
}

impl KeyBlockWalk {
    pub fn new(request: KeyBlockWalkRequest, ctx: DownloaderContext) -> Self {
        Self {
            request,
            ctx,
            accepted: Vec::new(),
        }
    }

    #[instrument(
        level = "debug",
        name = "get_next_key_blocks",
        skip_all,
        fields(anchor = %self.request.anchor)
    )]
    pub async fn run(mut self) -> DownloadResult<Vec<BlockId>> {
        let deadline = self.request.deadline;

        let result = match tokio::time::timeout_at(deadline, self.walk()).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout),
        };

        match result {
            Ok(()) => Ok(self.accepted),
            Err(error) if !self.accepted.is_empty() => {
                tracing::debug!(
                    %error,
                    accepted = self.accepted.len(),
                    "walk stopped early, delivering partial chain",
                );
                Ok(self.accepted)
            }
            Err(error) => Err(error),
        }
    }

    async fn walk(&mut self) -> DownloadResult<()> {
        let _token = self
            .ctx
            .get_download_token(
                DownloadKind::KeyBlocks,
                self.request.priority,
                self.request.deadline,
            )
            .await?;

        let peer = self.choose_peer().await?;

        let query = ControlQuery::GetNextKeyBlockIds {
            block_id: self.request.anchor,
            max: self.request.limit.min(KEY_BLOCK_WALK_LIMIT),
        };
        let response = match self.ctx.control_query(peer, query, CONTROL_QUERY_TIMEOUT).await {
            Ok(response) => response,
            Err(error) => {
                self.ctx.note_failure(peer, &error);
                return Err(error);
            }
        };

        let ids = match response {
            ControlResponse::KeyBlockIds { error: true, .. } => {
                let error = DownloadError::NotReady;
                self.ctx.note_failure(peer, &error);
                return Err(error);
            }
            ControlResponse::KeyBlockIds { ids, error: false } => ids,
            _ => {
                let error = DownloadError::Protocol;
                self.ctx.note_failure(peer, &error);
                return Err(error);
            }
        };
        tracing::debug!(count = ids.len(), "received key block ids");

        for id in ids {
            self.accept_key_block(id, peer).await?;
        }
        Ok(())
    }

    /// Downloads and validates one proof, then checks the block really is
    /// a key block before accepting it.
    async fn accept_key_block(&mut self, id: BlockId, peer: Option<PeerId>) -> DownloadResult<()> {
        let relative_to = *self.accepted.last().unwrap_or(&self.request.anchor);

        ProofDownload::new(
            ProofRequest {
                block_id: id,
                kind: ProofKind::Full,
                relative_to: Some(relative_to),
                peer,
                priority: self.request.priority,
                deadline: self.request.deadline,
            },
            self.ctx.clone(),
        )
        .run()
        .await?;

        let Some(handle) = self.ctx.get_block_handle(id, false).await? else {
            return Err(DownloadError::Protocol);
        };
        if !handle.is_key_block {
            tracing::warn!(block_id = %id, "peer listed a non-key block");
            return Err(DownloadError::Protocol);
        }

        self.accepted.push(id);
        Ok(())
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
