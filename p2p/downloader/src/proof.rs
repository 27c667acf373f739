//! # Proof Downloader
//!
//! Fetches a single proof or proof link over the bulk transport and runs it
//! through the validator before handing the bytes back. Used standalone and
//! by the [key-block walker](crate::key_blocks).

use bytes::Bytes;
use tokio::time::Instant;
use tracing::instrument;

use galena_types::{BlockId, PeerId};

use crate::{
    constants::PROOF_QUERY_TIMEOUT,
    error::{DownloadError, DownloadResult},
    protocol::{BulkQuery, BulkResponse},
    services::{DownloadKind, ManagerRequest},
    DownloaderContext,
};

/// Which flavor of proof to fetch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProofKind {
    Full,
    Link,
}

/// Parameters of one proof download.
#[derive(Debug)]
pub struct ProofRequest {
    pub block_id: BlockId,
    pub kind: ProofKind,
    /// Validate relative to this already-accepted block instead of
    /// standalone.
    pub relative_to: Option<BlockId>,
    pub peer: Option<PeerId>,
    pub priority: u32,
    pub deadline: Instant,
}

/// One proof download task. Resolves to the validated proof bytes.
pub struct ProofDownload {
    request: ProofRequest,
    ctx: DownloaderContext,
    peer: Option<PeerId>,
}

impl ProofDownload {
    pub fn new(request: ProofRequest, ctx: DownloaderContext) -> Self {
        Self {
            request,
            ctx,
            peer: None,
        }
    }

    #[instrument(
        level = "debug",
        name = "download_proof",
        skip_all,
        fields(block_id = %self.request.block_id, kind = ?self.request.kind)
    )]
    pub async fn run(mut self) -> DownloadResult<Bytes> {
        let deadline = self.request.deadline;

        let result = match tokio::time::timeout_at(deadline, self.run_inner()).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout),
        };

        if let Err(error) = &result {
            self.ctx.note_failure(self.peer, error);
            tracing::debug!(%error, "failed to download proof");
        }
        result
    }

    async fn run_inner(&mut self) -> DownloadResult<Bytes> {
        let _token = self
            .ctx
            .get_download_token(DownloadKind::Proof, self.request.priority, self.request.deadline)
            .await?;

        let peer = self.choose_peer().await?;

        let query = match self.request.kind {
            ProofKind::Full => BulkQuery::DownloadBlockProof(self.request.block_id),
            ProofKind::Link => BulkQuery::DownloadBlockProofLink(self.request.block_id),
        };

        let response = self
            .ctx
            .bulk_query(peer, query, PROOF_QUERY_TIMEOUT, self.ctx.limits.max_proof_size)
            .await?;
        let proof = match response {
            BulkResponse::Data(proof) => proof,
            BulkResponse::Empty => return Err(DownloadError::NotReady),
            BulkResponse::BlockFull { .. } => return Err(DownloadError::Protocol),
        };

        let request = match (self.request.kind, self.request.relative_to) {
            (_, Some(relative_to)) => ManagerRequest::ValidateBlockProofRel {
                block_id: self.request.block_id,
                relative_to,
                proof: proof.clone(),
            },
            (ProofKind::Full, None) => ManagerRequest::ValidateBlockProof {
                block_id: self.request.block_id,
                proof: proof.clone(),
            },
            (ProofKind::Link, None) => ManagerRequest::ValidateBlockProofLink {
                block_id: self.request.block_id,
                proof: proof.clone(),
            },
        };
        self.ctx.validate_proof(request).await?;

        Ok(proof)
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
        Ok(Some(peer))
    }
}
