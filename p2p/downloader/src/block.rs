//! # Block Downloader
//!
//! Downloads one block and the proof that it is canonical, in two protocol
//! variants:
//!
//! - **Legacy** (three round trips): negotiate the proof with
//!   `prepare_block_proof`, fetch and validate it, then negotiate and fetch
//!   the block data. Works against every peer.
//! - **Full** (one round trip): a single `download_block_full` (or
//!   `download_next_block_full`) returns data and proof together. Requires
//!   the peer to advertise protocol version 1, see
//!   [`crate::capabilities`].
//!
//! Both variants answer from local storage when the handle already carries
//! data and an acceptable proof, and both check the payload digest against
//! the block's file hash before anything touches the validator.

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::instrument;

use galena_types::{BlockHandle, BlockId, HashBytes, PeerId};

use crate::{
    capabilities::BlockDownloadVariant,
    constants::{BLOCK_QUERY_TIMEOUT, CONTROL_QUERY_TIMEOUT, PROOF_QUERY_TIMEOUT},
    error::{DownloadError, DownloadResult},
    protocol::{BulkQuery, BulkResponse, ControlQuery, ControlResponse},
    services::{DownloadKind, ManagerRequest, ManagerResponse},
    DownloaderContext,
};

/// A downloaded, proof-checked block.
#[derive(Debug, Clone)]
pub struct ReceivedBlock {
    pub id: BlockId,
    pub data: Bytes,
}

/// Parameters of one block download.
#[derive(Debug)]
pub struct BlockDownloadRequest {
    /// The block to fetch. `None` in next-block mode, where the id is
    /// discovered from the peer's reply.
    pub block_id: Option<BlockId>,
    /// The predecessor handle; when set, the proof is validated as "the
    /// target is the successor of this block".
    pub prev: Option<BlockHandle>,
    /// An explicit peer to download from.
    pub peer: Option<PeerId>,
    pub priority: u32,
    pub deadline: Instant,
}

/// One block download task.
pub struct BlockDownload {
    request: BlockDownloadRequest,
    variant: BlockDownloadVariant,
    ctx: DownloaderContext,
    peer: Option<PeerId>,
}

impl BlockDownload {
    pub fn new(
        request: BlockDownloadRequest,
        variant: BlockDownloadVariant,
        ctx: DownloaderContext,
    ) -> Self {
        assert!(
            request.block_id.is_some() || request.prev.is_some(),
            "a block download needs a target id or a predecessor",
        );
        Self {
            request,
            variant,
            ctx,
            peer: None,
        }
    }

    #[instrument(
        level = "debug",
        name = "download_block",
        skip_all,
        fields(block_id = ?self.request.block_id, variant = ?self.variant)
    )]
    pub async fn run(mut self) -> DownloadResult<ReceivedBlock> {
        let deadline = self.request.deadline;
        let started = Instant::now();

        let result = match tokio::time::timeout_at(deadline, self.run_inner()).await {
            Ok(result) => result,
            Err(_) => Err(DownloadError::Timeout),
        };

        match &result {
            Ok(block) => {
                if let Some(peer) = self.peer {
                    self.ctx.registries.peer_quality.record_success(
                        peer,
                        block.data.len() as u64,
                        started.elapsed(),
                    );
                }
            }
            Err(error) => {
                self.ctx.note_failure(self.peer, error);
                tracing::debug!(%error, "failed to download block");
            }
        }

        result
    }

    /// The proof policy for the current target: masterchain blocks need a
    /// full proof, next-block targets a full "is next" proof.
    fn allow_partial_proof(&self) -> bool {
        match (&self.request.block_id, &self.request.prev) {
            (Some(id), None) => !id.is_masterchain(),
            _ => false,
        }
    }

    async fn run_inner(&mut self) -> DownloadResult<ReceivedBlock> {
        match self.variant {
            BlockDownloadVariant::Legacy => self.run_legacy().await,
            BlockDownloadVariant::Full => self.run_full().await,
        }
    }

    async fn run_legacy(&mut self) -> DownloadResult<ReceivedBlock> {
        let Some(block_id) = self.request.block_id else {
            panic!("the legacy protocol cannot discover a next-block id");
        };
        let allow_partial = self.allow_partial_proof();

        let handle = self.ctx.get_block_handle(block_id, false).await?;

        if let Some(handle) = &handle {
            if handle.has_acceptable_proof(allow_partial) && handle.has_data {
                let data = self.read_local(handle.clone(), false).await?;
                return Ok(ReceivedBlock { id: block_id, data });
            }
        }

        let _token = self
            .ctx
            .get_download_token(DownloadKind::Block, self.request.priority, self.request.deadline)
            .await?;
        let peer = self.choose_peer().await?;

        if !handle
            .as_ref()
            .is_some_and(|h| h.has_acceptable_proof(allow_partial))
        {
            self.fetch_and_validate_proof(block_id, allow_partial, peer)
                .await?;
        }

        // The validated proof must be on the handle now.
        let Some(handle) = self.ctx.get_block_handle(block_id, true).await? else {
            panic!("Manager did not create a block handle.");
        };
        debug_assert!(handle.has_acceptable_proof(allow_partial));

        if handle.has_data {
            let data = self.read_local(handle, false).await?;
            return Ok(ReceivedBlock { id: block_id, data });
        }

        match self
            .ctx
            .control_query(peer, ControlQuery::PrepareBlock(block_id), CONTROL_QUERY_TIMEOUT)
            .await?
        {
            ControlResponse::Prepared => {}
            ControlResponse::NotFound => return Err(DownloadError::NotReady),
            _ => return Err(DownloadError::Protocol),
        }

        let response = self
            .ctx
            .bulk_query(
                peer,
                BulkQuery::DownloadBlock(block_id),
                BLOCK_QUERY_TIMEOUT,
                self.ctx.limits.max_block_size,
            )
            .await?;
        let BulkResponse::Data(data) = response else {
            return Err(DownloadError::Protocol);
        };

        verify_file_hash(&data, &block_id.file_hash)?;
        Ok(ReceivedBlock { id: block_id, data })
    }

    async fn run_full(&mut self) -> DownloadResult<ReceivedBlock> {
        let allow_partial = self.allow_partial_proof();

        // Resolve the target id locally where possible: an explicit id, or
        // a successor the predecessor's handle already records.
        let known_id = match (self.request.block_id, &self.request.prev) {
            (Some(id), _) => Some(id),
            (None, Some(prev)) => prev.next_left,
            (None, None) => unreachable!("checked in the constructor"),
        };

        if let Some(id) = known_id {
            let handle = self.ctx.get_block_handle(id, true).await?;
            if let Some(handle) = handle {
                if handle.has_acceptable_proof(allow_partial) && handle.has_data {
                    let data = self.read_local(handle, true).await?;
                    return Ok(ReceivedBlock { id, data });
                }
            }
        }

        let _token = self
            .ctx
            .get_download_token(DownloadKind::Block, self.request.priority, self.request.deadline)
            .await?;
        let peer = self.choose_peer().await?;

        let query = match known_id {
            Some(id) => BulkQuery::DownloadBlockFull(id),
            None => {
                let prev = self.request.prev.as_ref().expect("checked above");
                BulkQuery::DownloadNextBlockFull(prev.id)
            }
        };

        let timeout = if self.ctx.via_client {
            CONTROL_QUERY_TIMEOUT
        } else {
            PROOF_QUERY_TIMEOUT
        };
        let max_size = self.ctx.limits.max_proof_size + self.ctx.limits.max_block_size + 128;

        let (id, block, proof, is_link) = match self
            .ctx
            .bulk_query(peer, query, timeout, max_size)
            .await?
        {
            BulkResponse::BlockFull {
                id,
                block,
                proof,
                is_link,
            } => (id, block, proof, is_link),
            BulkResponse::Empty => return Err(DownloadError::NotReady),
            BulkResponse::Data(_) => return Err(DownloadError::Protocol),
        };

        if is_link && !allow_partial {
            return Err(DownloadError::NotReady);
        }
        if known_id.is_some_and(|expected| expected != id) {
            return Err(DownloadError::Protocol);
        }

        // Integrity first: the validator never sees payloads that do not
        // match their advertised file hash.
        verify_file_hash(&block, &id.file_hash)?;

        match known_id {
            Some(id) => {
                let request = if is_link {
                    ManagerRequest::ValidateBlockProofLink { block_id: id, proof }
                } else {
                    ManagerRequest::ValidateBlockProof { block_id: id, proof }
                };
                self.ctx.validate_proof(request).await?;
            }
            None => {
                if is_link {
                    return Err(DownloadError::Protocol);
                }
                let prev = self.request.prev.as_ref().expect("checked above");
                self.ctx
                    .validate_proof(ManagerRequest::ValidateBlockIsNextProof {
                        prev_id: prev.id,
                        next_id: id,
                        proof,
                    })
                    .await?;
            }
        }

        Ok(ReceivedBlock { id, data: block })
    }

    /// Negotiates and validates the proof for `block_id` (legacy path).
    async fn fetch_and_validate_proof(
        &mut self,
        block_id: BlockId,
        allow_partial: bool,
        peer: Option<PeerId>,
    ) -> DownloadResult<()> {
        let prepared = self
            .ctx
            .control_query(
                peer,
                ControlQuery::PrepareBlockProof {
                    block_id,
                    allow_partial,
                },
                CONTROL_QUERY_TIMEOUT,
            )
            .await?;

        let (query, as_link) = match prepared {
            ControlResponse::ProofEmpty => return Err(DownloadError::NotReady),
            ControlResponse::PreparedProofLink => {
                if !allow_partial {
                    tracing::debug!("peer offered a proof link for a masterchain block");
                    return Err(DownloadError::Protocol);
                }
                (BulkQuery::DownloadBlockProofLink(block_id), true)
            }
            ControlResponse::PreparedProof => (BulkQuery::DownloadBlockProof(block_id), false),
            _ => return Err(DownloadError::Protocol),
        };

        let response = self
            .ctx
            .bulk_query(peer, query, PROOF_QUERY_TIMEOUT, self.ctx.limits.max_proof_size)
            .await?;
        let BulkResponse::Data(proof) = response else {
            return Err(DownloadError::Protocol);
        };

        let request = if as_link {
            ManagerRequest::ValidateBlockProofLink { block_id, proof }
        } else {
            match &self.request.prev {
                Some(prev) => ManagerRequest::ValidateBlockIsNextProof {
                    prev_id: prev.id,
                    next_id: block_id,
                    proof,
                },
                None => ManagerRequest::ValidateBlockProof { block_id, proof },
            }
        };
        self.ctx.validate_proof(request).await
    }

    /// Reads block data from local storage through the manager.
    async fn read_local(&mut self, handle: BlockHandle, from_db: bool) -> DownloadResult<Bytes> {
        let request = if from_db {
            ManagerRequest::GetBlockDataFromDb(handle)
        } else {
            ManagerRequest::GetBlockData(handle)
        };

        match self.ctx.manager_call(request).await? {
            ManagerResponse::BlockData(data) => Ok(data),
            _ => panic!("Manager returned wrong response."),
        }
    }

    /// Picks the peer to query: the explicit one, the client bypass, or one
    /// random overlay peer.
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

/// Checks a payload against the expected file hash.
pub(crate) fn verify_file_hash(data: &[u8], expected: &HashBytes) -> DownloadResult<()> {
    let digest: [u8; 32] = Sha256::digest(data).into();
    if &digest != expected.as_bytes() {
        tracing::warn!("payload digest does not match the expected file hash");
        return Err(DownloadError::IntegrityMismatch);
    }
    Ok(())
}
