//! End-to-end downloader scenarios against fake services.
//!
//! Every test stands up the manager, the two transports and the overlay as
//! `service_fn` closures, runs one download task under a paused tokio
//! clock, and checks both the delivered result and the registry side
//! effects.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::FutureExt;
use rand::{rngs::StdRng, SeedableRng};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tower::{service_fn, util::BoxCloneService, ServiceExt};

use galena_downloader::{
    constants::SLICE_SIZE,
    peer_quality::PeerQualityRegistry,
    progress::ProgressChannel,
    protocol::{BulkQuery, BulkResponse, ControlQuery, ControlResponse},
    services::{
        BulkRequest, BulkService, ControlRequest, ControlService, DownloadToken, ManagerRequest,
        ManagerResponse, ManagerService, OverlayRequest, OverlayResponse, OverlayService,
    },
    ArchiveSliceDownload, ArchiveSliceRequest, BlockDownload, BlockDownloadRequest,
    BlockDownloadVariant, DownloadError, DownloaderContext, FailureKind, KeyBlockWalk,
    KeyBlockWalkRequest, Registries, StateDownload, StateDownloadRequest,
};
use galena_types::{BlockHandle, BlockId, HashBytes, PeerId, Seqno, ShardIdent};

const SEQNO: Seqno = 123;

fn peer(byte: u8) -> PeerId {
    PeerId::new([byte; 32])
}

fn block_id(seqno: u32, shard: ShardIdent, file_hash: HashBytes) -> BlockId {
    BlockId::new(shard, seqno, HashBytes::new([seqno as u8; 32]), file_hash)
}

fn hashed_block_id(seqno: u32, shard: ShardIdent, data: &[u8]) -> BlockId {
    block_id(seqno, shard, HashBytes::new(Sha256::digest(data).into()))
}

fn deadline_in(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

/// Seeds a peer with 4 successes and 1 failure: success rate 0.8 over 5
/// attempts, the profile of a known-good peer.
fn seed_known_good(registry: &PeerQualityRegistry, peer: PeerId) {
    for _ in 0..4 {
        registry.record_success(peer, SLICE_SIZE, Duration::from_secs(1));
    }
    registry.record_failure(peer, FailureKind::Generic);
}

fn overlay_returning(peers: Vec<PeerId>) -> OverlayService {
    BoxCloneService::new(service_fn(move |_: OverlayRequest| {
        let peers = peers.clone();
        async move { Ok(OverlayResponse::Peers(peers)) }.boxed()
    }))
}

fn control_from(
    f: impl Fn(ControlQuery) -> Result<ControlResponse, tower::BoxError> + Clone + Send + 'static,
) -> ControlService {
    BoxCloneService::new(service_fn(move |request: ControlRequest| {
        let f = f.clone();
        async move { f(request.query) }.boxed()
    }))
}

fn bulk_from(
    f: impl Fn(BulkQuery) -> Result<BulkResponse, tower::BoxError> + Clone + Send + 'static,
) -> BulkService {
    BoxCloneService::new(service_fn(move |request: BulkRequest| {
        let f = f.clone();
        async move { f(request.query) }.boxed()
    }))
}

/// A manager whose handles reflect proof validations as they happen and
/// which counts validator calls.
#[derive(Default)]
struct ManagerState {
    validate_calls: AtomicUsize,
    /// Calls up to this count (1-based) succeed, later ones are rejected;
    /// `usize::MAX` accepts everything.
    accept_first_validations: usize,
    proof_validated: Mutex<bool>,
    handle_has_data: bool,
    is_key_block: bool,
    cached_state: Option<Bytes>,
    local_block_data: Option<Bytes>,
}

fn manager_from(state: Arc<ManagerState>) -> ManagerService {
    BoxCloneService::new(service_fn(move |request: ManagerRequest| {
        let state = Arc::clone(&state);
        async move {
            let response = match request {
                ManagerRequest::GetBlockHandle {
                    block_id,
                    create_if_missing,
                } => {
                    let proof_validated = *state.proof_validated.lock().unwrap();
                    if !create_if_missing && !proof_validated {
                        ManagerResponse::BlockHandle(None)
                    } else {
                        ManagerResponse::BlockHandle(Some(BlockHandle {
                            has_proof: proof_validated,
                            has_data: state.handle_has_data,
                            is_key_block: state.is_key_block,
                            ..BlockHandle::new(block_id)
                        }))
                    }
                }
                ManagerRequest::GetBlockData(_) | ManagerRequest::GetBlockDataFromDb(_) => {
                    match &state.local_block_data {
                        Some(data) => ManagerResponse::BlockData(data.clone()),
                        None => return Err("no local block data".into()),
                    }
                }
                ManagerRequest::ValidateBlockProof { .. }
                | ManagerRequest::ValidateBlockProofLink { .. }
                | ManagerRequest::ValidateBlockProofRel { .. }
                | ManagerRequest::ValidateBlockIsNextProof { .. } => {
                    let call = state.validate_calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if call > state.accept_first_validations {
                        return Err("proof rejected".into());
                    }
                    *state.proof_validated.lock().unwrap() = true;
                    ManagerResponse::Validated
                }
                ManagerRequest::GetPersistentState { .. } => {
                    ManagerResponse::PersistentState(state.cached_state.clone())
                }
                ManagerRequest::GetDownloadToken { .. } => {
                    ManagerResponse::DownloadToken(DownloadToken::unlimited())
                }
            };
            Ok(response)
        }
        .boxed()
    }))
}

fn context(
    manager: ManagerService,
    control: ControlService,
    bulk: BulkService,
    overlay: OverlayService,
    registries: Arc<Registries>,
    progress: ProgressChannel,
) -> DownloaderContext {
    DownloaderContext {
        local_id: peer(0xfe),
        overlay_id: galena_types::OverlayId::new([0xee; 32]),
        manager,
        control,
        bulk,
        overlay,
        via_client: false,
        registries,
        limits: Default::default(),
        progress,
    }
}

/// Archive happy path: three slices (2 MiB, 2 MiB, 512 KiB) land in the
/// temp file, the peer is credited and progress was reported.
#[tokio::test(start_paused = true)]
async fn archive_happy_path() {
    let p = peer(1);
    let registries = Registries::new();
    seed_known_good(&registries.peer_quality, p);

    let control = control_from(|query| match query {
        ControlQuery::GetArchiveInfo { mc_seqno, .. } => {
            assert_eq!(mc_seqno, SEQNO);
            Ok(ControlResponse::ArchiveInfo { id: 0x0102 })
        }
        _ => panic!("unexpected control query: {query:?}"),
    });

    let bulk = bulk_from(|query| match query {
        BulkQuery::GetArchiveSlice {
            archive_id, offset, ..
        } => {
            assert_eq!(archive_id, 0x0102);
            let len = match offset {
                0 => SLICE_SIZE,
                o if o == SLICE_SIZE => SLICE_SIZE,
                o if o == 2 * SLICE_SIZE => 512 * 1024,
                other => panic!("unexpected offset {other}"),
            };
            Ok(BulkResponse::Data(Bytes::from(vec![0xab; len as usize])))
        }
        _ => panic!("unexpected bulk query: {query:?}"),
    });

    // The slices take simulated time, so the 3-second progress interval
    // actually elapses mid-download.
    let bulk = BoxCloneService::new(service_fn(move |request: BulkRequest| {
        let bulk = bulk.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(4)).await;
            bulk.oneshot(request).await
        }
        .boxed()
    }));

    let (progress, mut progress_rx) = ProgressChannel::new();
    let temp_dir = tempfile::tempdir().unwrap();
    let ctx = context(
        manager_from(Arc::default()),
        control,
        bulk,
        overlay_returning(vec![p]),
        Arc::clone(&registries),
        progress,
    );

    let request = ArchiveSliceRequest {
        mc_seqno: SEQNO,
        shard: ShardIdent::MASTERCHAIN,
        temp_dir: temp_dir.path().to_owned(),
        peer: None,
        priority: 1,
        deadline: deadline_in(60),
        rng: Some(StdRng::seed_from_u64(9)),
    };

    let path = ArchiveSliceDownload::new(request, ctx).run().await.unwrap();

    let len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(len, 2 * SLICE_SIZE + 512 * 1024);

    let quality = registries.peer_quality.get(p).unwrap();
    assert_eq!(quality.successes, 5);
    assert_eq!(quality.consecutive_failures, 0);
    assert!(quality.usage_count >= 1);

    assert!(progress_rx.try_recv().is_ok(), "progress was never reported");
    assert!(registries.active_attempts.lock().unwrap().is_empty());
}

/// Archive "not found": the failure is classified, the seqno's
/// availability record is fed, and the temp file is unlinked.
#[tokio::test(start_paused = true)]
async fn archive_not_found() {
    let p = peer(2);
    let registries = Registries::new();
    seed_known_good(&registries.peer_quality, p);

    let control = control_from(|query| match query {
        ControlQuery::GetArchiveInfo { .. } => Ok(ControlResponse::ArchiveNotFound),
        _ => panic!("unexpected control query: {query:?}"),
    });
    let bulk = bulk_from(|query| panic!("no bulk traffic expected, got {query:?}"));

    let temp_dir = tempfile::tempdir().unwrap();
    let ctx = context(
        manager_from(Arc::default()),
        control,
        bulk,
        overlay_returning(vec![p]),
        Arc::clone(&registries),
        ProgressChannel::disabled(),
    );

    let request = ArchiveSliceRequest {
        mc_seqno: SEQNO,
        shard: ShardIdent::MASTERCHAIN,
        temp_dir: temp_dir.path().to_owned(),
        peer: None,
        priority: 1,
        deadline: deadline_in(60),
        rng: Some(StdRng::seed_from_u64(9)),
    };

    let result = ArchiveSliceDownload::new(request, ctx).run().await;
    assert!(matches!(result, Err(DownloadError::NotReady)));

    let quality = registries.peer_quality.get(p).unwrap();
    assert_eq!(quality.failures, 2);
    assert_eq!(quality.archive_not_found_count, 1);

    let availability = registries.availability.get(SEQNO).unwrap();
    assert_eq!(availability.total_attempts, 1);
    assert_eq!(availability.not_found_count, 1);

    let leftovers = std::fs::read_dir(temp_dir.path()).unwrap().count();
    assert_eq!(leftovers, 0, "temp file was not unlinked");
}

/// After repeated fleet-wide "not found" replies a fresh archive task
/// defers for the recommended back-off before any network traffic.
#[tokio::test(start_paused = true)]
async fn archive_defers_when_seqno_unavailable() {
    let p = peer(3);
    let registries = Registries::new();
    seed_known_good(&registries.peer_quality, p);
    for _ in 0..3 {
        registries.availability.note_attempt(SEQNO);
        registries.availability.note_not_found(SEQNO);
    }

    let started = Instant::now();
    let first_query_at = Arc::new(Mutex::new(None::<Instant>));

    let control = {
        let first_query_at = Arc::clone(&first_query_at);
        control_from(move |query| match query {
            ControlQuery::GetArchiveInfo { .. } => {
                first_query_at.lock().unwrap().get_or_insert(Instant::now());
                Ok(ControlResponse::ArchiveInfo { id: 1 })
            }
            _ => panic!("unexpected control query: {query:?}"),
        })
    };
    let bulk = bulk_from(|_| Ok(BulkResponse::Data(Bytes::from_static(b"end"))));

    let temp_dir = tempfile::tempdir().unwrap();
    let ctx = context(
        manager_from(Arc::default()),
        control,
        bulk,
        overlay_returning(vec![p]),
        Arc::clone(&registries),
        ProgressChannel::disabled(),
    );

    let request = ArchiveSliceRequest {
        mc_seqno: SEQNO,
        shard: ShardIdent::MASTERCHAIN,
        temp_dir: temp_dir.path().to_owned(),
        peer: None,
        priority: 1,
        deadline: deadline_in(600),
        rng: Some(StdRng::seed_from_u64(9)),
    };

    ArchiveSliceDownload::new(request, ctx).run().await.unwrap();

    let queried_at = first_query_at.lock().unwrap().expect("no query went out");
    assert!(
        queried_at.duration_since(started) >= Duration::from_secs(90),
        "network activity before the availability back-off elapsed",
    );
}

/// Full-variant integrity failure: a payload whose digest does not match
/// the advertised file hash is rejected before the validator ever runs.
#[tokio::test(start_paused = true)]
async fn block_full_variant_integrity_failure() {
    let p = peer(4);
    let registries = Registries::new();

    let shard = ShardIdent::new(0, ShardIdent::FULL_PREFIX);
    let id = block_id(5, shard, HashBytes::new([0xaa; 32]));
    let payload = Bytes::from_static(b"block bytes that do not match the hash");

    let control = control_from(|query| panic!("no control traffic expected, got {query:?}"));
    let bulk = {
        let payload = payload.clone();
        bulk_from(move |query| match query {
            BulkQuery::DownloadBlockFull(requested) => Ok(BulkResponse::BlockFull {
                id: requested,
                block: payload.clone(),
                proof: Bytes::from_static(b"proof"),
                is_link: true,
            }),
            _ => panic!("unexpected bulk query: {query:?}"),
        })
    };

    let manager_state = Arc::new(ManagerState::default());
    let ctx = context(
        manager_from(Arc::clone(&manager_state)),
        control,
        bulk,
        overlay_returning(vec![]),
        registries,
        ProgressChannel::disabled(),
    );

    let request = BlockDownloadRequest {
        block_id: Some(id),
        prev: None,
        peer: Some(p),
        priority: 1,
        deadline: deadline_in(60),
    };

    let result = BlockDownload::new(request, BlockDownloadVariant::Full, ctx)
        .run()
        .await;

    assert!(matches!(result, Err(DownloadError::IntegrityMismatch)));
    assert_eq!(
        manager_state.validate_calls.load(Ordering::SeqCst),
        0,
        "the validator must never see a payload with a bad hash",
    );
}

/// Legacy variant full path: prepare proof, fetch + validate it, prepare
/// block, fetch data with a matching hash.
#[tokio::test(start_paused = true)]
async fn block_legacy_full_path() {
    let p = peer(5);
    let registries = Registries::new();

    let payload = Bytes::from_static(b"the actual block bytes");
    let id = hashed_block_id(6, ShardIdent::MASTERCHAIN, &payload);

    let control = control_from(move |query| match query {
        ControlQuery::PrepareBlockProof { allow_partial, .. } => {
            // Masterchain target: only a full proof is acceptable.
            assert!(!allow_partial);
            Ok(ControlResponse::PreparedProof)
        }
        ControlQuery::PrepareBlock(_) => Ok(ControlResponse::Prepared),
        _ => panic!("unexpected control query: {query:?}"),
    });

    let bulk = {
        let payload = payload.clone();
        bulk_from(move |query| match query {
            BulkQuery::DownloadBlockProof(_) => {
                Ok(BulkResponse::Data(Bytes::from_static(b"valid proof")))
            }
            BulkQuery::DownloadBlock(_) => Ok(BulkResponse::Data(payload.clone())),
            _ => panic!("unexpected bulk query: {query:?}"),
        })
    };

    let manager_state = Arc::new(ManagerState {
        accept_first_validations: usize::MAX,
        ..ManagerState::default()
    });
    let ctx = context(
        manager_from(Arc::clone(&manager_state)),
        control,
        bulk,
        overlay_returning(vec![]),
        Arc::clone(&registries),
        ProgressChannel::disabled(),
    );

    let request = BlockDownloadRequest {
        block_id: Some(id),
        prev: None,
        peer: Some(p),
        priority: 1,
        deadline: deadline_in(60),
    };

    let block = BlockDownload::new(request, BlockDownloadVariant::Legacy, ctx)
        .run()
        .await
        .unwrap();

    assert_eq!(block.id, id);
    assert_eq!(block.data, payload);
    assert_eq!(manager_state.validate_calls.load(Ordering::SeqCst), 1);

    let quality = registries.peer_quality.get(p).unwrap();
    assert_eq!(quality.successes, 1);
}

/// Walker partial success: the fifth proof fails validation, the first
/// four ids are delivered and no further proofs are requested.
#[tokio::test(start_paused = true)]
async fn key_block_walk_partial_success() {
    let p = peer(6);
    let registries = Registries::new();

    let anchor = block_id(100, ShardIdent::MASTERCHAIN, HashBytes::new([1; 32]));
    let ids: Vec<BlockId> = (101..=108)
        .map(|seqno| block_id(seqno, ShardIdent::MASTERCHAIN, HashBytes::new([2; 32])))
        .collect();

    let control = {
        let ids = ids.clone();
        control_from(move |query| match query {
            ControlQuery::GetNextKeyBlockIds { max, .. } => {
                assert_eq!(max, 8);
                Ok(ControlResponse::KeyBlockIds {
                    ids: ids.clone(),
                    error: false,
                })
            }
            _ => panic!("unexpected control query: {query:?}"),
        })
    };

    let proof_fetches = Arc::new(AtomicUsize::new(0));
    let bulk = {
        let proof_fetches = Arc::clone(&proof_fetches);
        bulk_from(move |query| match query {
            BulkQuery::DownloadBlockProof(_) => {
                proof_fetches.fetch_add(1, Ordering::SeqCst);
                Ok(BulkResponse::Data(Bytes::from_static(b"proof")))
            }
            _ => panic!("unexpected bulk query: {query:?}"),
        })
    };

    let manager_state = Arc::new(ManagerState {
        accept_first_validations: 4,
        is_key_block: true,
        ..ManagerState::default()
    });
    let ctx = context(
        manager_from(Arc::clone(&manager_state)),
        control,
        bulk,
        overlay_returning(vec![]),
        registries,
        ProgressChannel::disabled(),
    );

    let request = KeyBlockWalkRequest {
        anchor,
        limit: 8,
        peer: Some(p),
        priority: 1,
        deadline: deadline_in(60),
    };

    let accepted = KeyBlockWalk::new(request, ctx).run().await.unwrap();

    assert_eq!(accepted, ids[..4].to_vec());
    assert_eq!(proof_fetches.load(Ordering::SeqCst), 5);
    assert_eq!(manager_state.validate_calls.load(Ordering::SeqCst), 5);
}

/// State download timeout: a bulk transport slower than the deadline
/// produces `Timeout` and the peer is debited.
#[tokio::test(start_paused = true)]
async fn state_download_timeout() {
    let p = peer(7);
    let registries = Registries::new();

    let mc_shard = ShardIdent::MASTERCHAIN;
    let id = block_id(200, ShardIdent::new(0, ShardIdent::FULL_PREFIX), HashBytes::ZERO);
    let mc_id = block_id(201, mc_shard, HashBytes::ZERO);

    let control = control_from(|query| match query {
        ControlQuery::PreparePersistentState { .. } => Ok(ControlResponse::PreparedState),
        ControlQuery::GetPersistentStateSize { .. } => {
            Ok(ControlResponse::PersistentStateSize(8 * 1024 * 1024))
        }
        _ => panic!("unexpected control query: {query:?}"),
    });

    let bulk = BoxCloneService::new(service_fn(|_: BulkRequest| {
        async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(BulkResponse::Data(Bytes::from_static(b"too late")))
        }
        .boxed()
    }));

    let ctx = context(
        manager_from(Arc::default()),
        control,
        bulk,
        overlay_returning(vec![]),
        Arc::clone(&registries),
        ProgressChannel::disabled(),
    );

    let request = StateDownloadRequest {
        block_id: id,
        mc_block_id: Some(mc_id),
        peer: Some(p),
        priority: 1,
        deadline: deadline_in(2),
    };

    let started = Instant::now();
    let result = StateDownload::new(request, ctx).run().await;

    assert!(matches!(result, Err(DownloadError::Timeout)));
    assert_eq!(started.elapsed(), Duration::from_secs(2));

    let quality = registries.peer_quality.get(p).unwrap();
    assert_eq!(quality.failures, 1);
    assert_eq!(quality.consecutive_failures, 1);
}

/// The state downloader reassembles sequential slices and answers from the
/// manager's cache when one exists.
#[tokio::test(start_paused = true)]
async fn state_download_reassembles_slices() {
    let p = peer(8);
    let registries = Registries::new();

    let id = block_id(300, ShardIdent::new(0, ShardIdent::FULL_PREFIX), HashBytes::ZERO);
    let mc_id = block_id(301, ShardIdent::MASTERCHAIN, HashBytes::ZERO);

    let control = control_from(|query| match query {
        ControlQuery::PreparePersistentState { .. } => Ok(ControlResponse::PreparedState),
        ControlQuery::GetPersistentStateSize { .. } => {
            Ok(ControlResponse::PersistentStateSize(SLICE_SIZE + 3))
        }
        _ => panic!("unexpected control query: {query:?}"),
    });

    let bulk = bulk_from(|query| match query {
        BulkQuery::DownloadPersistentStateSlice { offset, .. } => {
            let data = if offset == 0 {
                vec![0x11; SLICE_SIZE as usize]
            } else {
                assert_eq!(offset, SLICE_SIZE);
                vec![0x22; 3]
            };
            Ok(BulkResponse::Data(Bytes::from(data)))
        }
        _ => panic!("unexpected bulk query: {query:?}"),
    });

    let ctx = context(
        manager_from(Arc::default()),
        control,
        bulk,
        overlay_returning(vec![]),
        Arc::clone(&registries),
        ProgressChannel::disabled(),
    );

    let request = StateDownloadRequest {
        block_id: id,
        mc_block_id: Some(mc_id),
        peer: Some(p),
        priority: 1,
        deadline: deadline_in(60),
    };

    let state = StateDownload::new(request, ctx).run().await.unwrap();
    assert_eq!(state.len() as u64, SLICE_SIZE + 3);
    assert_eq!(&state[SLICE_SIZE as usize..], &[0x22; 3]);

    let quality = registries.peer_quality.get(p).unwrap();
    assert_eq!(quality.successes, 1);
}

/// A cached state short-circuits without touching the network.
#[tokio::test(start_paused = true)]
async fn state_download_uses_cache() {
    let cached = Bytes::from_static(b"cached state bytes");
    let manager_state = Arc::new(ManagerState {
        cached_state: Some(cached.clone()),
        ..ManagerState::default()
    });

    let control = control_from(|query| panic!("no control traffic expected, got {query:?}"));
    let bulk = bulk_from(|query| panic!("no bulk traffic expected, got {query:?}"));

    let ctx = context(
        manager_from(manager_state),
        control,
        bulk,
        overlay_returning(vec![]),
        Registries::new(),
        ProgressChannel::disabled(),
    );

    let request = StateDownloadRequest {
        block_id: block_id(1, ShardIdent::MASTERCHAIN, HashBytes::ZERO),
        mc_block_id: Some(block_id(2, ShardIdent::MASTERCHAIN, HashBytes::ZERO)),
        peer: None,
        priority: 1,
        deadline: deadline_in(60),
    };

    let state = StateDownload::new(request, ctx).run().await.unwrap();
    assert_eq!(state, cached);
}
