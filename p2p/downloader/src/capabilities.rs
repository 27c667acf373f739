//! Peer capability tracking.
//!
//! Peers advertise `(protocol_version, flags)` through a small
//! `get_capabilities` query. The record lets block downloads prefer the
//! one-round-trip variant against peers that understand it. Everything here
//! is opportunistic: a missing or stale record only means the legacy
//! variant is used.

use std::{collections::HashMap, sync::Mutex};

use galena_types::{PeerCapabilities, PeerId};

use crate::{
    constants::CONTROL_QUERY_TIMEOUT,
    error::{DownloadError, DownloadResult},
    protocol::{ControlQuery, ControlResponse},
    DownloaderContext,
};

/// Which block download protocol to use against a peer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockDownloadVariant {
    /// Three round trips: prepare proof, fetch proof, prepare + fetch data.
    Legacy,
    /// One `download_block_full` round trip.
    Full,
}

/// The process-wide capability store.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    peers: Mutex<HashMap<PeerId, PeerCapabilities>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerId, capabilities: PeerCapabilities) {
        self.peers.lock().unwrap().insert(peer, capabilities);
    }

    pub fn get(&self, peer: PeerId) -> Option<PeerCapabilities> {
        self.peers.lock().unwrap().get(&peer).copied()
    }

    /// The download variant to use against this peer. Unknown peers get
    /// the legacy protocol.
    pub fn block_variant_for(&self, peer: PeerId) -> BlockDownloadVariant {
        match self.get(peer) {
            Some(caps) if caps.supports_full_block_download() => BlockDownloadVariant::Full,
            Some(_) | None => BlockDownloadVariant::Legacy,
        }
    }
}

/// Pings a peer for its capabilities and records the reply.
pub async fn fetch_capabilities(
    ctx: &mut DownloaderContext,
    peer: PeerId,
) -> DownloadResult<PeerCapabilities> {
    let response = ctx
        .control_query(Some(peer), ControlQuery::GetCapabilities, CONTROL_QUERY_TIMEOUT)
        .await?;

    let ControlResponse::Capabilities(capabilities) = response else {
        return Err(DownloadError::Protocol);
    };

    ctx.registries.capabilities.insert(peer, capabilities);
    tracing::debug!(%peer, version = capabilities.version, "peer capabilities");
    Ok(capabilities)
}
