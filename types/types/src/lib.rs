//! Galena data types.
//!
//! Shared identifier and value types used by the download subsystem: node and
//! overlay identifiers, block identifiers, block handle snapshots and peer
//! capability records.
//!
//! This crate is kept free of protocol and I/O concerns on purpose, only
//! plain data lives here.

mod block_id;
mod capabilities;
mod handle;
mod ids;

pub use block_id::{BlockId, Seqno, ShardIdent, MASTERCHAIN_ID};
pub use capabilities::PeerCapabilities;
pub use handle::BlockHandle;
pub use ids::{HashBytes, OverlayId, PeerId};
