use std::fmt::{self, Debug, Display, Formatter};

use crate::ids::HashBytes;

/// A masterchain block sequence number.
pub type Seqno = u32;

/// The masterchain workchain id.
pub const MASTERCHAIN_ID: i32 = -1;

/// A shard prefix: a workchain plus a shard bitmask.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardIdent {
    pub workchain: i32,
    pub prefix: u64,
}

impl ShardIdent {
    /// The full shard covering a whole workchain.
    pub const FULL_PREFIX: u64 = 0x8000_0000_0000_0000;

    /// The special masterchain prefix.
    pub const MASTERCHAIN: Self = Self {
        workchain: MASTERCHAIN_ID,
        prefix: Self::FULL_PREFIX,
    };

    pub const fn new(workchain: i32, prefix: u64) -> Self {
        Self { workchain, prefix }
    }

    pub const fn is_masterchain(&self) -> bool {
        self.workchain == MASTERCHAIN_ID
    }
}

impl Display for ShardIdent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.workchain, self.prefix)
    }
}

impl Debug for ShardIdent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ShardIdent({self})")
    }
}

/// A full block identifier.
///
/// The `(shard, seqno)` part names a position in a chain, the two hashes pin
/// the exact block: `root_hash` identifies the block's cell tree and
/// `file_hash` is the digest of the serialized block file, which is what
/// downloaded payloads are checked against.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub shard: ShardIdent,
    pub seqno: Seqno,
    pub root_hash: HashBytes,
    pub file_hash: HashBytes,
}

impl BlockId {
    pub const fn new(
        shard: ShardIdent,
        seqno: Seqno,
        root_hash: HashBytes,
        file_hash: HashBytes,
    ) -> Self {
        Self {
            shard,
            seqno,
            root_hash,
            file_hash,
        }
    }

    pub const fn is_masterchain(&self) -> bool {
        self.shard.is_masterchain()
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}):{:?}:{:?}",
            self.shard, self.seqno, self.root_hash, self.file_hash
        )
    }
}

impl Debug for BlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId{self}")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn masterchain_prefix() {
        assert!(ShardIdent::MASTERCHAIN.is_masterchain());
        assert!(!ShardIdent::new(0, ShardIdent::FULL_PREFIX).is_masterchain());
    }

    #[test]
    fn block_id_display() {
        let id = BlockId::new(ShardIdent::MASTERCHAIN, 42, HashBytes::ZERO, HashBytes::ZERO);
        assert_eq!(
            id.to_string(),
            "(-1:8000000000000000, 42):00000000..:00000000.."
        );
    }
}
