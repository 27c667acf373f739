use std::fmt::{self, Debug, Display, Formatter};

/// A 256-bit value used both as an identity and as an integrity seal.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashBytes(pub [u8; 32]);

impl HashBytes {
    pub const ZERO: Self = Self([0; 32]);

    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for HashBytes {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl Display for HashBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Debug for HashBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // The first 4 bytes are enough to tell ids apart in logs.
        write!(f, "{}..", hex::encode(&self.0[..4]))
    }
}

/// The short id of a node on the overlay.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub HashBytes);

impl PeerId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(HashBytes::new(bytes))
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({:?})", self.0)
    }
}

/// The short id of a P2P overlay.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OverlayId(pub HashBytes);

impl OverlayId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(HashBytes::new(bytes))
    }
}

impl Display for OverlayId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for OverlayId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayId({:?})", self.0)
    }
}
