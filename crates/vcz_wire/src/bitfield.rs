//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
type ReservedAlias = BitArray<[u8; 8], Msb0>;

/// Bit of the extension protocol, `reserved[5] & 0x10`.
const EXTENSION_BIT: usize = 43;

/// Bit of the DHT, `reserved[7] & 0x01`.
const DHT_BIT: usize = 63;

#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub ReservedAlias);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(ReservedAlias::from(value))
    }
}

impl From<Reserved> for [u8; 8] {
    fn from(value: Reserved) -> Self {
        value.0.into_inner()
    }
}

impl Reserved {
    /// Reserved bits of the protocols that the local side advertises.
    pub fn supported(extension: bool, dht: bool) -> Reserved {
        let mut reserved = Reserved::default();
        reserved.0.set(EXTENSION_BIT, extension);
        reserved.0.set(DHT_BIT, dht);
        reserved
    }

    pub fn supports_extended(&self) -> bool {
        self.0[EXTENSION_BIT]
    }

    pub fn supports_dht(&self) -> bool {
        self.0[DHT_BIT]
    }
}
