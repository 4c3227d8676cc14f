//! Identifiers exchanged in the handshake.

use std::{fmt::Display, ops::Deref};

use rand::{distributions::Alphanumeric, Rng};
use speedy::{Readable, Writable};

use crate::error::Error;

/// Prefix of the peer ids generated by this client, Azureus-style.
const PEER_ID_PREFIX: &[u8; 8] = b"-VZ0003-";

/// The SHA-1 hash of the info dictionary, identity of the swarm.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Parse a 40 characters hex string.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let buff = hex::decode(s).map_err(|_| Error::InvalidHex)?;
        InfoHash::try_from(buff).map_err(|_| Error::InvalidHex)
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.to_string();
        f.write_str(&s[..10])
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<InfoHash> for [u8; 20] {
    fn from(value: InfoHash) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("The infohash must have exactly 20 bytes");
        }
        let mut buff = [0u8; 20];
        buff.copy_from_slice(&value);
        Ok(InfoHash(buff))
    }
}

/// 20 bytes that identify a peer, usually the client name and version
/// followed by random characters.
#[derive(Clone, PartialEq, Eq, Hash, Default, Readable, Writable)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generate a new id: the client prefix and 12 random alphanumerics.
    pub fn generate() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);

        let mut rng = rand::thread_rng();
        peer_id[8..].iter_mut().for_each(|b| *b = rng.sample(Alphanumeric));

        PeerId(peer_id)
    }

    /// Lossy utf-8 representation, most clients use printable ids.
    pub fn to_utf8_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_utf8_lossy())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl From<PeerId> for [u8; 20] {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl TryFrom<Vec<u8>> for PeerId {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("The PeerId must have exactly 20 bytes");
        }
        let mut buff = [0u8; 20];
        buff.copy_from_slice(&value);
        Ok(PeerId(buff))
    }
}

impl TryFrom<&str> for PeerId {
    type Error = &'static str;

    /// Peer ids given as text are taken byte by byte, like
    /// `-EM0022-PEANUTS4AITH`.
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        PeerId::try_from(value.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_from_hex() {
        let hash =
            InfoHash::from_hex("e940a7a57294e4c98f62514b32611e38181b6cae")
                .unwrap();
        assert_eq!(hash.0[0], 0xe9);
        assert_eq!(hash.0[19], 0xae);
        assert_eq!(
            hash.to_string(),
            "e940a7a57294e4c98f62514b32611e38181b6cae"
        );

        assert!(InfoHash::from_hex("e940").is_err());
        assert!(InfoHash::from_hex("not hex at all").is_err());
    }

    #[test]
    fn generated_peer_id() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], PEER_ID_PREFIX);
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
        assert_ne!(id, PeerId::generate());
    }

    #[test]
    fn peer_id_from_str() {
        let id = PeerId::try_from("-EM0022-PEANUTS4AITH").unwrap();
        assert_eq!(id.to_utf8_lossy(), "-EM0022-PEANUTS4AITH");
        assert!(PeerId::try_from("short").is_err());
    }
}
