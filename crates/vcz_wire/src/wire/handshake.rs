use speedy::{BigEndian, Readable, Writable};
use tracing::warn;

use crate::{
    bitfield::Reserved,
    error::Error,
    types::{InfoHash, PeerId},
    wire::PSTR,
};

/// pstrlen = 19
/// pstr = "BitTorrent protocol"
/// This is the very first message exchanged. If the peer's protocol string
/// (`BitTorrent protocol`) or the info hash differs from ours, the connection
/// is severed. The reserved field advertises which extensions the peer
/// supports. The peer id is usually the client name and version.
#[derive(Clone, Debug, PartialEq, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    /// Length of a handshake with the standard protocol string.
    pub const LEN: usize = 1 + 19 + 8 + 20 + 20;

    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        reserved: Reserved,
    ) -> Self {
        Self {
            pstr_len: PSTR.len() as u8,
            pstr: PSTR,
            reserved: reserved.into(),
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Result<[u8; Self::LEN], Error> {
        let mut buf = [0u8; Self::LEN];
        let temp = self
            .write_to_vec_with_ctx(BigEndian {})
            .map_err(Error::SpeedyError)?;

        buf.copy_from_slice(&temp[..]);

        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Self::read_from_buffer_with_ctx(BigEndian {}, buf)
            .map_err(Error::SpeedyError)
    }

    /// Build the remote handshake out of the frame parser's two steps. `None`
    /// if the protocol identifier is not `BitTorrent protocol`, which is a
    /// different protocol altogether.
    pub fn from_parts(pstr_len: u8, body: &[u8]) -> Option<Self> {
        if pstr_len as usize != PSTR.len() || &body[..PSTR.len()] != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return None;
        }

        let mut buf = Vec::with_capacity(Self::LEN);
        buf.push(pstr_len);
        buf.extend_from_slice(body);

        Self::deserialize(&buf).ok()
    }

    pub fn reserved(&self) -> Reserved {
        Reserved::from(self.reserved)
    }

    /// If `target`, the handshake received from the remote, may continue a
    /// connection that was opened for our swarm.
    pub fn validate(&self, target: &Self) -> bool {
        if self.info_hash != target.info_hash {
            warn!("! info_hash from receiving handshake does not match ours");
            return false;
        }
        if target.pstr_len != 19 {
            warn!("! handshake with wrong pstr_len, dropping connection");
            return false;
        }
        if target.pstr != PSTR {
            warn!("! handshake with wrong pstr, dropping connection");
            return false;
        }
        true
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn handshake() {
        let info_hash = InfoHash([5u8; 20]);
        let peer_id = PeerId([7u8; 20]);
        let our_handshake = Handshake::new(
            info_hash.clone(),
            peer_id.clone(),
            Reserved::supported(true, false),
        );

        assert_eq!(our_handshake.pstr_len, 19);
        assert_eq!(our_handshake.pstr, PSTR);
        assert_eq!(our_handshake.peer_id, peer_id);
        assert_eq!(our_handshake.info_hash, info_hash);

        let bytes = our_handshake.serialize().unwrap();
        assert_eq!(
            bytes,
            [
                19, 66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112,
                114, 111, 116, 111, 99, 111, 108, 0, 0, 0, 0, 0, 16, 0, 0, 5,
                5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 7, 7,
                7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7
            ]
        );

        let decoded = Handshake::from_parts(bytes[0], &bytes[1..]).unwrap();
        assert_eq!(decoded, our_handshake);
        assert!(decoded.reserved().supports_extended());
        assert!(our_handshake.validate(&decoded));
    }

    #[test]
    fn wrong_protocol() {
        let mut bytes = Handshake::new(
            InfoHash([1u8; 20]),
            PeerId([2u8; 20]),
            Reserved::default(),
        )
        .serialize()
        .unwrap();

        bytes[1] = b'b';
        assert!(Handshake::from_parts(bytes[0], &bytes[1..]).is_none());

        // a shorter protocol string never matches
        let body = [0u8; 4 + 48];
        assert!(Handshake::from_parts(4, &body).is_none());
    }

    #[test]
    fn other_swarm() {
        let ours = Handshake::new(
            InfoHash([1u8; 20]),
            PeerId([2u8; 20]),
            Reserved::default(),
        );
        let theirs = Handshake::new(
            InfoHash([3u8; 20]),
            PeerId([2u8; 20]),
            Reserved::default(),
        );
        assert!(!ours.validate(&theirs));
    }
}
