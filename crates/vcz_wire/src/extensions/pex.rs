//! Peer exchange, BEP 11.
//!
//! <http://www.bittorrent.org/beps/bep_0011.html>
//!
//! A pex message is a bencoded dict of compact peer lists: 6 bytes per IPv4
//! peer and 18 bytes per IPv6 peer, the port last. `added.f` and `added6.f`
//! carry one flag byte per added peer.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bendy::{
    decoding::{FromBencode, Object, ResultExt},
    encoding::{AsString, ToBencode},
};
use bytes::{BufMut, BytesMut};
use tracing::debug;

use crate::error::Error;

use super::{ExtEvent, ExtensionHandler, UT_PEX};

const V4_LEN: usize = 6;
const V6_LEN: usize = 18;

/// A peer announced in `added` or `added6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

impl PexPeer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, flags: PexFlags::default() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PexFlags {
    pub encryption: bool,
    pub seed: bool,
    pub utp: bool,
    pub holepunch: bool,
    pub connectable: bool,
}

impl From<u8> for PexFlags {
    fn from(b: u8) -> Self {
        Self {
            encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
            utp: b & 0x04 != 0,
            holepunch: b & 0x08 != 0,
            connectable: b & 0x10 != 0,
        }
    }
}

impl From<PexFlags> for u8 {
    fn from(f: PexFlags) -> Self {
        (f.encryption as u8)
            | (f.seed as u8) << 1
            | (f.utp as u8) << 2
            | (f.holepunch as u8) << 3
            | (f.connectable as u8) << 4
    }
}

/// The dict of a pex message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub added6: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
    pub dropped6: Vec<SocketAddr>,
}

fn ip_port(addr: &SocketAddr, buf: &mut BytesMut) {
    match addr {
        SocketAddr::V4(a) => buf.put_slice(&a.ip().octets()),
        SocketAddr::V6(a) => buf.put_slice(&a.ip().octets()),
    }
    buf.put_u16(addr.port());
}

fn compact<'a>(addrs: impl Iterator<Item = &'a SocketAddr>) -> Vec<u8> {
    let mut buf = BytesMut::new();
    for addr in addrs {
        ip_port(addr, &mut buf);
    }
    buf.to_vec()
}

fn addr_v4(chunk: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

fn addr_v6(chunk: &[u8]) -> SocketAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&chunk[..16]);
    let port = u16::from_be_bytes([chunk[16], chunk[17]]);
    SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
}

/// Peers of a compact list, trailing bytes that do not make a whole peer are
/// ignored. Missing flags are zero.
fn peers(data: &[u8], flags: &[u8], len: usize) -> Vec<PexPeer> {
    data.chunks_exact(len)
        .enumerate()
        .map(|(i, chunk)| PexPeer {
            addr: if len == V4_LEN { addr_v4(chunk) } else { addr_v6(chunk) },
            flags: flags.get(i).map(|f| PexFlags::from(*f)).unwrap_or_default(),
        })
        .collect()
}

fn addrs(data: &[u8], len: usize) -> Vec<SocketAddr> {
    peers(data, &[], len).into_iter().map(|p| p.addr).collect()
}

impl PexMessage {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.added6.is_empty()
            && self.dropped.is_empty()
            && self.dropped6.is_empty()
    }

    /// Put a peer in `added` or `added6`, per its address.
    pub fn add(&mut self, peer: PexPeer) {
        match peer.addr {
            SocketAddr::V4(_) => self.added.push(peer),
            SocketAddr::V6(_) => self.added6.push(peer),
        }
    }

    pub fn drop_addr(&mut self, addr: SocketAddr) {
        match addr {
            SocketAddr::V4(_) => self.dropped.push(addr),
            SocketAddr::V6(_) => self.dropped6.push(addr),
        }
    }
}

impl ToBencode for PexMessage {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        let flags = |peers: &[PexPeer]| -> Vec<u8> {
            peers.iter().map(|p| u8::from(p.flags)).collect()
        };

        encoder.emit_dict(|mut e| {
            e.emit_pair(
                b"added",
                AsString(compact(self.added.iter().map(|p| &p.addr))),
            )?;
            e.emit_pair(b"added.f", AsString(flags(&self.added)))?;
            e.emit_pair(
                b"added6",
                AsString(compact(self.added6.iter().map(|p| &p.addr))),
            )?;
            e.emit_pair(b"added6.f", AsString(flags(&self.added6)))?;
            e.emit_pair(b"dropped", AsString(compact(self.dropped.iter())))?;
            e.emit_pair(b"dropped6", AsString(compact(self.dropped6.iter())))?;
            Ok(())
        })
    }
}

impl FromBencode for PexMessage {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;

        let mut added = Vec::new();
        let mut added_f = Vec::new();
        let mut added6 = Vec::new();
        let mut added6_f = Vec::new();
        let mut dropped = Vec::new();
        let mut dropped6 = Vec::new();

        while let Some(pair) = dict.next_pair()? {
            let (field, key) = match pair.0 {
                b"added" => (&mut added, "added"),
                b"added.f" => (&mut added_f, "added.f"),
                b"added6" => (&mut added6, "added6"),
                b"added6.f" => (&mut added6_f, "added6.f"),
                b"dropped" => (&mut dropped, "dropped"),
                b"dropped6" => (&mut dropped6, "dropped6"),
                _ => continue,
            };
            *field = AsString::decode_bencode_object(pair.1)
                .context(key)
                .map(|s| s.0)?;
        }

        Ok(Self {
            added: peers(&added, &added_f, V4_LEN),
            added6: peers(&added6, &added6_f, V6_LEN),
            dropped: addrs(&dropped, V4_LEN),
            dropped6: addrs(&dropped6, V6_LEN),
        })
    }
}

/// Receives the peer lists of the remote.
#[derive(Debug, Default)]
pub struct PeerExchange {
    received: usize,
}

impl PeerExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many pex messages were received.
    pub fn received(&self) -> usize {
        self.received
    }
}

impl ExtensionHandler for PeerExchange {
    fn name(&self) -> &'static str {
        UT_PEX
    }

    fn on_message(&mut self, payload: &[u8]) -> Result<Vec<ExtEvent>, Error> {
        let msg = PexMessage::from_bencode(payload)?;
        self.received += 1;

        debug!(
            "< pex added {} added6 {} dropped {} dropped6 {}",
            msg.added.len(),
            msg.added6.len(),
            msg.dropped.len(),
            msg.dropped6.len()
        );

        let mut events = Vec::new();

        if !msg.added.is_empty() {
            events.push(ExtEvent::PexAdded(msg.added));
        }
        if !msg.added6.is_empty() {
            events.push(ExtEvent::PexAdded6(msg.added6));
        }
        if !msg.dropped.is_empty() {
            events.push(ExtEvent::PexDropped(msg.dropped));
        }
        if !msg.dropped6.is_empty() {
            events.push(ExtEvent::PexDropped6(msg.dropped6));
        }

        Ok(events)
    }
}
