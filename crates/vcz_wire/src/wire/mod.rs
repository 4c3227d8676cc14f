//! Documentation of the "TCP Wire" protocol between Peers in the network.
//! Peers will follow this protocol to exchange information about torrents.
//!
//! All of the messages after the handshake take the form of
//! `<length prefix><message ID><payload>`. The length prefix is a four byte
//! big-endian value, the message ID is a single byte and the payload is
//! message dependent. A length prefix of zero is a keep-alive.

pub mod frame;
mod handshake;

pub use frame::*;
pub use handshake::*;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use crate::{bitfield::Bitfield, error::Error};

/// The default block_len that most clients support, some clients drop
/// the connection on blocks larger than this value.
///
/// Tha last block of a piece might be smallar.
pub const BLOCK_LEN: u32 = 16384;

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A Block is a subset of a Piece,
/// pieces are subsets of the entire Torrent data.
///
/// When peers send data (seed) to us, they send us Blocks.
/// This happens on the "Piece" message of the peer wire protocol.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data. 16 KiB most of the times,
    /// but the last block of a piece *might* be smaller.
    pub block: Bytes,
}

/// The representation of a [`Block`].
///
/// When we ask a peer to give us a [`Block`], we send this struct,
/// using the "Request" message of the tcp wire protocol. The same layout is
/// used by the "Cancel" message.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes. <= 16 KiB
    pub len: u32,
}

impl Default for BlockInfo {
    fn default() -> Self {
        Self { index: 0, begin: 0, len: BLOCK_LEN }
    }
}

impl From<&Block> for BlockInfo {
    fn from(val: &Block) -> Self {
        BlockInfo {
            index: val.index,
            begin: val.begin,
            len: val.block.len() as u32,
        }
    }
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    /// Encodes the block info in the network binary protocol's format into
    /// the given buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }

    fn decode(buf: &mut Bytes) -> Self {
        let index = buf.get_u32();
        let begin = buf.get_u32();
        let len = buf.get_u32();
        Self { index, begin, len }
    }
}

/// `<ext_id><payload>` of a [`Core::Extended`] message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMessage(pub u8, pub Bytes);

impl From<ExtendedMessage> for Core {
    fn from(value: ExtendedMessage) -> Self {
        Self::Extended(value)
    }
}

/// Messages exchanged after a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Core {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    Port(u16),
    Extended(ExtendedMessage),
}

/// The IDs of the [`Core`] messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CoreId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl TryFrom<u8> for CoreId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CoreId::Choke),
            1 => Ok(CoreId::Unchoke),
            2 => Ok(CoreId::Interested),
            3 => Ok(CoreId::NotInterested),
            4 => Ok(CoreId::Have),
            5 => Ok(CoreId::Bitfield),
            6 => Ok(CoreId::Request),
            7 => Ok(CoreId::Piece),
            8 => Ok(CoreId::Cancel),
            9 => Ok(CoreId::Port),
            20 => Ok(CoreId::Extended),
            v => Err(v),
        }
    }
}

/// Why a message payload could not be turned into a [`Core`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadError {
    /// Opcode that this engine does not know, the message is skipped.
    UnknownId(u8),
    /// The payload is shorter than the fixed fields of its message.
    Truncated(CoreId),
}

impl Core {
    /// Length of the message on the wire, including the length prefix.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            Core::KeepAlive => 4,
            Core::Choke
            | Core::Unchoke
            | Core::Interested
            | Core::NotInterested => 4 + 1,
            Core::Have(_) => 4 + 1 + 4,
            Core::Bitfield(b) => 4 + 1 + b.as_raw_slice().len(),
            Core::Request(_) | Core::Cancel(_) => 4 + 1 + 4 + 4 + 4,
            Core::Piece(b) => 4 + 1 + 4 + 4 + b.block.len(),
            Core::Port(_) => 4 + 1 + 2,
            Core::Extended(m) => 4 + 1 + 1 + m.1.len(),
        }
    }

    /// Decode the payload of a message, that is, everything after the
    /// length prefix: `<message ID><payload>`.
    pub fn from_payload(mut payload: Bytes) -> Result<Self, PayloadError> {
        if payload.is_empty() {
            return Ok(Core::KeepAlive);
        }

        let id = CoreId::try_from(payload.get_u8())
            .map_err(PayloadError::UnknownId)?;

        let need = match id {
            CoreId::Have => 4,
            CoreId::Request | CoreId::Cancel => 4 + 4 + 4,
            CoreId::Piece => 4 + 4,
            CoreId::Port => 2,
            CoreId::Extended => 1,
            _ => 0,
        };

        if payload.remaining() < need {
            return Err(PayloadError::Truncated(id));
        }

        let msg = match id {
            // <len=0001><id=0>
            CoreId::Choke => Core::Choke,

            // <len=0001><id=1>
            CoreId::Unchoke => Core::Unchoke,

            // <len=0001><id=2>
            CoreId::Interested => Core::Interested,

            // <len=0001><id=3>
            CoreId::NotInterested => Core::NotInterested,

            // <len=0005><id=4><piece index>
            CoreId::Have => Core::Have(payload.get_u32()),

            // <len=0001+X><id=5><bitfield>
            CoreId::Bitfield => {
                Core::Bitfield(Bitfield::from_vec(payload.to_vec()))
            }

            // <len=0013><id=6><index><begin><length>
            CoreId::Request => Core::Request(BlockInfo::decode(&mut payload)),

            // <len=0009+X><id=7><index><begin><block>
            CoreId::Piece => {
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Core::Piece(Block { index, begin, block: payload })
            }

            // <len=0013><id=8><index><begin><length>
            CoreId::Cancel => Core::Cancel(BlockInfo::decode(&mut payload)),

            // <len=0003><id=9><listen-port>
            CoreId::Port => Core::Port(payload.get_u16()),

            // <len=0002+X><id=20><ext_id><payload>
            CoreId::Extended => {
                let ext_id = payload.get_u8();
                Core::Extended(ExtendedMessage(ext_id, payload))
            }
        };

        Ok(msg)
    }
}

/// Encodes [`Core`] messages with their length prefix.
#[derive(Debug, Clone, Default)]
pub struct CoreCodec;

impl Encoder<Core> for CoreCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Core,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        buf.reserve(item.len());

        match item {
            Core::KeepAlive => {
                buf.put_u32(0);
            }
            Core::Choke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Choke as u8);
            }
            Core::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Unchoke as u8);
            }
            Core::Interested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::Interested as u8);
            }
            Core::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(CoreId::NotInterested as u8);
            }
            Core::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(CoreId::Have as u8);
                buf.put_u32(piece_index);
            }
            Core::Bitfield(bitfield) => {
                let v = bitfield.as_raw_slice();
                let msg_len = u32::try_from(1 + v.len())
                    .map_err(|_| Error::ValueOutOfRange("bitfield length"))?;
                buf.put_u32(msg_len);
                buf.put_u8(CoreId::Bitfield as u8);
                buf.extend_from_slice(v);
            }
            Core::Request(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Request as u8);
                block_info.encode(buf);
            }
            Core::Piece(Block { index, begin, block }) => {
                let msg_len = u32::try_from(1 + 4 + 4 + block.len())
                    .map_err(|_| Error::ValueOutOfRange("block length"))?;
                buf.put_u32(msg_len);
                buf.put_u8(CoreId::Piece as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.extend_from_slice(&block);
            }
            Core::Cancel(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(CoreId::Cancel as u8);
                block_info.encode(buf);
            }
            Core::Port(port) => {
                buf.put_u32(1 + 2);
                buf.put_u8(CoreId::Port as u8);
                buf.put_u16(port);
            }
            Core::Extended(ExtendedMessage(ext_id, payload)) => {
                let msg_len = u32::try_from(payload.len() + 2)
                    .map_err(|_| Error::ValueOutOfRange("extended payload"))?;
                buf.put_u32(msg_len);
                buf.put_u8(CoreId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl TryFrom<Core> for BytesMut {
    type Error = Error;

    fn try_from(value: Core) -> Result<Self, Self::Error> {
        let mut dst = BytesMut::new();
        CoreCodec.encode(value, &mut dst)?;
        Ok(dst)
    }
}
