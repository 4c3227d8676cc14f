//! Metadata exchange, BEP 9.
//!
//! <http://www.bittorrent.org/beps/bep_0009.html>
//!
//! The info dictionary is downloaded in pieces of 16 KiB, one request at a
//! time. Every message is a bencoded dict, the data message has the bytes of
//! the piece appended right after the dict.

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::ToBencode,
};
use bytes::{Bytes, BytesMut};
use sha1_smol::Sha1;
use tracing::{debug, info, warn};

use crate::{error::Error, types::InfoHash};

use super::{ExtEvent, ExtensionHandler, UT_METADATA};

/// Size of every piece of the info dictionary, except the last one.
pub const METADATA_PIECE_LEN: u32 = 16384;

/// Larger sizes announced by a peer are treated as unknown.
pub const MAX_METADATA_SIZE: u32 = 16 * 1024 * 1024;

/// The dict at the start of every metadata message.
#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    pub msg_type: MetadataMsgType,
    pub piece: u32,
    pub total_size: Option<u32>,
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MetadataMsgType {
    Request = 0,
    Response = 1,
    Reject = 2,
}

impl TryFrom<u8> for MetadataMsgType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            2 => Ok(Self::Reject),
            _ => Err(Error::BencodeError),
        }
    }
}

impl Metadata {
    pub fn request(piece: u32) -> Self {
        Self { msg_type: MetadataMsgType::Request, piece, total_size: None }
    }

    pub fn reject(piece: u32) -> Self {
        Self { msg_type: MetadataMsgType::Reject, piece, total_size: None }
    }

    /// The dict of a data message followed by the piece itself.
    pub fn data(
        piece: u32,
        total_size: u32,
        info: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let metadata = Self {
            msg_type: MetadataMsgType::Response,
            piece,
            total_size: Some(total_size),
        };

        let mut bytes = metadata.to_bencode()?;
        bytes.extend_from_slice(info);

        Ok(bytes)
    }

    /// Split a message into its dict and the bytes after it.
    ///
    /// # Errors
    ///
    /// If the message does not start with a valid metadata dict.
    pub fn extract(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        let mut decoder = Decoder::new(buf);

        let raw = match decoder.next_object()? {
            Some(Object::Dict(dict)) => dict.into_raw()?,
            _ => return Err(Error::BencodeError),
        };

        let metadata = Metadata::from_bencode(raw)?;

        Ok((metadata, &buf[raw.len()..]))
    }
}

impl FromBencode for Metadata {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut msg_type = None;
        let mut piece = None;
        let mut total_size = None;

        let mut dict_dec = object.try_into_dictionary()?;

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"msg_type", value) => {
                    msg_type = u8::decode_bencode_object(value)
                        .context("msg_type")
                        .map(Some)?;
                }
                (b"piece", value) => {
                    piece = u32::decode_bencode_object(value)
                        .context("piece")
                        .map(Some)?;
                }
                (b"total_size", value) => {
                    total_size = u32::decode_bencode_object(value)
                        .context("total_size")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        let msg_type = msg_type
            .and_then(|t| MetadataMsgType::try_from(t).ok())
            .ok_or_else(|| decoding::Error::missing_field("msg_type"))?;
        let piece =
            piece.ok_or_else(|| decoding::Error::missing_field("piece"))?;

        Ok(Self { msg_type, piece, total_size })
    }
}

impl ToBencode for Metadata {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"msg_type", self.msg_type as u8)?;
            e.emit_pair(b"piece", self.piece)?;
            if let Some(total_size) = self.total_size {
                e.emit_pair(b"total_size", total_size)?;
            };
            Ok(())
        })?;
        Ok(())
    }
}

/// Downloads the info dictionary of a torrent from a peer.
///
/// Pieces are accepted in order, every accepted piece asks for the next one
/// with [`ExtEvent::Next`]. When the last one arrives the info is checked
/// against the info hash: a match gives [`ExtEvent::Metadata`], a mismatch
/// starts over from the first piece. Requests from the remote are always
/// rejected, this side never serves metadata.
#[derive(Debug)]
pub struct MetadataExchange {
    info_hash: InfoHash,
    /// 0 until learned from the extension handshake or a data message.
    size: u32,
    info: BytesMut,
    next_piece: u32,
    done: bool,
}

impl MetadataExchange {
    pub fn new(metadata_size: u32, info_hash: InfoHash) -> Self {
        let size = if metadata_size > MAX_METADATA_SIZE {
            warn!("! metadata_size {metadata_size} is too large, ignoring");
            0
        } else {
            metadata_size
        };

        Self {
            info_hash,
            size,
            info: BytesMut::with_capacity(size as usize),
            next_piece: 0,
            done: false,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn piece_count(&self) -> u32 {
        self.size.div_ceil(METADATA_PIECE_LEN)
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    fn piece_len(&self, piece: u32) -> usize {
        let begin = piece * METADATA_PIECE_LEN;
        METADATA_PIECE_LEN.min(self.size.saturating_sub(begin)) as usize
    }

    fn on_data(
        &mut self,
        metadata: Metadata,
        data: &[u8],
    ) -> Result<Vec<ExtEvent>, Error> {
        if self.done {
            return Ok(Vec::new());
        }

        if self.size == 0 {
            match metadata.total_size {
                Some(size) if size > MAX_METADATA_SIZE => {
                    warn!("! metadata total_size {size} is too large");
                    return Ok(Vec::new());
                }
                Some(size) if size > 0 => self.size = size,
                _ => {
                    warn!("! metadata data without a known total_size");
                    return Ok(Vec::new());
                }
            }
        }

        if metadata.piece != self.next_piece {
            warn!(
                "! metadata piece {} while waiting for {}",
                metadata.piece, self.next_piece
            );
            return Ok(Vec::new());
        }

        let expected = self.piece_len(metadata.piece);

        if data.len() != expected {
            warn!(
                "! metadata piece {} with {} bytes, expected {expected}",
                metadata.piece,
                data.len()
            );
            return Ok(vec![ExtEvent::Next(self.next_piece)]);
        }

        self.info.extend_from_slice(data);
        self.next_piece += 1;

        if self.next_piece < self.piece_count() {
            return Ok(vec![ExtEvent::Next(self.next_piece)]);
        }

        let hash = Sha1::from(&self.info[..]).digest().bytes();

        if hash != self.info_hash.0 {
            warn!("! metadata does not match the info hash, starting over");
            self.info.clear();
            self.next_piece = 0;
            return Ok(vec![ExtEvent::Next(0)]);
        }

        info!("downloaded the metadata of {}", self.info_hash);
        self.done = true;

        let info: Bytes = self.info.split().freeze();
        Ok(vec![ExtEvent::Metadata(info)])
    }
}

impl ExtensionHandler for MetadataExchange {
    fn name(&self) -> &'static str {
        UT_METADATA
    }

    fn on_message(&mut self, payload: &[u8]) -> Result<Vec<ExtEvent>, Error> {
        let (metadata, data) = Metadata::extract(payload)?;

        match metadata.msg_type {
            MetadataMsgType::Request => {
                debug!("< metadata request {}, rejecting", metadata.piece);
                let reject = Metadata::reject(metadata.piece).to_bencode()?;
                Ok(vec![ExtEvent::Reply(Bytes::from(reject))])
            }
            MetadataMsgType::Reject => {
                debug!("< metadata reject {}", metadata.piece);
                Ok(Vec::new())
            }
            MetadataMsgType::Response => {
                debug!("< metadata data {}", metadata.piece);
                self.on_data(metadata, data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(len: usize) -> (Vec<u8>, InfoHash) {
        let info: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let hash = Sha1::from(&info).digest().bytes();
        (info, InfoHash(hash))
    }

    #[test]
    fn messages() {
        let request = Metadata::request(3).to_bencode().unwrap();
        assert_eq!(request, b"d8:msg_typei0e5:piecei3ee");

        let reject = Metadata::reject(0).to_bencode().unwrap();
        assert_eq!(reject, b"d8:msg_typei2e5:piecei0ee");

        let data = Metadata::data(1, 34256, b"xxxx").unwrap();
        assert_eq!(data, b"d8:msg_typei1e5:piecei1e10:total_sizei34256eexxxx");

        let (metadata, rest) = Metadata::extract(&data).unwrap();
        assert_eq!(metadata.msg_type, MetadataMsgType::Response);
        assert_eq!(metadata.piece, 1);
        assert_eq!(metadata.total_size, Some(34256));
        assert_eq!(rest, b"xxxx");

        // the dict ends where the decoder says, not at the first "ee"
        let msg = b"d8:msg_typei1e4:note2:ee5:piecei0e10:total_sizei3eexyz";
        let (metadata, rest) = Metadata::extract(msg).unwrap();
        assert_eq!(metadata.piece, 0);
        assert_eq!(metadata.total_size, Some(3));
        assert_eq!(rest, b"xyz");

        assert!(Metadata::extract(b"d5:piecei0ee").is_err());
        assert!(Metadata::extract(b"i1e").is_err());
        assert!(Metadata::extract(b"garbage").is_err());
    }

    #[test]
    fn download_in_pieces() {
        let len = METADATA_PIECE_LEN as usize * 2 + 100;
        let (info, info_hash) = info(len);
        let mut handler = MetadataExchange::new(len as u32, info_hash);
        assert_eq!(handler.piece_count(), 3);

        let mut events = Vec::new();
        for (i, chunk) in info.chunks(METADATA_PIECE_LEN as usize).enumerate() {
            let msg = Metadata::data(i as u32, len as u32, chunk).unwrap();
            events.extend(handler.on_message(&msg).unwrap());
        }

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], ExtEvent::Next(1));
        assert_eq!(events[1], ExtEvent::Next(2));
        assert_eq!(events[2], ExtEvent::Metadata(Bytes::from(info)));
        assert!(handler.is_complete());
    }

    #[test]
    fn size_from_data_message() {
        let (info, info_hash) = info(100);
        let mut handler = MetadataExchange::new(0, info_hash);

        let msg = Metadata::data(0, 100, &info).unwrap();
        let events = handler.on_message(&msg).unwrap();

        assert_eq!(handler.size(), 100);
        assert_eq!(events, vec![ExtEvent::Metadata(Bytes::from(info))]);
    }

    #[test]
    fn oversized_metadata() {
        let (info, info_hash) = info(100);
        let mut handler = MetadataExchange::new(u32::MAX, info_hash);
        assert_eq!(handler.size(), 0);
        assert_eq!(handler.info.capacity(), 0);

        let msg = Metadata::data(0, MAX_METADATA_SIZE + 1, &info).unwrap();
        assert!(handler.on_message(&msg).unwrap().is_empty());
        assert_eq!(handler.size(), 0);

        // a sane total_size is still learned afterwards
        let msg = Metadata::data(0, 100, &info).unwrap();
        let events = handler.on_message(&msg).unwrap();
        assert_eq!(events, vec![ExtEvent::Metadata(Bytes::from(info))]);
    }

    #[test]
    fn wrong_hash_starts_over() {
        let (info, _) = info(100);
        let mut handler = MetadataExchange::new(100, InfoHash([0u8; 20]));

        let msg = Metadata::data(0, 100, &info).unwrap();
        assert_eq!(handler.on_message(&msg).unwrap(), vec![ExtEvent::Next(0)]);
        assert!(!handler.is_complete());
    }

    #[test]
    fn out_of_order_piece() {
        let (info, info_hash) = info(METADATA_PIECE_LEN as usize + 1);
        let mut handler =
            MetadataExchange::new(METADATA_PIECE_LEN + 1, info_hash);

        let msg =
            Metadata::data(1, METADATA_PIECE_LEN + 1, &info[..1]).unwrap();
        assert!(handler.on_message(&msg).unwrap().is_empty());
    }

    #[test]
    fn requests_are_rejected() {
        let mut handler = MetadataExchange::new(0, InfoHash([0u8; 20]));
        let request = Metadata::request(4).to_bencode().unwrap();

        let events = handler.on_message(&request).unwrap();
        assert_eq!(
            events,
            vec![ExtEvent::Reply(Bytes::from_static(
                b"d8:msg_typei2e5:piecei4ee"
            ))]
        );

        let reject = Metadata::reject(4).to_bencode().unwrap();
        assert!(handler.on_message(&reject).unwrap().is_empty());
    }
}
