//! Reassembly of the blocks of the piece that is being downloaded.
//!
//! A piece is requested as `block_count` blocks of [`BLOCK_LEN`] bytes (the
//! last one may be shorter). Blocks may arrive in any order, each one goes
//! to the slot `begin / BLOCK_LEN` of a fixed arena. When every slot is
//! filled the blocks are concatenated in slot order and fed to a SHA-1
//! hasher, which is handed to the owner unfinalized: comparing it against
//! the expected piece hash is the owner's job.

use bytes::{Bytes, BytesMut};
use sha1_smol::Sha1;
use tracing::{debug, warn};

use crate::{
    error::Error,
    wire::{Block, BLOCK_LEN},
};

/// A piece with all of its blocks, in order.
#[derive(Clone, PartialEq)]
pub struct FinishedPiece {
    pub index: u32,
    pub data: Bytes,
    /// Hasher updated with `data`, not finalized.
    pub hasher: Sha1,
}

impl std::fmt::Debug for FinishedPiece {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinishedPiece")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .field("hash", &self.hasher.digest().to_string())
            .finish()
    }
}

/// What happened to a block given to the assembler.
#[derive(Debug)]
pub enum Assembled {
    /// Stored, the piece still misses blocks.
    Pending,
    /// The last missing block arrived.
    Finished(FinishedPiece),
    /// Not stored: a duplicate, outside the arena, or from another piece.
    Discarded,
}

/// The single piece download in flight on a connection.
pub struct PieceAssembler {
    index: Option<u32>,
    blocks: Vec<Option<Bytes>>,
    remaining: usize,
    hasher: Sha1,
}

impl std::fmt::Debug for PieceAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceAssembler")
            .field("index", &self.index)
            .field("block_count", &self.blocks.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl PieceAssembler {
    /// Start a download of `block_count` blocks. The piece index is learned
    /// from the first block when the caller did not know it.
    pub fn new(block_count: usize, index: Option<u32>) -> Result<Self, Error> {
        if block_count == 0 {
            return Err(Error::PieceEmpty);
        }

        Ok(Self {
            index,
            blocks: vec![None; block_count],
            remaining: block_count,
            hasher: Sha1::new(),
        })
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    /// How many blocks are still missing.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Store a block, completing the piece if it was the last one missing.
    pub fn add_block(&mut self, block: Block) -> Result<Assembled, Error> {
        let Block { index, begin, block } = block;

        if *self.index.get_or_insert(index) != index {
            warn!("! block of piece {index} while assembling {:?}", self.index);
            return Ok(Assembled::Discarded);
        }

        if begin % BLOCK_LEN != 0 {
            warn!("! block with unaligned begin {begin}");
            return Ok(Assembled::Discarded);
        }

        let slot = (begin / BLOCK_LEN) as usize;

        let Some(entry) = self.blocks.get_mut(slot) else {
            warn!(
                "! block {slot} outside of a piece with {} blocks",
                self.blocks.len()
            );
            return Ok(Assembled::Discarded);
        };

        if entry.is_some() {
            debug!("duplicate block {slot} of piece {index}");
            return Ok(Assembled::Discarded);
        }

        *entry = Some(block);
        self.remaining -= 1;

        if self.remaining > 0 {
            return Ok(Assembled::Pending);
        }

        Ok(Assembled::Finished(self.finish(index)?))
    }

    fn finish(&mut self, index: u32) -> Result<FinishedPiece, Error> {
        let missing = self.blocks.iter().filter(|b| b.is_none()).count();

        if missing > 0 {
            return Err(Error::PieceIncomplete { index, missing });
        }

        let len = self.blocks.iter().flatten().map(Bytes::len).sum();
        let mut data = BytesMut::with_capacity(len);

        for block in self.blocks.drain(..).flatten() {
            data.extend_from_slice(&block);
        }

        let data = data.freeze();
        self.hasher.update(&data);

        Ok(FinishedPiece { index, data, hasher: self.hasher.clone() })
    }
}

/// Split a piece into the requests of its blocks.
pub fn block_infos(
    index: u32,
    piece_len: u32,
) -> impl Iterator<Item = crate::wire::BlockInfo> {
    (0..piece_len).step_by(BLOCK_LEN as usize).map(move |begin| {
        crate::wire::BlockInfo::new(
            index,
            begin,
            BLOCK_LEN.min(piece_len - begin),
        )
    })
}
