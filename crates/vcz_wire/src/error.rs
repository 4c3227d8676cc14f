use std::io;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::connection::Event;

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::BencodeError
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::BencodeError
    }
}

/// Errors of the engine.
///
/// A misbehaving remote peer is never reported here, it closes the
/// connection instead. These variants are either caller misuse, I/O, or a
/// defect inside the engine itself.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Frame parser invariant violated: {0}")]
    Framing(&'static str),

    #[error(
        "Piece {index} completed with {missing} missing blocks, the assembler \
         accounting is broken"
    )]
    PieceIncomplete { index: u32, missing: usize },

    #[error("A piece download is already in flight on this connection")]
    PieceInFlight,

    #[error("A piece request must contain at least one block")]
    PieceEmpty,

    #[error("Failed to decode or encode the bencode buffer")]
    BencodeError,

    #[error("Error when serializing/deserializing")]
    SpeedyError(#[from] speedy::Error),

    #[error("IO error")]
    IO(#[from] io::Error),

    #[error("The value does not fit in the wire format: {0}")]
    ValueOutOfRange(&'static str),

    #[error("The given hex string is not a valid 20 bytes identifier")]
    InvalidHex,

    #[error("Could not send event to the application")]
    SendErrorEvent(#[from] mpsc::error::SendError<Event>),

    #[error(
        "Tried to load $HOME but could not find it. Please make sure you have \
         a $HOME env and that this program has the permission to read it."
    )]
    HomeInvalid,

    #[error(
        "Error while trying to read the configuration file, please make sure \
         it has the correct format"
    )]
    ConfigDeserializeError(#[from] toml::de::Error),
}
