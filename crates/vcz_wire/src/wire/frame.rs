//! Incremental parser of the inbound byte stream.
//!
//! The stream may be cut at any byte: a read can hold half a message, many
//! messages, or a message split across many reads. The parser always knows
//! how many bytes it needs next ([`ParseState::expected_length`]) and never
//! looks at a byte range it did not ask for. When that many bytes are
//! buffered, the slice is consumed and the state transitions to the next
//! step.
//!
//! ```text
//! AwaitingHandshakeLength --1--> AwaitingHandshakeBody { pstr_len }
//!   --pstr_len + 48--> AwaitingMessageLength --4--> AwaitingMessageBody
//!   --len--> AwaitingMessageLength ...
//! ```

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::{config::MAX_MESSAGE_SIZE, error::Error};

/// Bytes after the protocol string of a handshake:
/// `<reserved=8><info_hash=20><peer_id=20>`.
pub const HANDSHAKE_TAIL: usize = 8 + 20 + 20;

/// The single outstanding step of the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// `<pstrlen>`
    AwaitingHandshakeLength,
    /// `<pstr><reserved><info_hash><peer_id>`
    AwaitingHandshakeBody { pstr_len: u8 },
    /// `<length prefix>`
    AwaitingMessageLength,
    /// `<message ID><payload>`
    AwaitingMessageBody { len: u32 },
    /// The connection is closed, nothing else is parsed.
    Closed,
}

impl ParseState {
    /// How many bytes must be buffered before this step can run.
    pub fn expected_length(&self) -> usize {
        match self {
            Self::AwaitingHandshakeLength => 1,
            Self::AwaitingHandshakeBody { pstr_len } => {
                *pstr_len as usize + HANDSHAKE_TAIL
            }
            Self::AwaitingMessageLength => 4,
            Self::AwaitingMessageBody { len } => *len as usize,
            Self::Closed => usize::MAX,
        }
    }
}

/// A unit produced by the parser. Payloads are never partial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The body of the handshake, its length was given by `pstr_len`.
    Handshake { pstr_len: u8, body: Bytes },
    KeepAlive,
    /// `<message ID><payload>` of a message, without the length prefix.
    Message(Bytes),
    /// The remote announced a message bigger than we accept.
    Oversized(u32),
}

/// Decoder of [`Frame`]s, driven by an explicit [`ParseState`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    state: ParseState,
    max_message_size: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_MESSAGE_SIZE)
    }
}

impl FrameCodec {
    pub fn new(max_message_size: u32) -> Self {
        Self {
            state: ParseState::AwaitingHandshakeLength,
            max_message_size,
        }
    }

    /// A codec for a stream that already went through the handshake.
    pub fn after_handshake(max_message_size: u32) -> Self {
        Self { state: ParseState::AwaitingMessageLength, max_message_size }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn expected_length(&self) -> usize {
        self.state.expected_length()
    }

    /// Stop parsing, further bytes are ignored.
    pub fn close(&mut self) {
        self.state = ParseState::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state == ParseState::Closed
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == ParseState::Closed {
                buf.clear();
                return Ok(None);
            }

            let expected = self.state.expected_length();

            // incomplete step, the decoder is called again when more bytes
            // arrive.
            if buf.len() < expected {
                buf.reserve(expected - buf.len());
                return Ok(None);
            }

            let slice = buf.split_to(expected).freeze();

            match self.state {
                ParseState::AwaitingHandshakeLength => {
                    let pstr_len = slice[0];
                    trace!("handshake pstrlen {pstr_len}");
                    self.state = ParseState::AwaitingHandshakeBody { pstr_len };
                }
                ParseState::AwaitingHandshakeBody { pstr_len } => {
                    self.state = ParseState::AwaitingMessageLength;
                    return Ok(Some(Frame::Handshake { pstr_len, body: slice }));
                }
                ParseState::AwaitingMessageLength => {
                    let len = (&slice[..]).get_u32();

                    if len == 0 {
                        return Ok(Some(Frame::KeepAlive));
                    }

                    if len > self.max_message_size {
                        self.state = ParseState::Closed;
                        return Ok(Some(Frame::Oversized(len)));
                    }

                    self.state = ParseState::AwaitingMessageBody { len };
                }
                ParseState::AwaitingMessageBody { len } => {
                    if slice.len() != len as usize {
                        return Err(Error::Framing(
                            "message body differs from its length prefix",
                        ));
                    }
                    self.state = ParseState::AwaitingMessageLength;
                    return Ok(Some(Frame::Message(slice)));
                }
                ParseState::Closed => {
                    return Err(Error::Framing("parsed a closed stream"));
                }
            }
        }
    }
}
