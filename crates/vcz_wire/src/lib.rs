//! The per-connection engine of the BitTorrent peer wire protocol.
//!
//! This crate implements one side of a peer connection: the handshake, the
//! length-prefixed framing of messages, the dispatch of every core message,
//! the reassembly of downloaded blocks into pieces and the extension protocol
//! (BEP 10) with its `ut_metadata` and `ut_pex` sub-protocols.
//!
//! The engine, [`connection::Connection`], is a plain state machine. It does
//! not own a socket: bytes received from the remote peer are given to it with
//! [`connection::Connection::feed`], and the bytes it wants to send are taken
//! with [`connection::Connection::take_outbound`]. Everything the application
//! needs to know about is surfaced as an [`connection::Event`].
//!
//! # Example
//!
//! ```
//! use vcz_wire::{
//!     config::Config,
//!     connection::{Connection, Event},
//!     types::{InfoHash, PeerId},
//! };
//!
//! let info_hash = InfoHash::from([7u8; 20]);
//! let peer_id = PeerId::generate();
//! let config = Config::default();
//! let mut conn = Connection::new(info_hash.clone(), peer_id, config);
//!
//! // pipe the connection into itself.
//! conn.send_handshake().unwrap();
//! let out = conn.take_outbound();
//! conn.feed(&out).unwrap();
//!
//! assert!(matches!(
//!     conn.next_event(),
//!     Some(Event::Handshake { info_hash: h, .. }) if h == info_hash
//! ));
//! ```
//!
//! When the transport is a tokio stream, [`session::Session`] drives a
//! connection over it.

pub mod bitfield;
pub mod config;
pub mod connection;
pub mod counter;
pub mod error;
pub mod extensions;
pub mod piece;
pub mod session;
pub mod types;
pub mod wire;
