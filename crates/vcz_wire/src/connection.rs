//! One side of a peer connection.
//!
//! [`Connection`] owns every piece of state of the connection and is driven
//! by explicit calls: [`Connection::feed`] with the bytes read from the
//! remote, `send_*` to queue messages, [`Connection::take_outbound`] to get
//! the bytes to write, and [`Connection::next_event`] to learn what happened.
//! It never blocks and never touches a socket.

use std::{collections::VecDeque, sync::Arc};

use bendy::{decoding::FromBencode, encoding::ToBencode};
use bytes::{Bytes, BytesMut};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, trace, warn};

use crate::{
    bitfield::{Bitfield, Reserved},
    config::Config,
    counter::Counter,
    error::Error,
    extensions::{
        metadata::Metadata, pex::PexPeer, ExtEvent, Extension,
        ExtensionRegistry, UT_METADATA, UT_PEX,
    },
    piece::{block_infos, Assembled, FinishedPiece, PieceAssembler},
    types::{InfoHash, PeerId},
    wire::{
        Block, BlockInfo, Core, CoreCodec, ExtendedMessage, Frame,
        FrameCodec, Handshake, PayloadError,
    },
};

/// Why a connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote spoke another protocol or is in another swarm.
    HandshakeMismatch,
    /// The remote is not interested in us anymore.
    NotInterested,
    /// The remote announced a message bigger than `max_message_size`.
    MessageTooLarge,
    /// A known message was shorter than its fixed fields.
    MalformedMessage,
    /// [`Connection::close`] was called.
    Local,
}

/// What the application needs to know about the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Handshake { info_hash: InfoHash, peer_id: PeerId },
    Interested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Cancel(BlockInfo),
    FinishedPiece(FinishedPiece),
    /// The info dictionary downloaded with `ut_metadata`.
    Metadata(Bytes),
    PexAdded(Vec<PexPeer>),
    PexAdded6(Vec<PexPeer>),
    PexDropped(Vec<std::net::SocketAddr>),
    PexDropped6(Vec<std::net::SocketAddr>),
    Close(CloseReason),
}

/// The protocol engine of a single peer connection.
#[derive(Debug)]
pub struct Connection {
    /// Random id used in the logs.
    id: String,
    info_hash: InfoHash,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    config: Config,

    /// If we are choking the remote.
    choked: bool,
    /// If we declared interest in the remote.
    interested: bool,
    /// If a piece download is in flight.
    busy: bool,
    peer_has_extension: bool,
    peer_has_dht: bool,

    /// Requests of the remote that were not served yet.
    pending_requests: VecDeque<BlockInfo>,
    extensions: ExtensionRegistry,
    /// Extension handshake given by the owner, sent in place of ours once
    /// the remote is known to support the extension protocol.
    extension_handshake: Option<Extension>,
    assembly: Option<PieceAssembler>,

    codec: FrameCodec,
    inbound: BytesMut,
    outbound: BytesMut,
    events: VecDeque<Event>,
    counter: Arc<Counter>,
    closed: Option<CloseReason>,
}

impl Connection {
    pub fn new(info_hash: InfoHash, local_id: PeerId, config: Config) -> Self {
        let id: String = thread_rng()
            .sample_iter(Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();

        let local = if config.extension_protocol {
            Extension::supported(&config).m
        } else {
            Default::default()
        };

        Self {
            id,
            info_hash,
            local_id,
            remote_id: None,
            choked: true,
            interested: false,
            busy: false,
            peer_has_extension: false,
            peer_has_dht: false,
            pending_requests: VecDeque::new(),
            extensions: ExtensionRegistry::new(local),
            extension_handshake: None,
            assembly: None,
            codec: FrameCodec::new(config.max_message_size),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            events: VecDeque::new(),
            counter: Arc::new(Counter::new()),
            closed: None,
            config,
        }
    }

    /// A connection that advertises `ext`, merged with its own dict, in its
    /// extension handshake.
    pub fn with_extension_handshake(mut self, ext: Extension) -> Self {
        self.extension_handshake = Some(ext);
        self
    }

    /// Give bytes read from the remote to the engine. The chunk may have
    /// any size and be cut at any byte, every message that is complete
    /// after it is dispatched before this returns.
    ///
    /// # Errors
    ///
    /// Only on defects of the engine itself, a misbehaving remote closes
    /// the connection instead.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.closed.is_some() {
            trace!("{} closed, dropping {} bytes", self.id, chunk.len());
            return Ok(());
        }

        self.counter.record_download(chunk.len() as u64);
        self.inbound.extend_from_slice(chunk);

        while let Some(frame) = self.codec.decode(&mut self.inbound)? {
            self.on_frame(frame)?;

            if self.closed.is_some() {
                break;
            }
        }

        Ok(())
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), Error> {
        match frame {
            Frame::Handshake { pstr_len, body } => {
                self.on_handshake(pstr_len, &body);
            }
            Frame::KeepAlive => {
                trace!("{} < keep_alive", self.id);
            }
            Frame::Message(payload) => self.on_message(payload)?,
            Frame::Oversized(len) => {
                warn!("{} ! message of {len} bytes is too large", self.id);
                self.close_with(CloseReason::MessageTooLarge);
            }
        }
        Ok(())
    }

    fn on_handshake(&mut self, pstr_len: u8, body: &[u8]) {
        let Some(handshake) = Handshake::from_parts(pstr_len, body) else {
            self.close_with(CloseReason::HandshakeMismatch);
            return;
        };

        let ours = Handshake::new(
            self.info_hash.clone(),
            self.local_id.clone(),
            Reserved::default(),
        );

        if !ours.validate(&handshake) {
            warn!(
                "{} ! handshake for {} while we are in {}",
                self.id, handshake.info_hash, self.info_hash
            );
            self.close_with(CloseReason::HandshakeMismatch);
            return;
        }

        let reserved = handshake.reserved();
        self.peer_has_extension = reserved.supports_extended();
        self.peer_has_dht = reserved.supports_dht();
        self.remote_id = Some(handshake.peer_id.clone());

        info!(
            "{} < handshake {:?} extension {} dht {}",
            self.id,
            handshake.peer_id,
            self.peer_has_extension,
            self.peer_has_dht
        );

        self.events.push_back(Event::Handshake {
            info_hash: handshake.info_hash,
            peer_id: handshake.peer_id,
        });
    }

    fn on_message(&mut self, payload: Bytes) -> Result<(), Error> {
        let msg = match Core::from_payload(payload) {
            Ok(msg) => msg,
            Err(PayloadError::UnknownId(id)) => {
                warn!("{} ! unknown message id {id}, ignoring", self.id);
                return Ok(());
            }
            Err(PayloadError::Truncated(id)) => {
                warn!("{} ! truncated {id:?} message", self.id);
                self.close_with(CloseReason::MalformedMessage);
                return Ok(());
            }
        };

        match msg {
            Core::KeepAlive => {
                trace!("{} < keep_alive", self.id);
            }
            Core::Choke => {
                debug!("{} < choke", self.id);
                self.choked = true;
                self.send(Core::Choke)?;
            }
            Core::Unchoke => {
                debug!("{} < unchoke", self.id);
                if self.choked {
                    self.choked = false;
                    self.send(Core::Unchoke)?;
                }
            }
            Core::Interested => {
                debug!("{} < interested", self.id);
                self.events.push_back(Event::Interested);
                if self.choked {
                    self.choked = false;
                    self.send(Core::Interested)?;
                    self.send(Core::Unchoke)?;
                }
            }
            Core::NotInterested => {
                debug!("{} < not_interested", self.id);
                self.close_with(CloseReason::NotInterested);
            }
            Core::Have(piece) => {
                debug!("{} < have {piece}", self.id);
                self.events.push_back(Event::Have(piece));
            }
            Core::Bitfield(bitfield) => {
                debug!("{} < bitfield len {}", self.id, bitfield.len());
                self.events.push_back(Event::Bitfield(bitfield));
            }
            Core::Request(block_info) => {
                if self.choked {
                    debug!("{} < request {block_info:?} while choked", self.id);
                    return Ok(());
                }
                debug!("{} < request {block_info:?}", self.id);
                self.pending_requests.push_back(block_info.clone());
                self.events.push_back(Event::Request(block_info));
            }
            Core::Piece(block) => self.on_piece(block)?,
            Core::Cancel(block_info) => {
                debug!("{} < cancel {block_info:?}", self.id);
                self.pending_requests.retain(|r| *r != block_info);
                self.events.push_back(Event::Cancel(block_info));
            }
            Core::Port(port) => {
                debug!("{} < port {port}", self.id);
            }
            Core::Extended(ExtendedMessage(ext_id, payload)) => {
                self.on_extended(ext_id, payload)?;
            }
        }

        Ok(())
    }

    fn on_piece(&mut self, block: Block) -> Result<(), Error> {
        trace!(
            "{} < piece {} begin {} len {}",
            self.id,
            block.index,
            block.begin,
            block.block.len()
        );

        let Some(assembly) = self.assembly.as_mut() else {
            warn!("{} ! piece {} but nothing in flight", self.id, block.index);
            return Ok(());
        };

        if let Assembled::Finished(piece) = assembly.add_block(block)? {
            debug!("{} finished piece {}", self.id, piece.index);
            self.assembly = None;
            self.busy = false;
            self.events.push_back(Event::FinishedPiece(piece));
        }

        Ok(())
    }

    fn on_extended(&mut self, ext_id: u8, payload: Bytes) -> Result<(), Error> {
        if !self.config.extension_protocol {
            trace!("{} < extended message {ext_id}, not advertised", self.id);
            return Ok(());
        }

        if ext_id == 0 {
            let ext = match Extension::from_bencode(&payload) {
                Ok(ext) => ext,
                Err(e) => {
                    warn!("{} ! invalid extension handshake: {e}", self.id);
                    return Ok(());
                }
            };

            debug!("{} < extension handshake {:?}", self.id, ext.m);
            self.extensions.on_handshake(&ext, &self.info_hash);
            return Ok(());
        }

        let Some((name, events)) = self.extensions.dispatch(ext_id, &payload)
        else {
            trace!("{} < extended message {ext_id} for no extension", self.id);
            return Ok(());
        };

        for event in events {
            self.on_ext_event(name, event)?;
        }

        Ok(())
    }

    fn on_ext_event(
        &mut self,
        name: &'static str,
        event: ExtEvent,
    ) -> Result<(), Error> {
        match event {
            ExtEvent::Next(piece) => {
                debug!("{} > metadata request {piece}", self.id);
                let request = Metadata::request(piece).to_bencode()?;
                self.send_extended(UT_METADATA, request)?;
            }
            ExtEvent::Reply(payload) => {
                self.send_extended(name, payload)?;
            }
            ExtEvent::Metadata(info) => {
                self.events.push_back(Event::Metadata(info));
            }
            ExtEvent::PexAdded(peers) => {
                self.events.push_back(Event::PexAdded(peers));
            }
            ExtEvent::PexAdded6(peers) => {
                self.events.push_back(Event::PexAdded6(peers));
            }
            ExtEvent::PexDropped(peers) => {
                self.events.push_back(Event::PexDropped(peers));
            }
            ExtEvent::PexDropped6(peers) => {
                self.events.push_back(Event::PexDropped6(peers));
            }
        }
        Ok(())
    }

    /// Queue a message to the remote.
    pub fn send(&mut self, msg: Core) -> Result<(), Error> {
        if self.closed.is_some() {
            trace!("{} not sending {msg:?} on a closed connection", self.id);
            return Ok(());
        }
        CoreCodec.encode(msg, &mut self.outbound)
    }

    pub fn send_keep_alive(&mut self) -> Result<(), Error> {
        trace!("{} > keep_alive", self.id);
        self.send(Core::KeepAlive)
    }

    /// Send our handshake, followed by our extension handshake when the
    /// extension protocol is enabled.
    pub fn send_handshake(&mut self) -> Result<(), Error> {
        if self.closed.is_some() {
            return Ok(());
        }

        info!("{} > handshake", self.id);

        let reserved = Reserved::supported(
            self.config.extension_protocol,
            self.config.dht,
        );
        let handshake = Handshake::new(
            self.info_hash.clone(),
            self.local_id.clone(),
            reserved,
        );

        self.outbound.extend_from_slice(&handshake.serialize()?);

        if self.config.extension_protocol {
            self.send_extension_handshake()?;
        }

        Ok(())
    }

    /// Send our extension handshake. The dict given with
    /// [`Connection::with_extension_handshake`] is only used once the remote
    /// is known to support the extension protocol.
    pub fn send_extension_handshake(&mut self) -> Result<(), Error> {
        let ours = Extension::supported(&self.config);

        let ext = match &self.extension_handshake {
            Some(given) if self.peer_has_extension => {
                given.clone().merge(&ours)
            }
            _ => ours,
        };

        debug!("{} > extension handshake {:?}", self.id, ext.m);

        self.extensions.set_local(ext.m);
        self.send(Core::try_from(&ext)?)
    }

    pub fn send_not_interested(&mut self) -> Result<(), Error> {
        debug!("{} > not_interested", self.id);
        self.interested = false;
        self.send(Core::NotInterested)
    }

    /// Declare interest in the remote. The choke state is not touched, see
    /// [`Connection::send_unchoke`].
    pub fn send_interested(&mut self) -> Result<(), Error> {
        debug!("{} > interested", self.id);
        self.interested = true;
        self.send(Core::Interested)
    }

    pub fn send_unchoke(&mut self) -> Result<(), Error> {
        debug!("{} > unchoke", self.id);
        self.choked = false;
        self.send(Core::Unchoke)
    }

    pub fn send_choke(&mut self) -> Result<(), Error> {
        debug!("{} > choke", self.id);
        self.choked = true;
        self.send(Core::Choke)
    }

    pub fn send_have(&mut self, piece: u32) -> Result<(), Error> {
        debug!("{} > have {piece}", self.id);
        self.send(Core::Have(piece))
    }

    pub fn send_bitfield(&mut self, bitfield: Bitfield) -> Result<(), Error> {
        debug!("{} > bitfield len {}", self.id, bitfield.len());
        self.send(Core::Bitfield(bitfield))
    }

    /// Send already framed request messages for the `block_count` blocks of
    /// one piece, and get ready to assemble it.
    ///
    /// # Errors
    ///
    /// If a piece is already in flight or `block_count` is zero.
    pub fn send_request(
        &mut self,
        payload: &[u8],
        block_count: usize,
    ) -> Result<(), Error> {
        self.start_piece(payload, block_count, None)
    }

    /// Request a whole piece, split in blocks of
    /// [`BLOCK_LEN`](crate::wire::BLOCK_LEN) bytes.
    pub fn request_piece(
        &mut self,
        index: u32,
        piece_len: u32,
    ) -> Result<(), Error> {
        let mut payload = BytesMut::new();
        let mut block_count = 0;

        for block_info in block_infos(index, piece_len) {
            CoreCodec.encode(Core::Request(block_info), &mut payload)?;
            block_count += 1;
        }

        self.start_piece(&payload, block_count, Some(index))
    }

    fn start_piece(
        &mut self,
        payload: &[u8],
        block_count: usize,
        index: Option<u32>,
    ) -> Result<(), Error> {
        if self.closed.is_some() {
            return Ok(());
        }

        if self.assembly.is_some() {
            return Err(Error::PieceInFlight);
        }

        let assembly = PieceAssembler::new(block_count, index)?;

        debug!("{} > request {block_count} blocks of {index:?}", self.id);

        self.assembly = Some(assembly);
        self.busy = true;
        self.outbound.extend_from_slice(payload);

        Ok(())
    }

    /// Drop the piece in flight, blocks that arrive later are ignored.
    pub fn cancel_piece(&mut self) -> bool {
        self.busy = false;
        self.assembly.take().is_some()
    }

    pub fn send_piece(&mut self, block: Block) -> Result<(), Error> {
        debug!(
            "{} > piece {} begin {} len {}",
            self.id,
            block.index,
            block.begin,
            block.block.len()
        );
        self.send(Core::Piece(block))
    }

    pub fn send_cancel(&mut self, block_info: BlockInfo) -> Result<(), Error> {
        debug!("{} > cancel {block_info:?}", self.id);
        self.send(Core::Cancel(block_info))
    }

    pub fn send_port(&mut self, port: u16) -> Result<(), Error> {
        debug!("{} > port {port}", self.id);
        self.send(Core::Port(port))
    }

    /// Send a message of the sub-protocol `name`, with the id that the
    /// remote advertised for it. Returns false, sending nothing, if the
    /// remote did not advertise it.
    pub fn send_extended(
        &mut self,
        name: &str,
        payload: impl Into<Bytes>,
    ) -> Result<bool, Error> {
        let Some(ext_id) = self.extensions.remote().get(name) else {
            debug!("{} remote does not support {name}", self.id);
            return Ok(false);
        };

        self.send(ExtendedMessage(ext_id, payload.into()).into())?;

        Ok(true)
    }

    /// Ask the remote for the first piece of the metadata, if it supports
    /// `ut_metadata`. The next pieces are requested as the data arrives.
    pub fn request_metadata(&mut self) -> Result<bool, Error> {
        if self.extensions.remote().ut_metadata.is_none() {
            return Ok(false);
        }

        self.send_extension_handshake()?;

        let request = Metadata::request(0).to_bencode()?;
        self.send_extended(UT_METADATA, request)
    }

    pub fn remove_metadata(&mut self) -> bool {
        self.extensions.remove(UT_METADATA)
    }

    pub fn remove_pex(&mut self) -> bool {
        self.extensions.remove(UT_PEX)
    }

    pub fn pending_requests(&self) -> &VecDeque<BlockInfo> {
        &self.pending_requests
    }

    /// The oldest request of the remote, if we are not choking it.
    pub fn next_request(&mut self) -> Option<BlockInfo> {
        if self.choked {
            return None;
        }
        self.pending_requests.pop_front()
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn is_interested(&self) -> bool {
        self.interested
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn set_busy(&mut self) {
        self.busy = true;
    }

    /// Clears the flag and drops the piece in flight with it.
    pub fn unset_busy(&mut self) {
        self.cancel_piece();
    }

    pub fn close(&mut self) {
        self.close_with(CloseReason::Local);
    }

    fn close_with(&mut self, reason: CloseReason) {
        if self.closed.is_some() {
            return;
        }

        info!("{} closing connection: {reason:?}", self.id);

        self.closed = Some(reason);
        self.codec.close();
        self.inbound.clear();
        self.assembly = None;
        self.busy = false;
        self.pending_requests.clear();
        self.events.push_back(Event::Close(reason));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    /// The bytes queued for the remote since the last call.
    pub fn take_outbound(&mut self) -> Bytes {
        let out = self.outbound.split().freeze();
        if !out.is_empty() {
            self.counter.record_upload(out.len() as u64);
        }
        out
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Take every pending event, oldest first.
    pub fn events(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain(..)
    }

    pub fn info_hash(&self) -> &InfoHash {
        &self.info_hash
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn remote_id(&self) -> Option<&PeerId> {
        self.remote_id.as_ref()
    }

    pub fn peer_has_extension(&self) -> bool {
        self.peer_has_extension
    }

    pub fn peer_has_dht(&self) -> bool {
        self.peer_has_dht
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn counter(&self) -> Arc<Counter> {
        self.counter.clone()
    }
}
