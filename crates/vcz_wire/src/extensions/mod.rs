//! Extension protocol, BEP 10.
//!
//! <http://www.bittorrent.org/beps/bep_0010.html>
//!
//! Extended messages carry an `<ext_id>` byte after the core id 20. The id 0
//! is the extension handshake, a bencoded dict whose `m` key maps the name of
//! every supported sub-protocol to the id that the sender wants to receive
//! it on. Ids are chosen by each side independently: we send a message with
//! the id the remote advertised, and the remote sends it with ours.

pub mod metadata;
pub mod pex;

use std::fmt::Debug;

use bendy::{
    decoding::{FromBencode, Object, ResultExt},
    encoding::{AsString, ToBencode},
};
use bytes::Bytes;
use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::{
    config::Config,
    error::Error,
    types::InfoHash,
    wire::{Core, ExtendedMessage},
};

use self::{metadata::MetadataExchange, pex::PeerExchange, pex::PexPeer};

pub const UT_METADATA: &str = "ut_metadata";
pub const UT_PEX: &str = "ut_pex";

/// Ids of the extensions that we advertise when no other dict is given.
pub const LOCAL_UT_PEX: u8 = 1;
pub const LOCAL_UT_METADATA: u8 = 2;

/// The payload of the extension handshake.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extension {
    /// messages (supported extensions)
    pub m: M,
    /// local TCP listen port
    pub p: Option<u16>,
    /// a string identifying the client and the version
    pub v: Option<String>,
    /// number of outstanding requests messages this client supports
    /// without dropping any.
    pub reqq: Option<u16>,
    /// added by BEP 9, the size of the info dictionary.
    pub metadata_size: Option<u32>,
    /// compact address of the receiver, as seen by the sender.
    pub yourip: Option<Vec<u8>>,
    pub ipv4: Option<Vec<u8>>,
    pub ipv6: Option<Vec<u8>>,
}

/// The `m` dict of the extension handshake. `None` means the extension is
/// not supported by whoever sent the dict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct M {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
}

impl M {
    pub fn get(&self, name: &str) -> Option<u8> {
        match name {
            UT_METADATA => self.ut_metadata,
            UT_PEX => self.ut_pex,
            _ => None,
        }
    }

    fn slot(&mut self, name: &str) -> Option<&mut Option<u8>> {
        match name {
            UT_METADATA => Some(&mut self.ut_metadata),
            UT_PEX => Some(&mut self.ut_pex),
            _ => None,
        }
    }
}

impl Extension {
    /// The dict advertised by a connection that was not given one.
    pub fn supported(config: &Config) -> Self {
        Self {
            m: M {
                ut_metadata: Some(LOCAL_UT_METADATA),
                ut_pex: Some(LOCAL_UT_PEX),
            },
            reqq: config.reqq,
            v: config.client_version.clone(),
            ..Default::default()
        }
    }

    /// Fill the fields missing in `self` with the ones of `base`.
    pub fn merge(mut self, base: &Extension) -> Self {
        if self.m == M::default() {
            self.m = base.m;
        }
        self.p = self.p.or(base.p);
        self.v = self.v.or_else(|| base.v.clone());
        self.reqq = self.reqq.or(base.reqq);
        self.metadata_size = self.metadata_size.or(base.metadata_size);
        self.yourip = self.yourip.or_else(|| base.yourip.clone());
        self.ipv4 = self.ipv4.or_else(|| base.ipv4.clone());
        self.ipv6 = self.ipv6.or_else(|| base.ipv6.clone());
        self
    }
}

impl TryFrom<&Extension> for Core {
    type Error = Error;

    fn try_from(value: &Extension) -> Result<Self, Self::Error> {
        let payload = value.to_bencode()?;
        Ok(ExtendedMessage(0, Bytes::from(payload)).into())
    }
}

impl ToBencode for M {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(ut_metadata) = self.ut_metadata {
                e.emit_pair(b"ut_metadata", ut_metadata)?;
            }
            if let Some(ut_pex) = self.ut_pex {
                e.emit_pair(b"ut_pex", ut_pex)?;
            }
            Ok(())
        })
    }
}

impl FromBencode for M {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut ut_metadata = None;
        let mut ut_pex = None;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"ut_metadata", value) => {
                    ut_metadata = u8::decode_bencode_object(value)
                        .context("ut_metadata")
                        .map(Some)?;
                }
                (b"ut_pex", value) => {
                    ut_pex = u8::decode_bencode_object(value)
                        .context("ut_pex")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        Ok(Self { ut_metadata, ut_pex })
    }
}

impl ToBencode for Extension {
    const MAX_DEPTH: usize = 20;

    fn encode(
        &self,
        encoder: bendy::encoding::SingleItemEncoder,
    ) -> Result<(), bendy::encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(ipv4) = &self.ipv4 {
                e.emit_pair(b"ipv4", AsString(ipv4))?;
            }
            if let Some(ipv6) = &self.ipv6 {
                e.emit_pair(b"ipv6", AsString(ipv6))?;
            }
            e.emit_pair(b"m", self.m)?;
            if let Some(metadata_size) = self.metadata_size {
                e.emit_pair(b"metadata_size", metadata_size)?;
            }
            if let Some(p) = self.p {
                e.emit_pair(b"p", p)?;
            }
            if let Some(reqq) = self.reqq {
                e.emit_pair(b"reqq", reqq)?;
            }
            if let Some(v) = &self.v {
                e.emit_pair(b"v", v)?;
            }
            if let Some(yourip) = &self.yourip {
                e.emit_pair(b"yourip", AsString(yourip))?;
            }
            Ok(())
        })
    }
}

impl FromBencode for Extension {
    fn decode_bencode_object(
        object: Object,
    ) -> Result<Self, bendy::decoding::Error>
    where
        Self: Sized,
    {
        let mut dict = object.try_into_dictionary()?;
        let mut ext = Extension::default();

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"m", value) => {
                    ext.m = M::decode_bencode_object(value).context("m")?;
                }
                (b"metadata_size", value) => {
                    ext.metadata_size = u32::decode_bencode_object(value)
                        .context("metadata_size")
                        .map(Some)?;
                }
                (b"p", value) => {
                    ext.p = u16::decode_bencode_object(value)
                        .context("p")
                        .map(Some)?;
                }
                (b"reqq", value) => {
                    ext.reqq = u16::decode_bencode_object(value)
                        .context("reqq")
                        .map(Some)?;
                }
                // some clients send raw bytes here
                (b"v", value) => {
                    let v: AsString<Vec<u8>> =
                        AsString::decode_bencode_object(value).context("v")?;
                    ext.v = Some(String::from_utf8_lossy(&v.0).into_owned());
                }
                (b"yourip", value) => {
                    ext.yourip = AsString::decode_bencode_object(value)
                        .context("yourip")
                        .map(|s| Some(s.0))?;
                }
                (b"ipv4", value) => {
                    ext.ipv4 = AsString::decode_bencode_object(value)
                        .context("ipv4")
                        .map(|s| Some(s.0))?;
                }
                (b"ipv6", value) => {
                    ext.ipv6 = AsString::decode_bencode_object(value)
                        .context("ipv6")
                        .map(|s| Some(s.0))?;
                }
                _ => {}
            }
        }

        Ok(ext)
    }
}

/// What a sub-protocol wants the connection to do after a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtEvent {
    /// Request the metadata piece with this index from the remote.
    Next(u32),
    /// Send this payload to the remote, under the id it advertised for the
    /// sub-protocol that produced it.
    Reply(Bytes),
    /// The whole info dictionary, already checked against the info hash.
    Metadata(Bytes),
    PexAdded(Vec<PexPeer>),
    PexAdded6(Vec<PexPeer>),
    PexDropped(Vec<std::net::SocketAddr>),
    PexDropped6(Vec<std::net::SocketAddr>),
}

/// A sub-protocol of the extension protocol, receives the payloads that the
/// remote sent on the id that we advertised for it.
pub trait ExtensionHandler: Debug + Send {
    /// The key of the sub-protocol in the `m` dict.
    fn name(&self) -> &'static str;

    fn on_message(&mut self, payload: &[u8]) -> Result<Vec<ExtEvent>, Error>;
}

/// Negotiated ids and the sub-protocol handles of a connection.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    /// ids that we advertised, inbound messages arrive on these.
    local: M,
    /// ids that the remote advertised, outbound messages go on these.
    remote: M,
    /// keyed by the local id.
    handles: HashMap<u8, Box<dyn ExtensionHandler>>,
    handshakes: usize,
}

impl ExtensionRegistry {
    pub fn new(local: M) -> Self {
        Self { local, ..Default::default() }
    }

    pub fn local(&self) -> M {
        self.local
    }

    /// The ids advertised by the remote, that is, the negotiated ids.
    pub fn remote(&self) -> M {
        self.remote
    }

    /// If the extension handshake of the remote was processed at least once.
    pub fn is_negotiated(&self) -> bool {
        self.handshakes > 0
    }

    /// Change the ids that we advertise, moving the existing handles to
    /// their new ids.
    pub fn set_local(&mut self, local: M) {
        if self.local == local {
            return;
        }

        let handles: Vec<_> = self.handles.drain().map(|(_, h)| h).collect();
        self.local = local;

        for handle in handles {
            match local.get(handle.name()) {
                Some(id) => {
                    self.handles.insert(id, handle);
                }
                None => debug!("no longer advertising {}", handle.name()),
            }
        }
    }

    /// Process the extension handshake of the remote. Handles are created
    /// once, a repeated handshake only updates the negotiated ids.
    pub fn on_handshake(&mut self, ext: &Extension, info_hash: &InfoHash) {
        self.handshakes += 1;

        for name in [UT_METADATA, UT_PEX] {
            let id = ext.m.get(name);

            if let Some(slot) = self.remote.slot(name) {
                match id {
                    // an id of 0 disables the extension
                    Some(0) => *slot = None,
                    Some(id) => *slot = Some(id),
                    None => {}
                }
            }

            let Some(local_id) = self.local.get(name) else {
                continue;
            };

            if matches!(id, Some(0)) {
                self.handles.remove(&local_id);
                continue;
            }

            if id.is_none() || self.handles.contains_key(&local_id) {
                continue;
            }

            let handle: Box<dyn ExtensionHandler> = match name {
                UT_METADATA => Box::new(MetadataExchange::new(
                    ext.metadata_size.unwrap_or(0),
                    info_hash.clone(),
                )),
                _ => Box::new(PeerExchange::new()),
            };

            debug!("{name} negotiated, local id {local_id} remote id {id:?}");
            self.handles.insert(local_id, handle);
        }
    }

    /// Route the payload of an extended message with a non zero id. Unknown
    /// ids give `None`.
    pub fn dispatch(
        &mut self,
        id: u8,
        payload: &[u8],
    ) -> Option<(&'static str, Vec<ExtEvent>)> {
        let handle = self.handles.get_mut(&id)?;
        let name = handle.name();

        match handle.on_message(payload) {
            Ok(events) => Some((name, events)),
            Err(e) => {
                warn!("! invalid {name} payload: {e}");
                Some((name, Vec::new()))
            }
        }
    }

    /// Drop the handle of a sub-protocol, later payloads on its id are
    /// dropped.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(local_id) = self.local.get(name) else {
            return false;
        };
        self.handles.remove(&local_id).is_some()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.local
            .get(name)
            .is_some_and(|id| self.handles.contains_key(&id))
    }

    /// Names of the sub-protocols with a handle, with their local id.
    pub fn handlers(&self) -> impl Iterator<Item = (u8, &'static str)> + '_ {
        self.handles.iter().map(|(id, h)| (*id, h.name()))
    }
}
