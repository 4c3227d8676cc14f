mod common;
use common::*;

use bendy::encoding::ToBencode;
use bytes::Bytes;
use sha1_smol::Sha1;
use vcz_wire::{
    config::Config,
    connection::{Connection, Event},
    error::Error,
    extensions::{
        metadata::{Metadata, METADATA_PIECE_LEN},
        pex::{PexFlags, PexMessage, PexPeer},
        Extension, M, UT_METADATA, UT_PEX,
    },
    types::{InfoHash, PeerId},
    wire::{Core, ExtendedMessage},
};

fn handlers(conn: &Connection) -> Vec<(u8, &'static str)> {
    let mut handlers: Vec<_> = conn.extensions().handlers().collect();
    handlers.sort();
    handlers
}

fn pex_message() -> PexMessage {
    let mut msg = PexMessage::default();
    msg.add(PexPeer {
        addr: "10.0.0.1:6881".parse().expect("addr"),
        flags: PexFlags { seed: true, ..Default::default() },
    });
    msg.add(PexPeer::new("[2001:db8::1]:51413".parse().expect("addr")));
    msg.drop_addr("192.168.1.5:80".parse().expect("addr"));
    msg
}

#[test]
fn negotiation() -> Result<(), Error> {
    setup_tracing();

    let (a, b) = handshaked_pair()?;

    for conn in [&a, &b] {
        let ext = conn.extensions();
        assert!(ext.is_negotiated());
        assert_eq!(ext.remote(), M { ut_metadata: Some(2), ut_pex: Some(1) });
        assert_eq!(ext.local(), ext.remote());
        assert_eq!(handlers(conn), vec![(1, UT_PEX), (2, UT_METADATA)]);
    }

    Ok(())
}

#[test]
fn repeated_handshake_keeps_the_handles() -> Result<(), Error> {
    let (mut a, mut b) = handshaked_pair()?;

    // the handshake in between does not disturb pex
    a.send_extended(UT_PEX, pex_message().to_bencode()?)?;
    a.send_extension_handshake()?;
    a.send_extended(UT_PEX, pex_message().to_bencode()?)?;
    pipe(&mut a, &mut b)?;

    let events = drain(&mut b);
    assert_eq!(events.len(), 6);
    assert_eq!(events[..3], events[3..]);
    assert_eq!(handlers(&b), vec![(1, UT_PEX), (2, UT_METADATA)]);

    Ok(())
}

#[test]
fn ids_of_a_custom_handshake() -> Result<(), Error> {
    let custom = Extension {
        m: M { ut_metadata: Some(32), ut_pex: Some(7) },
        ..Default::default()
    };

    let mut a = connection();
    let mut b = connection().with_extension_handshake(custom);

    // b only advertises its dict once it knows a speaks the protocol
    a.send_handshake()?;
    pipe(&mut a, &mut b)?;
    b.send_handshake()?;
    pipe(&mut b, &mut a)?;
    drain(&mut a);
    drain(&mut b);

    assert_eq!(
        a.extensions().remote(),
        M { ut_metadata: Some(32), ut_pex: Some(7) }
    );
    assert_eq!(handlers(&a), vec![(1, UT_PEX), (2, UT_METADATA)]);

    // b handles inbound messages on the ids it advertised
    assert_eq!(b.extensions().local().ut_pex, Some(7));
    assert_eq!(handlers(&b), vec![(7, UT_PEX), (32, UT_METADATA)]);

    let msg = pex_message();
    assert!(a.send_extended(UT_PEX, msg.to_bencode()?)?);
    let out = a.take_outbound();
    // <len><20><ext_id>
    assert_eq!(out[5], 7);
    b.feed(&out)?;

    assert_eq!(
        drain(&mut b),
        vec![
            Event::PexAdded(msg.added.clone()),
            Event::PexAdded6(msg.added6.clone()),
            Event::PexDropped(msg.dropped.clone()),
        ]
    );

    // and the other way around, on the ids of a
    assert!(b.send_extended(UT_PEX, msg.to_bencode()?)?);
    let out = b.take_outbound();
    assert_eq!(out[5], 1);
    a.feed(&out)?;
    assert_eq!(drain(&mut a).len(), 3);

    Ok(())
}

#[test]
fn disabled_extensions() -> Result<(), Error> {
    let mut a = connection();
    let mut b = connection();

    a.send_handshake()?;
    pipe(&mut a, &mut b)?;
    drain(&mut b);

    // an id of 0 turns the extension off
    let ext = Extension {
        m: M { ut_metadata: Some(0), ut_pex: Some(1) },
        ..Default::default()
    };
    a.send(Core::try_from(&ext)?)?;
    pipe(&mut a, &mut b)?;

    assert_eq!(b.extensions().remote().ut_metadata, None);
    assert!(!b.extensions().has_handler(UT_METADATA));
    assert!(b.extensions().has_handler(UT_PEX));
    assert!(!b.request_metadata()?);

    assert!(b.remove_pex());
    assert!(!b.remove_pex());

    let pex = Bytes::from(pex_message().to_bencode()?);
    a.send(ExtendedMessage(1, pex).into())?;
    pipe(&mut a, &mut b)?;
    assert!(drain(&mut b).is_empty());

    Ok(())
}

#[test]
fn unknown_and_invalid_extended_messages() -> Result<(), Error> {
    let (mut a, mut b) = handshaked_pair()?;

    // no extension was negotiated on 99
    a.send(ExtendedMessage(99, Bytes::from_static(b"d1:xi1ee")).into())?;
    // not bencode
    a.send(ExtendedMessage(1, Bytes::from_static(b"garbage")).into())?;
    a.send(ExtendedMessage(0, Bytes::from_static(b"garbage")).into())?;
    a.send_have(4)?;
    pipe(&mut a, &mut b)?;

    assert_eq!(drain(&mut b), vec![Event::Have(4)]);
    assert!(!b.is_closed());
    assert!(b.extensions().has_handler(UT_PEX));

    Ok(())
}

#[test]
fn not_advertised_without_extension_protocol() -> Result<(), Error> {
    let mut a = connection();
    let mut b = connection_with(Config {
        extension_protocol: false,
        ..Default::default()
    });

    a.send_handshake()?;
    pipe(&mut a, &mut b)?;
    b.send_handshake()?;
    pipe(&mut b, &mut a)?;

    assert!(!b.extensions().is_negotiated());
    assert!(!a.peer_has_extension());
    assert!(!a.extensions().is_negotiated());
    assert!(!a.send_extended(UT_PEX, Bytes::new())?);
    assert!(!a.request_metadata()?);

    Ok(())
}

/// A connection in a swarm whose info dict is `info`.
fn metadata_pair(info: &[u8]) -> Result<(Connection, Connection), Error> {
    let info_hash = InfoHash(Sha1::from(info).digest().bytes());
    let conn = || {
        let peer_id = PeerId::generate();
        Connection::new(info_hash.clone(), peer_id, Config::default())
    };
    handshaked_pair_with(conn(), conn())
}

#[test]
fn metadata_download() -> Result<(), Error> {
    let len = METADATA_PIECE_LEN as usize + 1000;
    let info: Vec<u8> = (0..len).map(|i| (i % 7) as u8).collect();
    let (mut a, mut b) = metadata_pair(&info)?;

    assert!(a.request_metadata()?);
    pipe(&mut a, &mut b)?;
    // b does not serve metadata, its reject is ignored by a
    pump(&mut a, &mut b)?;
    assert!(drain(&mut a).is_empty());
    assert!(drain(&mut b).is_empty());

    let mut pieces = info.chunks(METADATA_PIECE_LEN as usize);

    let first = pieces.next().expect("first piece");
    let data = Metadata::data(0, len as u32, first)?;
    assert!(b.send_extended(UT_METADATA, data)?);
    pipe(&mut b, &mut a)?;

    // a asks for the next piece on its own
    assert!(drain(&mut a).is_empty());
    let out = a.take_outbound();
    let request = Metadata::request(1).to_bencode()?;
    assert_eq!(&out[6..], &request[..]);

    let second = pieces.next().expect("second piece");
    let data = Metadata::data(1, len as u32, second)?;
    b.send_extended(UT_METADATA, data)?;
    pipe(&mut b, &mut a)?;

    assert_eq!(drain(&mut a), vec![Event::Metadata(Bytes::from(info))]);

    Ok(())
}

#[test]
fn metadata_with_another_hash() -> Result<(), Error> {
    let info = b"d6:lengthi1e4:name1:ae".to_vec();
    let (mut a, mut b) = metadata_pair(b"not the same info")?;

    let data = Metadata::data(0, info.len() as u32, &info)?;
    b.send_extended(UT_METADATA, data)?;
    pipe(&mut b, &mut a)?;

    // the download starts over from the first piece
    assert!(drain(&mut a).is_empty());
    let out = a.take_outbound();
    let request = Metadata::request(0).to_bencode()?;
    assert_eq!(&out[6..], &request[..]);

    assert!(a.remove_metadata());
    let data = Metadata::data(0, info.len() as u32, &info)?;
    b.send_extended(UT_METADATA, data)?;
    pipe(&mut b, &mut a)?;
    assert!(!a.has_outbound());

    Ok(())
}

#[test]
fn metadata_size_too_large() -> Result<(), Error> {
    let info = b"d6:lengthi1e4:name1:ae".to_vec();
    let info_hash = InfoHash(Sha1::from(&info).digest().bytes());
    let conn = || {
        let peer_id = PeerId::generate();
        Connection::new(info_hash.clone(), peer_id, Config::default())
    };
    let (mut a, mut b) = (conn(), conn());

    a.send_handshake()?;
    pipe(&mut a, &mut b)?;
    drain(&mut b);

    let ext = Extension {
        m: M { ut_metadata: Some(2), ut_pex: Some(1) },
        metadata_size: Some(u32::MAX),
        ..Default::default()
    };
    a.send(Core::try_from(&ext)?)?;
    pipe(&mut a, &mut b)?;

    // the size is unknown, the download goes on with total_size
    assert!(b.extensions().has_handler(UT_METADATA));
    assert!(b.request_metadata()?);
    b.take_outbound();

    let data = Metadata::data(0, info.len() as u32, &info)?;
    a.send(ExtendedMessage(2, Bytes::from(data)).into())?;
    pipe(&mut a, &mut b)?;

    assert_eq!(drain(&mut b), vec![Event::Metadata(Bytes::from(info))]);

    Ok(())
}
