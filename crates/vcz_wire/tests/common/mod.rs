//! Helpers shared by the integration tests.
//!
//! Two [`Connection`]s are wired to each other by moving the bytes that one
//! queued into the other, which is what a socket would do in production.

#![allow(dead_code)]

use tracing::Level;
use vcz_wire::{
    config::Config,
    connection::{Connection, Event},
    error::Error,
    types::{InfoHash, PeerId},
};

pub const INFO_HASH: &str = "e940a7a57294e4c98f62514b32611e38181b6cae";
pub const PEER_ID: &str = "-EM0022-PEANUTS4AITH";

/// Rounds of [`pump`] before giving up on a conversation that never ends.
const MAX_ROUNDS: usize = 16;

pub fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_target(false)
        .with_test_writer()
        .compact()
        .try_init();
}

pub fn info_hash() -> InfoHash {
    InfoHash::from_hex(INFO_HASH).expect("valid hex")
}

pub fn connection() -> Connection {
    Connection::new(info_hash(), PeerId::generate(), Config::default())
}

pub fn connection_with(config: Config) -> Connection {
    Connection::new(info_hash(), PeerId::generate(), config)
}

/// Move the bytes queued by `from` into `to`.
pub fn pipe(from: &mut Connection, to: &mut Connection) -> Result<(), Error> {
    let out = from.take_outbound();
    to.feed(&out)
}

/// Pipe both ways until neither side has something to say.
pub fn pump(a: &mut Connection, b: &mut Connection) -> Result<(), Error> {
    for _ in 0..MAX_ROUNDS {
        if !a.has_outbound() && !b.has_outbound() {
            return Ok(());
        }
        pipe(a, b)?;
        pipe(b, a)?;
    }
    panic!("the connections never stopped talking");
}

pub fn drain(conn: &mut Connection) -> Vec<Event> {
    conn.events().collect()
}

/// Two connections of the same swarm after the handshakes, with no pending
/// events.
pub fn handshaked_pair() -> Result<(Connection, Connection), Error> {
    handshaked_pair_with(connection(), connection())
}

pub fn handshaked_pair_with(
    mut a: Connection,
    mut b: Connection,
) -> Result<(Connection, Connection), Error> {
    a.send_handshake()?;
    pipe(&mut a, &mut b)?;
    b.send_handshake()?;
    pump(&mut a, &mut b)?;

    assert!(matches!(drain(&mut a)[..], [Event::Handshake { .. }]));
    assert!(matches!(drain(&mut b)[..], [Event::Handshake { .. }]));

    Ok((a, b))
}
