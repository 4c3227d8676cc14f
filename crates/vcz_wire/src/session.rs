//! Drives a [`Connection`] over a tokio stream.
//!
//! The connection itself is a plain state machine, this is the thin layer
//! that moves bytes between it and a socket (or anything that is
//! `AsyncRead + AsyncWrite`), sends keep-alives and updates the rate meters.

use std::time::Duration;

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
    time::{interval_at, Instant, Interval, MissedTickBehavior},
};
use tracing::debug;

use crate::{
    connection::{Connection, Event},
    error::Error,
};

/// How often the rate meters are updated.
const RATE_INTERVAL: Duration = Duration::from_secs(1);

/// Size of the buffer of a single read.
const READ_BUF_LEN: usize = 16 * 1024;

pub struct Session<S> {
    conn: Connection,
    stream: S,
    buf: BytesMut,
    keep_alive: Interval,
    rate: Interval,
}

fn interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Must be called within a tokio runtime.
    pub fn new(stream: S, conn: Connection) -> Self {
        let keep_alive = interval(conn.config().keep_alive_interval());

        Self {
            conn,
            stream,
            buf: BytesMut::with_capacity(READ_BUF_LEN),
            keep_alive,
            rate: interval(RATE_INTERVAL),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_inner(self) -> (S, Connection) {
        (self.stream, self.conn)
    }

    /// Send our handshake and write it out.
    pub async fn handshake(&mut self) -> Result<(), Error> {
        self.conn.send_handshake()?;
        self.flush().await
    }

    /// Write every byte that the connection queued.
    pub async fn flush(&mut self) -> Result<(), Error> {
        if !self.conn.has_outbound() {
            return Ok(());
        }

        let out = self.conn.take_outbound();
        self.stream.write_all(&out).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// The next event of the connection, reading from the stream until
    /// there is one. `None` when the stream reached EOF or the connection is
    /// closed and its events were all taken.
    pub async fn next_event(&mut self) -> Result<Option<Event>, Error> {
        loop {
            self.flush().await?;

            if let Some(event) = self.conn.next_event() {
                return Ok(Some(event));
            }

            if self.conn.is_closed() {
                return Ok(None);
            }

            select! {
                n = self.stream.read_buf(&mut self.buf) => {
                    if n? == 0 {
                        debug!("stream reached EOF");
                        return Ok(None);
                    }
                    self.conn.feed(&self.buf)?;
                    self.buf.clear();
                }
                _ = self.keep_alive.tick() => {
                    self.conn.send_keep_alive()?;
                }
                _ = self.rate.tick() => {
                    self.conn.counter().update_rates().await;
                }
            }
        }
    }

    /// Forward every event to `tx` until the stream or the connection is
    /// closed.
    pub async fn run(mut self, tx: mpsc::Sender<Event>) -> Result<(), Error> {
        while let Some(event) = self.next_event().await? {
            tx.send(event).await?;
        }
        Ok(())
    }
}
