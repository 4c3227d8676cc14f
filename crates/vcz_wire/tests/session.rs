mod common;
use common::*;

use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    spawn,
    sync::mpsc,
};
use vcz_wire::{
    connection::Event,
    error::Error,
    session::Session,
    wire::{Block, BLOCK_LEN},
};

// A seeder and a leecher talking over a real socket: the leecher declares
// interest, the seeder unchokes it in return and serves the blocks of one
// piece.
#[tokio::test]
async fn download_a_piece_over_tcp() -> Result<(), Error> {
    setup_tracing();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let piece: Vec<u8> = (0..2 * BLOCK_LEN).map(|i| (i % 13) as u8).collect();
    let served = piece.clone();

    let seeder = spawn(async move {
        let (socket, _) = listener.accept().await?;
        let mut session = Session::new(socket, connection());
        session.handshake().await?;

        while let Some(event) = session.next_event().await? {
            let conn = session.connection_mut();
            match event {
                Event::Request(_) => {
                    while let Some(r) = conn.next_request() {
                        let begin = r.begin as usize;
                        let end = begin + r.len as usize;
                        conn.send_piece(Block {
                            index: r.index,
                            begin: r.begin,
                            block: Bytes::copy_from_slice(&served[begin..end]),
                        })?;
                    }
                }
                Event::Close(_) => break,
                _ => {}
            }
        }

        Ok::<_, Error>(())
    });

    let socket = TcpStream::connect(addr).await?;
    let mut session = Session::new(socket, connection());
    session.handshake().await?;

    let mut finished = None;

    while let Some(event) = session.next_event().await? {
        let conn = session.connection_mut();
        match event {
            Event::Handshake { .. } => conn.send_interested()?,
            // the seeder answered our interest and is not choking us
            Event::Interested => conn.request_piece(0, 2 * BLOCK_LEN)?,
            Event::FinishedPiece(piece) => {
                finished = Some(piece);
                conn.close();
            }
            _ => {}
        }
    }

    let finished = finished.expect("a finished piece");
    assert_eq!(finished.index, 0);
    assert_eq!(&finished.data[..], &piece[..]);

    // closing drops the socket, the seeder sees EOF
    drop(session);
    seeder.await.expect("seeder task")?;

    Ok(())
}

#[tokio::test]
async fn events_through_a_channel() -> Result<(), Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let (tx, mut rx) = mpsc::channel(16);

    let remote = spawn(async move {
        let (socket, _) = listener.accept().await?;
        Session::new(socket, connection()).run(tx).await
    });

    let socket = TcpStream::connect(addr).await?;
    let mut session = Session::new(socket, connection());
    session.handshake().await?;
    session.connection_mut().send_have(17947)?;
    session.connection_mut().send_not_interested()?;
    session.flush().await?;

    assert!(matches!(rx.recv().await, Some(Event::Handshake { .. })));
    assert_eq!(rx.recv().await, Some(Event::Have(17947)));
    assert!(matches!(rx.recv().await, Some(Event::Close(_))));
    assert_eq!(rx.recv().await, None);

    remote.await.expect("remote task")?;

    Ok(())
}
