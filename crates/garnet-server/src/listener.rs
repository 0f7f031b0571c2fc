//! TCP accept loop and per-connection handling.
//!
//! Each connection gets its own task: bytes are fed into an incremental
//! frame parser, complete commands run through the dispatcher, and the
//! batched replies go back in one write (pipelining). A connection that
//! sends SYNC/PSYNC is promoted to a replica: it receives a full
//! snapshot as one RESP bulk and then the live write stream.

use std::sync::Arc;

use bytes::BytesMut;
use garnet_persistence::rdb;
use garnet_protocol::{Frame, FrameParser};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::dispatcher::{Dispatcher, Outcome};

/// Initial reply buffer capacity; covers simple command traffic
/// without reallocation.
const BUF_CAPACITY: usize = 4096;

/// Read chunk size per syscall.
const READ_CHUNK: usize = 16 * 1024;

/// Cap on unparsed buffered bytes before the connection is dropped.
/// Prevents a client trickling an enormous frame from pinning memory.
const MAX_BUF_SIZE: usize = 64 * 1024 * 1024;

/// Runs the accept loop forever.
pub async fn run(listener: TcpListener, dispatcher: Arc<Dispatcher>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    debug!(%peer, "client connected");
                    if let Err(e) = handle(stream, dispatcher).await {
                        debug!(%peer, "connection closed: {e}");
                    }
                });
            }
            Err(e) => {
                error!("accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

/// Drives one client connection to completion.
async fn handle(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) -> std::io::Result<()> {
    let mut parser = FrameParser::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut out = BytesMut::with_capacity(BUF_CAPACITY);

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(()); // clean disconnect
        }
        parser.append(&chunk[..n]);

        if parser.buffered() > MAX_BUF_SIZE {
            let mut err = BytesMut::new();
            Frame::Error("ERR max buffer size exceeded".into()).serialize(&mut err);
            let _ = stream.write_all(&err).await;
            return Ok(());
        }

        // drain every complete frame the buffer holds (pipelining)
        out.clear();
        loop {
            match parser.try_parse_with_raw() {
                Ok(Some((frame, raw))) => match dispatcher.dispatch(frame, raw) {
                    Outcome::Reply(reply) => reply.serialize(&mut out),
                    Outcome::StartReplicaStream => {
                        if !out.is_empty() {
                            stream.write_all(&out).await?;
                        }
                        return serve_replica(stream, dispatcher).await;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    // protocol violation: reply and hang up, the stream
                    // is no longer frame-aligned
                    let mut err = BytesMut::new();
                    Frame::Error(format!("ERR protocol error: {e}")).serialize(&mut err);
                    let _ = stream.write_all(&err).await;
                    return Ok(());
                }
            }
        }

        if !out.is_empty() {
            stream.write_all(&out).await?;
        }
    }
}

/// Full resync + live stream for a connection that sent SYNC/PSYNC.
///
/// The stream subscription is taken before the snapshot so no write
/// committed in between can be missed.
async fn serve_replica(mut stream: TcpStream, dispatcher: Arc<Dispatcher>) -> std::io::Result<()> {
    let mut rx = dispatcher.hub.subscribe();

    let snapshot = rdb::encode(&dispatcher.engine);
    let mut out = BytesMut::with_capacity(snapshot.len() + 32);
    Frame::bulk(snapshot).serialize(&mut out);
    stream.write_all(&out).await?;
    info!("full resync sent, streaming writes");

    loop {
        match rx.recv().await {
            Ok(ev) => {
                stream.write_all(&ev.raw).await?;
                stream
                    .write_all(format!("+OFFSET {}\r\n", ev.offset).as_bytes())
                    .await?;
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "replica lagged, forcing resync");
                return Ok(());
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}
