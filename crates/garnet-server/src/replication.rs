//! Replication: master-side fan-out and the replica client.
//!
//! # Wire protocol
//!
//! A replica connects to the master's normal port and sends `SYNC` (or
//! `PSYNC <offset>` once it has seen an offset). The master answers
//! with a full resync either way:
//!
//! ```text
//! $<len>\r\n<rdb-bytes>\r\n          one bulk holding a full snapshot
//! *...                               write commands, in commit order
//! +OFFSET <n>\r\n                    after each command, the new offset
//! ```
//!
//! The master side is a broadcast channel: the dispatcher publishes the
//! raw bytes of every committed write, each replica connection relays
//! them. Subscribing happens before the snapshot is taken so nothing
//! committed in between is lost; a command can appear in both the
//! snapshot and the stream, which is harmless since all streamed
//! commands are idempotent. A replica that lags far enough to lose
//! broadcast slots is disconnected and performs a fresh full resync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use garnet_core::Engine;
use garnet_persistence::rdb;
use garnet_protocol::{Frame, FrameParser};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ReplicaSection;

/// Broadcast capacity. A replica further behind than this many write
/// commands is forced into a resync.
const STREAM_CAPACITY: usize = 16384;

/// One committed write command heading to the replicas.
#[derive(Debug, Clone)]
pub struct ReplEvent {
    pub raw: Bytes,
    pub offset: u64,
}

/// Master-side replication state: the stream of committed writes and
/// the replication offset.
pub struct ReplicationHub {
    tx: tokio::sync::broadcast::Sender<ReplEvent>,
    offset: AtomicU64,
}

impl ReplicationHub {
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(STREAM_CAPACITY);
        Self {
            tx,
            offset: AtomicU64::new(0),
        }
    }

    /// Publishes one committed write command, advancing the master
    /// offset. Send errors (no replica connected) are expected.
    pub fn publish(&self, raw: Bytes) {
        let offset = self.offset.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.tx.send(ReplEvent { raw, offset });
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ReplEvent> {
        self.tx.subscribe()
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }
}

impl Default for ReplicationHub {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// replica side
// ---------------------------------------------------------------------------

/// Connects to the master and applies its snapshot + write stream to
/// the local engine. Reconnects with exponential backoff.
pub struct ReplicaClient {
    engine: Engine,
    master_host: String,
    master_port: u16,
}

impl ReplicaClient {
    /// Spawns the replica task in the background.
    pub fn start(engine: Engine, cfg: &ReplicaSection) {
        let client = ReplicaClient {
            engine,
            master_host: cfg.master_host.clone(),
            master_port: cfg.master_port,
        };
        tokio::spawn(async move {
            client.run().await;
        });
    }

    async fn run(&self) {
        const MAX_BACKOFF: Duration = Duration::from_secs(30);
        let mut backoff = Duration::from_millis(500);
        let mut last_offset: u64 = 0;

        loop {
            let addr = format!("{}:{}", self.master_host, self.master_port);
            info!(master = %addr, "connecting for replication");
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    backoff = Duration::from_millis(500);
                    match self.sync(stream, &mut last_offset).await {
                        Ok(()) => info!("replication link closed"),
                        Err(e) => warn!("replication error: {e}"),
                    }
                }
                Err(e) => warn!(master = %addr, "connect failed: {e}"),
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// One connection session: handshake, then apply frames forever.
    async fn sync(&self, mut stream: TcpStream, last_offset: &mut u64) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let handshake = if *last_offset > 0 {
            command_bytes(&[b"PSYNC", last_offset.to_string().as_bytes()])
        } else {
            command_bytes(&[b"SYNC"])
        };
        stream.write_all(&handshake).await?;

        let mut parser = FrameParser::new();
        let mut chunk = vec![0u8; 64 * 1024];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            parser.append(&chunk[..n]);

            loop {
                match parser.try_parse() {
                    Ok(Some(frame)) => self.apply(frame, last_offset),
                    Ok(None) => break,
                    Err(e) => {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            format!("malformed replication stream: {e}"),
                        ));
                    }
                }
            }
        }
    }

    /// Applies one frame from the master: a bulk is the full snapshot,
    /// an array is a write command, `+OFFSET <n>` advances the offset.
    fn apply(&self, frame: Frame, last_offset: &mut u64) {
        match frame {
            Frame::Bulk(data) => {
                if let Err(e) = rdb::decode(&data, &self.engine) {
                    warn!("full resync snapshot failed to load: {e}");
                } else {
                    info!(keys = self.engine.key_count(), "full resync applied");
                }
            }
            Frame::Array(items) => {
                if let Err(e) = apply_replicated_command(&self.engine, &items) {
                    warn!("replicated command rejected: {e}");
                }
            }
            Frame::Simple(s) => {
                if let Some(rest) = s.strip_prefix("OFFSET ") {
                    match rest.parse::<u64>() {
                        Ok(n) => *last_offset = n,
                        Err(_) => debug!("unparseable offset line: {s:?}"),
                    }
                }
            }
            other => debug!("ignoring replication frame: {other:?}"),
        }
    }
}

fn command_bytes(parts: &[&[u8]]) -> Bytes {
    let items = parts
        .iter()
        .map(|p| Frame::Bulk(Bytes::copy_from_slice(p)))
        .collect();
    Frame::Array(items).to_bytes().freeze()
}

/// Applies one replicated write command directly to the engine.
///
/// The supported set mirrors what the dispatcher forwards; anything
/// else is reported as an error string.
pub fn apply_replicated_command(engine: &Engine, items: &[Frame]) -> Result<(), String> {
    let arg = |i: usize| -> Result<Bytes, String> {
        items
            .get(i)
            .and_then(Frame::as_bulk)
            .cloned()
            .ok_or_else(|| format!("missing bulk argument {i}"))
    };
    let text = |i: usize| -> Result<String, String> {
        let raw = arg(i)?;
        String::from_utf8(raw.to_vec()).map_err(|_| format!("argument {i} is not utf-8"))
    };

    let name = text(0)?.to_ascii_uppercase();
    match name.as_str() {
        "SET" => {
            // the master forwards the client's SET verbatim, so any
            // EX/PX options arrive here and are re-parsed
            let (key, value) = (arg(1)?, arg(2)?);
            match items.len() {
                3 => engine.set(&key, value, None).map_err(|e| e.to_string()),
                5 => {
                    let unit = text(3)?.to_ascii_uppercase();
                    let amount: i64 = text(4)?.parse().map_err(|_| "bad ttl".to_string())?;
                    let ttl_ms = match unit.as_str() {
                        "EX" => amount * 1000,
                        "PX" => amount,
                        _ => return Err(format!("bad SET option {unit}")),
                    };
                    engine
                        .set(&key, value, Some(ttl_ms))
                        .map_err(|e| e.to_string())
                }
                n => Err(format!("bad SET arity {n}")),
            }
        }
        "DEL" => {
            let keys: Vec<Bytes> = (1..items.len())
                .map(arg)
                .collect::<Result<_, _>>()?;
            engine.del(&keys);
            Ok(())
        }
        "EXPIRE" => {
            let secs: i64 = text(2)?.parse().map_err(|_| "bad seconds".to_string())?;
            engine.expire(&arg(1)?, secs);
            Ok(())
        }
        "PEXPIREAT" => {
            let at: i64 = text(2)?.parse().map_err(|_| "bad deadline".to_string())?;
            engine.set_key_expire_at_ms(&arg(1)?, at);
            Ok(())
        }
        "HSET" => {
            engine
                .hset(&arg(1)?, arg(2)?, arg(3)?)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        "HDEL" => {
            let fields: Vec<Bytes> = (2..items.len())
                .map(arg)
                .collect::<Result<_, _>>()?;
            engine
                .hdel(&arg(1)?, &fields)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        "ZADD" => {
            let score: f64 = text(2)?.parse().map_err(|_| "bad score".to_string())?;
            engine
                .zadd(&arg(1)?, score, arg(3)?)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        "ZREM" => {
            let members: Vec<Bytes> = (2..items.len())
                .map(arg)
                .collect::<Result<_, _>>()?;
            engine
                .zrem(&arg(1)?, &members)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        other => Err(format!("unreplicatable command {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn cmd(parts: &[&str]) -> Vec<Frame> {
        parts.iter().map(|p| Frame::bulk(b(p))).collect()
    }

    #[test]
    fn hub_offset_advances_per_publish() {
        let hub = ReplicationHub::new();
        assert_eq!(hub.offset(), 0);
        hub.publish(b("cmd1"));
        hub.publish(b("cmd2"));
        assert_eq!(hub.offset(), 2);
    }

    #[test]
    fn subscriber_sees_published_events() {
        let hub = ReplicationHub::new();
        let mut rx = hub.subscribe();
        hub.publish(b("payload"));
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.raw, b("payload"));
        assert_eq!(ev.offset, 1);
    }

    #[test]
    fn events_published_before_subscribe_are_not_replayed() {
        let hub = ReplicationHub::new();
        hub.publish(b("early"));
        let mut rx = hub.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn apply_set_and_del() {
        let engine = Engine::new();
        apply_replicated_command(&engine, &cmd(&["SET", "k", "v"])).unwrap();
        assert_eq!(engine.get(b"k").unwrap(), Some(b("v")));

        apply_replicated_command(&engine, &cmd(&["DEL", "k"])).unwrap();
        assert!(!engine.exists(b"k"));
    }

    #[test]
    fn apply_set_with_ttl_options() {
        let engine = Engine::new();
        apply_replicated_command(&engine, &cmd(&["SET", "k", "v", "EX", "100"])).unwrap();
        assert!(engine.ttl(b"k") > 90);

        apply_replicated_command(&engine, &cmd(&["SET", "p", "v", "PX", "90000"])).unwrap();
        assert!(engine.ttl(b"p") > 80);
    }

    #[test]
    fn apply_hash_and_zset_commands() {
        let engine = Engine::new();
        apply_replicated_command(&engine, &cmd(&["HSET", "h", "f", "v"])).unwrap();
        apply_replicated_command(&engine, &cmd(&["ZADD", "z", "2.5", "m"])).unwrap();
        assert_eq!(engine.hget(b"h", b"f").unwrap(), Some(b("v")));
        assert_eq!(engine.zscore(b"z", b"m").unwrap(), Some(2.5));

        apply_replicated_command(&engine, &cmd(&["HDEL", "h", "f"])).unwrap();
        apply_replicated_command(&engine, &cmd(&["ZREM", "z", "m"])).unwrap();
        assert!(!engine.exists(b"h"));
        assert!(!engine.exists(b"z"));
    }

    #[test]
    fn apply_pexpireat() {
        let engine = Engine::new();
        apply_replicated_command(&engine, &cmd(&["SET", "k", "v"])).unwrap();
        let deadline = garnet_core::time::now_ms() + 50_000;
        apply_replicated_command(
            &engine,
            &cmd(&["PEXPIREAT", "k", &deadline.to_string()]),
        )
        .unwrap();
        assert!(engine.ttl(b"k") > 40);
    }

    #[test]
    fn unknown_replicated_command_is_an_error() {
        let engine = Engine::new();
        assert!(apply_replicated_command(&engine, &cmd(&["FLUSHALL"])).is_err());
    }
}
