//! Command dispatcher.
//!
//! Resolves a parsed RESP array into a command, validates arity, calls
//! the keyspace engine and produces the reply frame. Write commands
//! that succeed are additionally fanned out: their exact wire bytes go
//! to the AOF and to every connected replica, with the master offset
//! advancing per command. The write path is serialized through one
//! dispatcher mutex so commit order, log order and stream order agree.
//!
//! The same command table serves AOF replay at startup ([`Dispatcher::replay`]):
//! replayed commands mutate the engine but are neither re-appended nor
//! forwarded.

use std::sync::Arc;

use bytes::Bytes;
use garnet_core::{Engine, WrongType};
use garnet_persistence::aof::{Aof, AofError};
use garnet_persistence::rdb::RdbOptions;
use garnet_protocol::Frame;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::replication::ReplicationHub;

/// What the connection should do with a dispatched command.
pub enum Outcome {
    /// Serialize the frame back to the client.
    Reply(Frame),
    /// The client asked for SYNC/PSYNC: send a full resync and start
    /// streaming writes.
    StartReplicaStream,
}

enum Mode {
    /// Live traffic: propagate successful writes to AOF and replicas.
    Live,
    /// AOF replay: mutate the engine only.
    Replay,
}

pub struct Dispatcher {
    pub engine: Engine,
    pub aof: Arc<Aof>,
    pub rdb: RdbOptions,
    pub hub: Arc<ReplicationHub>,
    /// Serializes write commands end to end (engine call + fan-out).
    write_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        engine: Engine,
        aof: Arc<Aof>,
        rdb: RdbOptions,
        hub: Arc<ReplicationHub>,
    ) -> Self {
        Self {
            engine,
            aof,
            rdb,
            hub,
            write_lock: Mutex::new(()),
        }
    }

    /// Dispatches one client command. `raw` is the exact wire form of
    /// `frame`, forwarded untouched on the write path.
    pub fn dispatch(&self, frame: Frame, raw: Bytes) -> Outcome {
        self.execute(frame, raw, Mode::Live)
    }

    /// Replays one command from the AOF, discarding the reply.
    pub fn replay(&self, frame: Frame) {
        let outcome = self.execute(frame, Bytes::new(), Mode::Replay);
        if let Outcome::Reply(Frame::Error(msg)) = outcome {
            error!("aof replay rejected a command: {msg}");
        }
    }

    fn execute(&self, frame: Frame, raw: Bytes, mode: Mode) -> Outcome {
        let items = match frame {
            Frame::Array(items) if !items.is_empty() => items,
            _ => return reply_err("ERR protocol: expected a non-empty command array"),
        };

        let name = match command_name(&items[0]) {
            Some(name) => name,
            None => return reply_err("ERR protocol: command name must be a string"),
        };
        let args = &items[1..];

        match name.as_str() {
            "PING" => self.ping(args),
            "ECHO" => self.echo(args),
            "GET" => self.get(args),
            "SET" => self.set(args, &raw, &mode),
            "DEL" => self.del(args, &raw, &mode),
            "EXISTS" => self.exists(args),
            "EXPIRE" => self.expire(args, &raw, &mode),
            "PEXPIREAT" => self.pexpireat(args, &raw, &mode),
            "TTL" => self.ttl(args),
            "KEYS" => self.keys(args),
            "HSET" => self.hset(args, &raw, &mode),
            "HGET" => self.hget(args),
            "HDEL" => self.hdel(args, &raw, &mode),
            "HEXISTS" => self.hexists(args),
            "HGETALL" => self.hgetall(args),
            "HLEN" => self.hlen(args),
            "ZADD" => self.zadd(args, &raw, &mode),
            "ZREM" => self.zrem(args, &raw, &mode),
            "ZRANGE" => self.zrange(args),
            "ZSCORE" => self.zscore(args),
            "BGSAVE" => self.bgsave(args),
            "BGREWRITEAOF" => self.bgrewriteaof(args),
            "SELECT" => self.select(args),
            "SYNC" | "PSYNC" => Outcome::StartReplicaStream,
            _ => reply_err(&format!("ERR unknown command '{name}'")),
        }
    }

    /// Forwards one committed write to the AOF and the replica stream.
    /// An `always`-policy fsync failure surfaces as an error reply; the
    /// command stays committed in memory.
    fn propagate(&self, raw: &Bytes, mode: &Mode) -> Option<Outcome> {
        if matches!(mode, Mode::Replay) {
            return None;
        }
        if let Err(e) = self.aof.append_raw(raw.clone()) {
            match e {
                AofError::WriteFailed(_) | AofError::Closed => {
                    return Some(reply_err(&format!("ERR aof: {e}")));
                }
                _ => error!("aof append failed: {e}"),
            }
        }
        self.hub.publish(raw.clone());
        None
    }

    // -- connection commands --

    fn ping(&self, args: &[Frame]) -> Outcome {
        match args {
            [] => Outcome::Reply(Frame::Simple("PONG".into())),
            [msg] => match msg.as_bulk() {
                Some(data) => Outcome::Reply(Frame::Bulk(data.clone())),
                None => reply_err("ERR protocol: PING argument must be a bulk string"),
            },
            _ => arity_err("ping"),
        }
    }

    fn echo(&self, args: &[Frame]) -> Outcome {
        match args {
            [msg] => match msg.as_bulk() {
                Some(data) => Outcome::Reply(Frame::Bulk(data.clone())),
                None => reply_err("ERR protocol: ECHO argument must be a bulk string"),
            },
            _ => arity_err("echo"),
        }
    }

    fn select(&self, args: &[Frame]) -> Outcome {
        match args {
            [db] => match bulk_str(db).as_deref() {
                Some("0") => ok(),
                Some(_) => reply_err("ERR DB index is out of range"),
                None => reply_err("ERR invalid DB index"),
            },
            _ => arity_err("select"),
        }
    }

    // -- string commands --

    fn set(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        let (key, value) = match (args.first().and_then(Frame::as_bulk), args.get(1).and_then(Frame::as_bulk)) {
            (Some(k), Some(v)) => (k.clone(), v.clone()),
            _ => return arity_err("set"),
        };
        let ttl_ms = match &args[2..] {
            [] => None,
            [unit, amount] => {
                let Some(amount) = bulk_str(amount).and_then(|s| s.parse::<i64>().ok()) else {
                    return reply_err("ERR value is not an integer or out of range");
                };
                if amount <= 0 {
                    return reply_err("ERR invalid expire time in 'set' command");
                }
                match bulk_str(unit).map(|s| s.to_ascii_uppercase()).as_deref() {
                    Some("EX") => Some(amount * 1000),
                    Some("PX") => Some(amount),
                    _ => return reply_err("ERR syntax error"),
                }
            }
            _ => return reply_err("ERR syntax error"),
        };

        let _write = self.write_lock.lock();
        match self.engine.set(&key, value, ttl_ms) {
            Ok(()) => self.propagate(raw, mode).unwrap_or_else(ok),
            Err(e) => wrongtype(e),
        }
    }

    fn get(&self, args: &[Frame]) -> Outcome {
        let [key] = args else { return arity_err("get") };
        let Some(key) = key.as_bulk() else {
            return arity_err("get");
        };
        match self.engine.get(key) {
            Ok(Some(value)) => Outcome::Reply(Frame::Bulk(value)),
            Ok(None) => Outcome::Reply(Frame::NullBulk),
            Err(e) => wrongtype(e),
        }
    }

    fn del(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        if args.is_empty() {
            return arity_err("del");
        }
        let Some(keys) = all_bulks(args) else {
            return arity_err("del");
        };
        let _write = self.write_lock.lock();
        let removed = self.engine.del(&keys);
        self.propagate(raw, mode)
            .unwrap_or_else(|| int(removed as i64))
    }

    fn exists(&self, args: &[Frame]) -> Outcome {
        let [key] = args else { return arity_err("exists") };
        let Some(key) = key.as_bulk() else {
            return arity_err("exists");
        };
        int(i64::from(self.engine.exists(key)))
    }

    fn expire(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        let [key, seconds] = args else {
            return arity_err("expire");
        };
        let (Some(key), Some(seconds)) = (key.as_bulk(), bulk_str(seconds)) else {
            return arity_err("expire");
        };
        let Ok(seconds) = seconds.parse::<i64>() else {
            return reply_err("ERR value is not an integer or out of range");
        };
        let _write = self.write_lock.lock();
        let applied = self.engine.expire(key, seconds);
        self.propagate(raw, mode)
            .unwrap_or_else(|| int(i64::from(applied)))
    }

    /// EXPIREAT-equivalent emitted by the AOF rewrite: applies an
    /// absolute millisecond deadline to a key of any type.
    fn pexpireat(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        let [key, deadline] = args else {
            return arity_err("pexpireat");
        };
        let (Some(key), Some(deadline)) = (key.as_bulk(), bulk_str(deadline)) else {
            return arity_err("pexpireat");
        };
        let Ok(deadline) = deadline.parse::<i64>() else {
            return reply_err("ERR value is not an integer or out of range");
        };
        let _write = self.write_lock.lock();
        let applied = self.engine.set_key_expire_at_ms(key, deadline);
        self.propagate(raw, mode)
            .unwrap_or_else(|| int(i64::from(applied)))
    }

    fn ttl(&self, args: &[Frame]) -> Outcome {
        let [key] = args else { return arity_err("ttl") };
        let Some(key) = key.as_bulk() else {
            return arity_err("ttl");
        };
        int(self.engine.ttl(key))
    }

    fn keys(&self, args: &[Frame]) -> Outcome {
        let [pattern] = args else { return arity_err("keys") };
        let Some(pattern) = pattern.as_bulk() else {
            return arity_err("keys");
        };
        let keys = self.engine.list_keys();
        let matched = keys
            .into_iter()
            .filter(|k| pattern.as_ref() == b"*" || k == pattern)
            .map(Frame::Bulk)
            .collect();
        Outcome::Reply(Frame::Array(matched))
    }

    // -- hash commands --

    fn hset(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        let [key, field, value] = args else {
            return arity_err("hset");
        };
        let (Some(key), Some(field), Some(value)) =
            (key.as_bulk(), field.as_bulk(), value.as_bulk())
        else {
            return arity_err("hset");
        };
        let _write = self.write_lock.lock();
        match self.engine.hset(key, field.clone(), value.clone()) {
            Ok(added) => self.propagate(raw, mode).unwrap_or_else(|| int(added)),
            Err(e) => wrongtype(e),
        }
    }

    fn hget(&self, args: &[Frame]) -> Outcome {
        let [key, field] = args else { return arity_err("hget") };
        let (Some(key), Some(field)) = (key.as_bulk(), field.as_bulk()) else {
            return arity_err("hget");
        };
        match self.engine.hget(key, field) {
            Ok(Some(value)) => Outcome::Reply(Frame::Bulk(value)),
            Ok(None) => Outcome::Reply(Frame::NullBulk),
            Err(e) => wrongtype(e),
        }
    }

    fn hdel(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        if args.len() < 2 {
            return arity_err("hdel");
        }
        let Some(mut parts) = all_bulks(args) else {
            return arity_err("hdel");
        };
        let key = parts.remove(0);
        let _write = self.write_lock.lock();
        match self.engine.hdel(&key, &parts) {
            Ok(removed) => self
                .propagate(raw, mode)
                .unwrap_or_else(|| int(removed as i64)),
            Err(e) => wrongtype(e),
        }
    }

    fn hexists(&self, args: &[Frame]) -> Outcome {
        let [key, field] = args else {
            return arity_err("hexists");
        };
        let (Some(key), Some(field)) = (key.as_bulk(), field.as_bulk()) else {
            return arity_err("hexists");
        };
        match self.engine.hexists(key, field) {
            Ok(present) => int(i64::from(present)),
            Err(e) => wrongtype(e),
        }
    }

    fn hgetall(&self, args: &[Frame]) -> Outcome {
        let [key] = args else { return arity_err("hgetall") };
        let Some(key) = key.as_bulk() else {
            return arity_err("hgetall");
        };
        match self.engine.hgetall_flat(key) {
            Ok(flat) => Outcome::Reply(Frame::Array(flat.into_iter().map(Frame::Bulk).collect())),
            Err(e) => wrongtype(e),
        }
    }

    fn hlen(&self, args: &[Frame]) -> Outcome {
        let [key] = args else { return arity_err("hlen") };
        let Some(key) = key.as_bulk() else {
            return arity_err("hlen");
        };
        match self.engine.hlen(key) {
            Ok(len) => int(len as i64),
            Err(e) => wrongtype(e),
        }
    }

    // -- sorted-set commands --

    fn zadd(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        let [key, score, member] = args else {
            return arity_err("zadd");
        };
        let (Some(key), Some(score), Some(member)) =
            (key.as_bulk(), bulk_str(score), member.as_bulk())
        else {
            return arity_err("zadd");
        };
        let Ok(score) = score.parse::<f64>() else {
            return reply_err("ERR value is not a valid float");
        };
        let _write = self.write_lock.lock();
        match self.engine.zadd(key, score, member.clone()) {
            Ok(added) => self.propagate(raw, mode).unwrap_or_else(|| int(added)),
            Err(e) => wrongtype(e),
        }
    }

    fn zrem(&self, args: &[Frame], raw: &Bytes, mode: &Mode) -> Outcome {
        if args.len() < 2 {
            return arity_err("zrem");
        }
        let Some(mut parts) = all_bulks(args) else {
            return arity_err("zrem");
        };
        let key = parts.remove(0);
        let _write = self.write_lock.lock();
        match self.engine.zrem(&key, &parts) {
            Ok(removed) => self
                .propagate(raw, mode)
                .unwrap_or_else(|| int(removed as i64)),
            Err(e) => wrongtype(e),
        }
    }

    fn zrange(&self, args: &[Frame]) -> Outcome {
        let [key, start, stop] = args else {
            return arity_err("zrange");
        };
        let (Some(key), Some(start), Some(stop)) =
            (key.as_bulk(), bulk_str(start), bulk_str(stop))
        else {
            return arity_err("zrange");
        };
        let (Ok(start), Ok(stop)) = (start.parse::<i64>(), stop.parse::<i64>()) else {
            return reply_err("ERR value is not an integer or out of range");
        };
        match self.engine.zrange(key, start, stop) {
            Ok(members) => {
                Outcome::Reply(Frame::Array(members.into_iter().map(Frame::Bulk).collect()))
            }
            Err(e) => wrongtype(e),
        }
    }

    fn zscore(&self, args: &[Frame]) -> Outcome {
        let [key, member] = args else { return arity_err("zscore") };
        let (Some(key), Some(member)) = (key.as_bulk(), member.as_bulk()) else {
            return arity_err("zscore");
        };
        match self.engine.zscore(key, member) {
            Ok(Some(score)) => Outcome::Reply(Frame::bulk(score.to_string())),
            Ok(None) => Outcome::Reply(Frame::NullBulk),
            Err(e) => wrongtype(e),
        }
    }

    // -- persistence commands --

    fn bgsave(&self, args: &[Frame]) -> Outcome {
        if !args.is_empty() {
            return arity_err("bgsave");
        }
        if !self.rdb.enabled {
            return reply_err("ERR snapshots are disabled");
        }
        let engine = self.engine.clone();
        let path = self.rdb.path();
        std::thread::spawn(move || {
            if let Err(e) = garnet_persistence::rdb::save(&path, &engine) {
                error!("background save failed: {e}");
            }
        });
        Outcome::Reply(Frame::Simple("Background saving started".into()))
    }

    fn bgrewriteaof(&self, args: &[Frame]) -> Outcome {
        if !args.is_empty() {
            return arity_err("bgrewriteaof");
        }
        match self.aof.bg_rewrite(self.engine.clone()) {
            Ok(()) => {
                info!("background aof rewrite started");
                Outcome::Reply(Frame::Simple(
                    "Background append only file rewriting started".into(),
                ))
            }
            Err(e) => reply_err(&format!("ERR {e}")),
        }
    }
}

// ---------------------------------------------------------------------------
// reply helpers
// ---------------------------------------------------------------------------

fn ok() -> Outcome {
    Outcome::Reply(Frame::Simple("OK".into()))
}

fn int(n: i64) -> Outcome {
    Outcome::Reply(Frame::Integer(n))
}

fn reply_err(msg: &str) -> Outcome {
    Outcome::Reply(Frame::Error(msg.into()))
}

fn arity_err(cmd: &str) -> Outcome {
    reply_err(&format!("ERR wrong number of arguments for '{cmd}' command"))
}

fn wrongtype(e: WrongType) -> Outcome {
    Outcome::Reply(Frame::Error(e.to_string()))
}

/// The command name from the first array element, uppercased.
fn command_name(frame: &Frame) -> Option<String> {
    match frame {
        Frame::Bulk(data) => std::str::from_utf8(data)
            .ok()
            .map(|s| s.to_ascii_uppercase()),
        Frame::Simple(s) => Some(s.to_ascii_uppercase()),
        _ => None,
    }
}

/// A bulk argument decoded as UTF-8, for numeric and option parsing.
fn bulk_str(frame: &Frame) -> Option<String> {
    frame
        .as_bulk()
        .and_then(|b| std::str::from_utf8(b).ok().map(str::to_owned))
}

/// All arguments as bulk payloads, or `None` if any is not a bulk.
fn all_bulks(args: &[Frame]) -> Option<Vec<Bytes>> {
    args.iter().map(|f| f.as_bulk().cloned()).collect()
}
