//! Text-framed snapshot files.
//!
//! Writes go to a `.tmp` file first and are atomically renamed after an
//! fsync, so a crash mid-save leaves the previous snapshot intact.
//!
//! File layout (`MRDB2`):
//! ```text
//! MRDB2\n
//! STR <n>\n
//! <klen> <key> <vlen> <value> <expire_at_ms>\n        × n
//! HASH <m>\n
//! <klen> <key> <expire_at_ms> <field_count>\n
//!   <flen> <field> <vlen> <value>\n                   × field_count
//! ZSET <p>\n
//! <klen> <key> <expire_at_ms> <item_count>\n
//!   <score> <mlen> <member>\n                         × item_count
//! ```
//!
//! Lengths and timestamps are ASCII decimal; scores use the shortest
//! round-trip `f64` formatting. Keys, values, fields and members are
//! raw bytes of exactly the announced length and may contain newlines —
//! the reader consumes length-prefixed spans by count and only then
//! requires the separator. A legacy `MRDB1` magic marks a strings-only
//! body (count line followed by string records) and is still loadable.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use garnet_core::{Engine, WrongType};
use thiserror::Error;
use tracing::info;

const MAGIC_V2: &[u8] = b"MRDB2";
const MAGIC_V1: &[u8] = b"MRDB1";

/// Errors that can occur when saving or loading a snapshot.
#[derive(Debug, Error)]
pub enum RdbError {
    #[error("invalid magic bytes")]
    InvalidMagic,

    #[error("unexpected end of snapshot")]
    UnexpectedEof,

    #[error("invalid snapshot data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    WrongType(#[from] WrongType),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Snapshot configuration, as exposed through the config file.
#[derive(Debug, Clone)]
pub struct RdbOptions {
    pub enabled: bool,
    pub dir: PathBuf,
    pub filename: String,
}

impl Default for RdbOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("."),
            filename: "dump.mrdb".into(),
        }
    }
}

impl RdbOptions {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.filename)
    }
}

// ---------------------------------------------------------------------------
// encoding
// ---------------------------------------------------------------------------

/// Serializes a point-in-time snapshot of the engine into memory.
///
/// The three typed snapshots are taken back to back; each is consistent
/// under the engine mutex.
pub fn encode(engine: &Engine) -> Vec<u8> {
    let strings = engine.snapshot_strings();
    let hashes = engine.snapshot_hashes();
    let zsets = engine.snapshot_zsets();

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC_V2);
    out.push(b'\n');

    out.extend_from_slice(format!("STR {}\n", strings.len()).as_bytes());
    for (key, rec) in &strings {
        push_span(&mut out, key);
        out.push(b' ');
        push_span(&mut out, &rec.value);
        out.extend_from_slice(format!(" {}\n", rec.expire_at_ms).as_bytes());
    }

    out.extend_from_slice(format!("HASH {}\n", hashes.len()).as_bytes());
    for (key, rec) in &hashes {
        push_span(&mut out, key);
        out.extend_from_slice(format!(" {} {}\n", rec.expire_at_ms, rec.fields.len()).as_bytes());
        for (field, value) in &rec.fields {
            push_span(&mut out, field);
            out.push(b' ');
            push_span(&mut out, value);
            out.push(b'\n');
        }
    }

    out.extend_from_slice(format!("ZSET {}\n", zsets.len()).as_bytes());
    for flat in &zsets {
        push_span(&mut out, &flat.key);
        out.extend_from_slice(format!(" {} {}\n", flat.expire_at_ms, flat.items.len()).as_bytes());
        for (score, member) in &flat.items {
            out.extend_from_slice(score.to_string().as_bytes());
            out.push(b' ');
            push_span(&mut out, member);
            out.push(b'\n');
        }
    }

    out
}

/// Writes `<len> <bytes>` — the length-prefixed span encoding.
fn push_span(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(data);
}

/// Saves a snapshot to `path` via write-to-temp, fsync, atomic rename.
pub fn save(path: &Path, engine: &Engine) -> Result<(), RdbError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let data = encode(engine);

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(&data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;

    info!(path = %path.display(), bytes = data.len(), "snapshot saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// decoding
// ---------------------------------------------------------------------------

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, RdbError> {
        let b = *self.data.get(self.pos).ok_or(RdbError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, want: u8) -> Result<(), RdbError> {
        let got = self.byte()?;
        if got != want {
            return Err(RdbError::InvalidData(format!(
                "expected {:?}, got {:?} at offset {}",
                want as char, got as char, self.pos - 1
            )));
        }
        Ok(())
    }

    fn expect_literal(&mut self, lit: &[u8]) -> Result<(), RdbError> {
        for &b in lit {
            self.expect(b)?;
        }
        Ok(())
    }

    /// Reads an ASCII token up to (not including) the next space or
    /// newline. The separator is left in place.
    fn token(&mut self) -> Result<&'a [u8], RdbError> {
        let start = self.pos;
        while let Some(&b) = self.data.get(self.pos) {
            if b == b' ' || b == b'\n' {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(RdbError::InvalidData(format!(
                "empty token at offset {start}"
            )));
        }
        Ok(&self.data[start..self.pos])
    }

    fn usize_token(&mut self) -> Result<usize, RdbError> {
        let tok = self.token()?;
        std::str::from_utf8(tok)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RdbError::InvalidData(format!("bad length at offset {}", self.pos)))
    }

    fn i64_token(&mut self) -> Result<i64, RdbError> {
        let tok = self.token()?;
        std::str::from_utf8(tok)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RdbError::InvalidData(format!("bad integer at offset {}", self.pos)))
    }

    fn f64_token(&mut self) -> Result<f64, RdbError> {
        let tok = self.token()?;
        std::str::from_utf8(tok)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RdbError::InvalidData(format!("bad score at offset {}", self.pos)))
    }

    /// Consumes a `<len> <bytes>` span by count — the bytes may contain
    /// anything, including newlines.
    fn span(&mut self) -> Result<&'a [u8], RdbError> {
        let len = self.usize_token()?;
        self.expect(b' ')?;
        let end = self.pos.checked_add(len).ok_or(RdbError::UnexpectedEof)?;
        if end > self.data.len() {
            return Err(RdbError::UnexpectedEof);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }
}

/// Reads a string record line: `<klen> <key> <vlen> <value> <exp>\n`.
fn read_string_record(r: &mut Reader<'_>, engine: &Engine) -> Result<(), RdbError> {
    let key = r.span()?;
    r.expect(b' ')?;
    let value = Bytes::copy_from_slice(r.span()?);
    r.expect(b' ')?;
    let exp = r.i64_token()?;
    r.expect(b'\n')?;
    engine.set_with_expire_at_ms(key, value, exp)?;
    Ok(())
}

/// Parses a snapshot and loads it into the engine through the public
/// typed setters.
pub fn decode(data: &[u8], engine: &Engine) -> Result<(), RdbError> {
    let mut r = Reader::new(data);

    // magic line
    let magic = r.token()?;
    let legacy = match magic {
        m if m == MAGIC_V2 => false,
        m if m == MAGIC_V1 => true,
        _ => return Err(RdbError::InvalidMagic),
    };
    r.expect(b'\n')?;

    // STR section; the legacy body may carry a bare count line
    let str_count = if legacy {
        let save = r.pos;
        match r.expect_literal(b"STR ") {
            Ok(()) => {}
            Err(_) => r.pos = save,
        }
        r.usize_token()?
    } else {
        r.expect_literal(b"STR ")?;
        r.usize_token()?
    };
    r.expect(b'\n')?;
    for _ in 0..str_count {
        read_string_record(&mut r, engine)?;
    }
    if legacy {
        return Ok(());
    }

    // HASH section
    r.expect_literal(b"HASH ")?;
    let hash_count = r.usize_token()?;
    r.expect(b'\n')?;
    for _ in 0..hash_count {
        let key = Bytes::copy_from_slice(r.span()?);
        r.expect(b' ')?;
        let exp = r.i64_token()?;
        r.expect(b' ')?;
        let field_count = r.usize_token()?;
        r.expect(b'\n')?;
        for _ in 0..field_count {
            let field = Bytes::copy_from_slice(r.span()?);
            r.expect(b' ')?;
            let value = Bytes::copy_from_slice(r.span()?);
            r.expect(b'\n')?;
            engine.hset(&key, field, value)?;
        }
        if exp >= 0 && field_count > 0 {
            engine.set_hash_expire_at_ms(&key, exp);
        }
    }

    // ZSET section
    r.expect_literal(b"ZSET ")?;
    let zset_count = r.usize_token()?;
    r.expect(b'\n')?;
    for _ in 0..zset_count {
        let key = Bytes::copy_from_slice(r.span()?);
        r.expect(b' ')?;
        let exp = r.i64_token()?;
        r.expect(b' ')?;
        let item_count = r.usize_token()?;
        r.expect(b'\n')?;
        for _ in 0..item_count {
            let score = r.f64_token()?;
            r.expect(b' ')?;
            let member = Bytes::copy_from_slice(r.span()?);
            r.expect(b'\n')?;
            engine.zadd(&key, score, member)?;
        }
        if exp >= 0 && item_count > 0 {
            engine.set_zset_expire_at_ms(&key, exp);
        }
    }

    Ok(())
}

/// Loads the snapshot at `path` into the engine. A missing file is not
/// an error; returns whether anything was loaded.
pub fn load(path: &Path, engine: &Engine) -> Result<bool, RdbError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    decode(&data, engine)?;
    info!(path = %path.display(), keys = engine.key_count(), "snapshot loaded");
    Ok(true)
}
