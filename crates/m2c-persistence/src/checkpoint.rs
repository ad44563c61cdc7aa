//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Durable (stream, kind) -> sequence checkpoint table."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::atomic::write_atomic;
use crate::metrics::PersistenceMetrics;
use crate::{PersistenceError, Result};

/// File name of the checkpoint store inside the publisher directory.
pub const CHECKPOINT_FILE_NAME: &str = "stream_checkpoints";

const MAGIC: &[u8; 4] = b"M2CK";
const FORMAT_VERSION: u16 = 1;

/// Kind of checkpoint recorded for a stream.
///
/// Kinds written by newer releases decode as [`CheckpointKind::Other`] and are
/// written back unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CheckpointKind {
    /// Next sequence the publisher intends to read.
    Primary,
    /// Highest sequence routed to every enabled sink.
    Trailing,
    /// Unrecognised kind, preserved verbatim.
    Other(u8),
}

impl CheckpointKind {
    fn code(self) -> u8 {
        match self {
            CheckpointKind::Primary => 0,
            CheckpointKind::Trailing => 1,
            CheckpointKind::Other(code) => code,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => CheckpointKind::Primary,
            1 => CheckpointKind::Trailing,
            other => CheckpointKind::Other(other),
        }
    }
}

type Table = BTreeMap<(String, CheckpointKind), u64>;

/// Checkpoint table persisted as
/// `"M2CK" | version: u16 | count: u32 | { name_len: u16 | name | kind: u8 | sequence: u64 }*`,
/// all integers big-endian.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    entries: Mutex<Table>,
    metrics: Option<PersistenceMetrics>,
}

impl CheckpointStore {
    /// Load the store at `path`; a missing file is an empty store, an
    /// undecodable one is an error.
    pub fn open(path: impl Into<PathBuf>, metrics: Option<PersistenceMetrics>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => decode(&path, &bytes)?,
            Err(err) if err.kind() == ErrorKind::NotFound => Table::new(),
            Err(err) => return Err(err.into()),
        };
        debug!(path = %path.display(), entries = entries.len(), "checkpoint store loaded");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            metrics,
        })
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current value for `(stream, kind)`.
    pub fn get(&self, stream: &str, kind: CheckpointKind) -> Option<u64> {
        self.entries.lock().get(&(stream.to_owned(), kind)).copied()
    }

    /// Set one checkpoint and persist the table.
    pub fn set(&self, stream: &str, kind: CheckpointKind, sequence: u64) -> Result<()> {
        self.commit(stream, &[(kind, sequence)])
    }

    /// Set several checkpoints of one stream in a single durable write. The
    /// in-memory table only changes once the write has succeeded.
    pub fn commit(&self, stream: &str, values: &[(CheckpointKind, u64)]) -> Result<()> {
        let started = Instant::now();
        let mut entries = self.entries.lock();
        let mut next = entries.clone();
        for (kind, sequence) in values {
            next.insert((stream.to_owned(), *kind), *sequence);
        }
        write_atomic(&self.path, &encode(&next))?;
        *entries = next;
        drop(entries);
        if let Some(metrics) = &self.metrics {
            metrics.observe_checkpoint_write(started.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Snapshot of every stored checkpoint.
    pub fn entries(&self) -> Vec<(String, CheckpointKind, u64)> {
        self.entries
            .lock()
            .iter()
            .map(|((stream, kind), sequence)| (stream.clone(), *kind, *sequence))
            .collect()
    }
}

fn encode(entries: &Table) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(10 + entries.len() * 32);
    buf.put_slice(MAGIC);
    buf.put_u16(FORMAT_VERSION);
    buf.put_u32(entries.len() as u32);
    for ((stream, kind), sequence) in entries {
        let name = stream.as_bytes();
        buf.put_u16(name.len() as u16);
        buf.put_slice(name);
        buf.put_u8(kind.code());
        buf.put_u64(*sequence);
    }
    buf.to_vec()
}

fn decode(path: &Path, bytes: &[u8]) -> Result<Table> {
    let corrupt = |reason: &str| PersistenceError::Corrupt {
        what: "checkpoint store",
        path: path.display().to_string(),
        reason: reason.to_owned(),
    };
    let mut buf = bytes;
    if buf.remaining() < 10 || &buf[..4] != MAGIC {
        return Err(corrupt("missing header"));
    }
    buf.advance(4);
    let version = buf.get_u16();
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported version {version}")));
    }
    let count = buf.get_u32();
    let mut table = Table::new();
    for _ in 0..count {
        if buf.remaining() < 2 {
            return Err(corrupt("truncated record"));
        }
        let name_len = usize::from(buf.get_u16());
        if buf.remaining() < name_len + 9 {
            return Err(corrupt("truncated record"));
        }
        let name = std::str::from_utf8(&buf[..name_len])
            .map_err(|_| corrupt("stream name is not utf-8"))?
            .to_owned();
        buf.advance(name_len);
        let kind = CheckpointKind::from_code(buf.get_u8());
        let sequence = buf.get_u64();
        table.insert((name, kind), sequence);
    }
    if buf.has_remaining() {
        return Err(corrupt("trailing bytes"));
    }
    Ok(table)
}
