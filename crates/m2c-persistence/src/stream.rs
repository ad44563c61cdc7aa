//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Bounded segmented record stream between connector and publisher."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::metrics::PersistenceMetrics;
use crate::{PersistenceError, Result};

/// `[sequence: u64 BE][length: u32 BE]` precedes every payload.
const ENTRY_HEADER_LEN: u64 = 12;
const SEGMENT_EXTENSION: &str = "seg";

/// Capacity limits of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamOptions {
    /// Total bytes retained before the oldest segment is overwritten.
    pub max_bytes: u64,
    /// Size at which the active segment is closed and a new one started.
    pub segment_bytes: u64,
}

impl StreamOptions {
    /// Build options, clamping the segment size to the stream capacity.
    pub fn new(max_bytes: u64, segment_bytes: u64) -> Self {
        let max_bytes = max_bytes.max(ENTRY_HEADER_LEN + 1);
        Self {
            max_bytes,
            segment_bytes: segment_bytes.clamp(ENTRY_HEADER_LEN + 1, max_bytes),
        }
    }
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self::new(256 * 1024 * 1024, 16 * 1024 * 1024)
    }
}

#[derive(Debug)]
struct Segment {
    base: u64,
    path: PathBuf,
    offsets: Vec<u64>,
    bytes: u64,
}

impl Segment {
    fn end(&self) -> u64 {
        self.base + self.offsets.len() as u64
    }
}

#[derive(Debug)]
struct StreamInner {
    segments: VecDeque<Segment>,
    writer: Option<File>,
    next_sequence: u64,
    total_bytes: u64,
}

impl StreamInner {
    fn oldest(&self) -> u64 {
        self.segments
            .front()
            .map(|segment| segment.base)
            .unwrap_or(self.next_sequence)
    }
}

/// Persistent append-only log of opaque payloads.
///
/// Entries live in segment files named after their first sequence number.
/// When the retained bytes exceed [`StreamOptions::max_bytes`] whole segments
/// are dropped from the front, so readers must be prepared for
/// [`PersistenceError::Evicted`].
pub struct LocalRecordStream {
    name: String,
    dir: PathBuf,
    options: StreamOptions,
    inner: Mutex<StreamInner>,
    appended: Notify,
    metrics: Option<PersistenceMetrics>,
}

impl std::fmt::Debug for LocalRecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRecordStream")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PersistenceError::InvalidStreamName(name.to_owned()))
    }
}

fn segment_path(dir: &Path, base: u64) -> PathBuf {
    dir.join(format!("{base:020}.{SEGMENT_EXTENSION}"))
}

/// Scan a segment, truncating a torn tail left by a crash mid-append.
fn scan_segment(base: u64, path: &Path) -> Result<Segment> {
    let data = fs::read(path)?;
    let mut offsets = Vec::new();
    let mut offset = 0u64;
    let total = data.len() as u64;
    while offset + ENTRY_HEADER_LEN <= total {
        let mut header = &data[offset as usize..(offset + ENTRY_HEADER_LEN) as usize];
        let sequence = header.get_u64();
        let length = u64::from(header.get_u32());
        let expected = base + offsets.len() as u64;
        if sequence != expected || offset + ENTRY_HEADER_LEN + length > total {
            break;
        }
        offsets.push(offset);
        offset += ENTRY_HEADER_LEN + length;
    }
    if offset < total {
        warn!(
            segment = %path.display(),
            valid_bytes = offset,
            file_bytes = total,
            "truncating torn segment tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset)?;
        file.sync_all()?;
    }
    Ok(Segment {
        base,
        path: path.to_path_buf(),
        offsets,
        bytes: offset,
    })
}

impl LocalRecordStream {
    /// Open the stream stored under `{root}/{name}`, creating it if absent.
    pub fn open(
        root: &Path,
        name: &str,
        options: StreamOptions,
        metrics: Option<PersistenceMetrics>,
    ) -> Result<Self> {
        validate_name(name)?;
        let dir = root.join(name);
        fs::create_dir_all(&dir)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXTENSION) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.parse::<u64>().ok())
            {
                Some(base) => found.push((base, path)),
                None => warn!(segment = %path.display(), "ignoring unrecognised segment file"),
            }
        }
        found.sort_by_key(|(base, _)| *base);

        let mut segments: VecDeque<Segment> = VecDeque::new();
        for (base, path) in found {
            if let Some(previous) = segments.back() {
                if previous.end() != base {
                    warn!(
                        stream = name,
                        expected = previous.end(),
                        found = base,
                        "discarding segments before a sequence gap"
                    );
                    for stale in segments.drain(..) {
                        fs::remove_file(&stale.path)?;
                    }
                }
            }
            segments.push_back(scan_segment(base, &path)?);
        }

        let next_sequence = segments.back().map(Segment::end).unwrap_or(0);
        let total_bytes = segments.iter().map(|segment| segment.bytes).sum();
        debug!(
            stream = name,
            segments = segments.len(),
            next_sequence,
            total_bytes,
            "local record stream opened"
        );

        Ok(Self {
            name: name.to_owned(),
            dir,
            options,
            inner: Mutex::new(StreamInner {
                segments,
                writer: None,
                next_sequence,
                total_bytes,
            }),
            appended: Notify::new(),
            metrics,
        })
    }

    /// Stream name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capacity limits.
    pub fn options(&self) -> StreamOptions {
        self.options
    }

    /// Append a payload and return the sequence number assigned to it.
    pub fn append(&self, payload: &[u8]) -> Result<u64> {
        let entry_len = ENTRY_HEADER_LEN + payload.len() as u64;
        let length = u32::try_from(payload.len()).ok().filter(|_| {
            entry_len <= self.options.segment_bytes
        });
        let Some(length) = length else {
            return Err(PersistenceError::PayloadTooLarge {
                size: payload.len(),
                limit: self.options.segment_bytes,
            });
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let sequence = inner.next_sequence;

        let roll = match inner.segments.back() {
            None => true,
            Some(active) => {
                !active.offsets.is_empty()
                    && active.bytes + entry_len > self.options.segment_bytes
            }
        };
        if roll {
            self.roll(inner, sequence)?;
        } else if inner.writer.is_none() {
            if let Some(active) = inner.segments.back() {
                inner.writer = Some(OpenOptions::new().append(true).open(&active.path)?);
            }
        }

        let mut entry = BytesMut::with_capacity(entry_len as usize);
        entry.put_u64(sequence);
        entry.put_u32(length);
        entry.put_slice(payload);

        let (Some(writer), Some(active)) = (inner.writer.as_mut(), inner.segments.back_mut())
        else {
            return Err(PersistenceError::Io(std::io::Error::other(
                "stream has no active segment",
            )));
        };
        if let Err(err) = writer.write_all(&entry) {
            let _ = writer.set_len(active.bytes);
            return Err(err.into());
        }
        active.offsets.push(active.bytes);
        active.bytes += entry_len;
        inner.total_bytes += entry_len;
        inner.next_sequence += 1;

        self.evict(inner)?;
        drop(guard);

        if let Some(metrics) = &self.metrics {
            metrics.record_appended(&self.name, entry_len);
        }
        self.appended.notify_waiters();
        Ok(sequence)
    }

    fn roll(&self, inner: &mut StreamInner, base: u64) -> Result<()> {
        if let Some(writer) = inner.writer.take() {
            writer.sync_data()?;
        }
        if let Some(active) = inner.segments.back() {
            if active.offsets.is_empty() {
                inner.writer = Some(OpenOptions::new().append(true).open(&active.path)?);
                return Ok(());
            }
        }
        let path = segment_path(&self.dir, base);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        debug!(stream = %self.name, base, "starting new segment");
        inner.writer = Some(file);
        inner.segments.push_back(Segment {
            base,
            path,
            offsets: Vec::new(),
            bytes: 0,
        });
        Ok(())
    }

    fn evict(&self, inner: &mut StreamInner) -> Result<()> {
        while inner.total_bytes > self.options.max_bytes && inner.segments.len() > 1 {
            let Some(segment) = inner.segments.pop_front() else {
                break;
            };
            fs::remove_file(&segment.path)?;
            inner.total_bytes -= segment.bytes;
            let evicted = segment.offsets.len() as u64;
            warn!(
                stream = %self.name,
                first = segment.base,
                last = segment.end().saturating_sub(1),
                new_oldest = inner.oldest(),
                "stream at capacity; oldest entries overwritten"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_evicted(&self.name, evicted);
            }
        }
        Ok(())
    }

    /// Read the payload stored at `sequence`.
    pub fn read(&self, sequence: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        if sequence >= inner.next_sequence {
            return Err(PersistenceError::NotYetAvailable {
                stream: self.name.clone(),
                requested: sequence,
                next: inner.next_sequence,
            });
        }
        let oldest = inner.oldest();
        if sequence < oldest {
            return Err(PersistenceError::Evicted {
                stream: self.name.clone(),
                requested: sequence,
                oldest,
            });
        }
        let index = inner
            .segments
            .partition_point(|segment| segment.end() <= sequence);
        let corrupt = |reason: String| PersistenceError::Corrupt {
            what: "segment",
            path: self.dir.display().to_string(),
            reason,
        };
        let segment = inner
            .segments
            .get(index)
            .ok_or_else(|| corrupt(format!("no segment holds sequence {sequence}")))?;
        let offset = segment.offsets[(sequence - segment.base) as usize];

        let mut file = File::open(&segment.path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; ENTRY_HEADER_LEN as usize];
        file.read_exact(&mut header)?;
        let mut cursor = &header[..];
        let stored = cursor.get_u64();
        let length = cursor.get_u32() as usize;
        if stored != sequence {
            return Err(corrupt(format!(
                "expected sequence {sequence} at offset {offset}, found {stored}"
            )));
        }
        let mut payload = vec![0u8; length];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Oldest retained sequence, `None` when the stream is empty.
    pub fn oldest_sequence(&self) -> Option<u64> {
        let inner = self.inner.lock();
        let oldest = inner.oldest();
        (oldest < inner.next_sequence).then_some(oldest)
    }

    /// Newest appended sequence, `None` when the stream is empty.
    pub fn newest_sequence(&self) -> Option<u64> {
        let inner = self.inner.lock();
        (inner.oldest() < inner.next_sequence).then(|| inner.next_sequence - 1)
    }

    /// Sequence the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.inner.lock().next_sequence
    }

    /// Bytes currently retained on disk.
    pub fn retained_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    /// Wait until something is appended or `timeout` elapses.
    pub async fn wait_for_append(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.appended.notified()).await;
    }

    /// Force appended data to stable storage.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.as_mut() {
            writer.flush()?;
            writer.sync_data()?;
        }
        Ok(())
    }
}

/// Opens and caches the streams that live under one root directory.
#[derive(Debug)]
pub struct StreamStore {
    root: PathBuf,
    options: StreamOptions,
    metrics: Option<PersistenceMetrics>,
    streams: Mutex<HashMap<String, Arc<LocalRecordStream>>>,
}

impl StreamStore {
    /// Create a store rooted at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        options: StreamOptions,
        metrics: Option<PersistenceMetrics>,
    ) -> Self {
        Self {
            root: root.into(),
            options,
            metrics,
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the named stream, creating it with the store's capacity if absent.
    pub fn open_stream(&self, name: &str) -> Result<Arc<LocalRecordStream>> {
        let mut streams = self.streams.lock();
        if let Some(stream) = streams.get(name) {
            return Ok(Arc::clone(stream));
        }
        let stream = Arc::new(LocalRecordStream::open(
            &self.root,
            name,
            self.options,
            self.metrics.clone(),
        )?);
        streams.insert(name.to_owned(), Arc::clone(&stream));
        Ok(stream)
    }

    /// Flush every opened stream.
    pub fn flush_all(&self) -> Result<()> {
        let streams: Vec<_> = self.streams.lock().values().cloned().collect();
        for stream in streams {
            stream.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn sequences_start_at_zero_and_increase() {
        let dir = tempdir().unwrap();
        let stream =
            LocalRecordStream::open(dir.path(), "local", StreamOptions::default(), None).unwrap();
        assert_eq!(stream.oldest_sequence(), None);
        assert_eq!(stream.newest_sequence(), None);
        assert_eq!(stream.append(b"a").unwrap(), 0);
        assert_eq!(stream.append(b"b").unwrap(), 1);
        assert_eq!(stream.read(1).unwrap(), b"b");
        assert_eq!(stream.oldest_sequence(), Some(0));
        assert_eq!(stream.newest_sequence(), Some(1));
    }

    #[test]
    fn reading_past_the_tail_is_not_yet_available() {
        let dir = tempdir().unwrap();
        let stream =
            LocalRecordStream::open(dir.path(), "local", StreamOptions::default(), None).unwrap();
        stream.append(b"a").unwrap();
        assert!(matches!(
            stream.read(1),
            Err(PersistenceError::NotYetAvailable { next: 1, .. })
        ));
    }

    #[test]
    fn capacity_overflow_evicts_whole_segments() {
        let dir = tempdir().unwrap();
        // 12-byte header + 8-byte payload = 20 bytes per entry, two per segment.
        let options = StreamOptions::new(60, 40);
        let stream = LocalRecordStream::open(dir.path(), "small", options, None).unwrap();
        for value in 0u64..6 {
            stream.append(&value.to_be_bytes()).unwrap();
        }
        let oldest = stream.oldest_sequence().unwrap();
        assert!(oldest >= 2, "oldest = {oldest}");
        assert!(stream.retained_bytes() <= 60);
        assert!(matches!(
            stream.read(0),
            Err(PersistenceError::Evicted { oldest: o, .. }) if o == oldest
        ));
        assert_eq!(stream.read(5).unwrap(), 5u64.to_be_bytes());
    }

    #[test]
    fn reopen_recovers_sequences_and_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let stream =
                LocalRecordStream::open(dir.path(), "local", StreamOptions::default(), None)
                    .unwrap();
            stream.append(b"first").unwrap();
            stream.append(b"second").unwrap();
            stream.flush().unwrap();
        }
        let segment = segment_path(&dir.path().join("local"), 0);
        let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(&[0, 0, 0, 0, 0, 0, 0, 2, 0, 0]).unwrap();
        drop(file);

        let stream =
            LocalRecordStream::open(dir.path(), "local", StreamOptions::default(), None).unwrap();
        assert_eq!(stream.next_sequence(), 2);
        assert_eq!(stream.append(b"third").unwrap(), 2);
        assert_eq!(stream.read(0).unwrap(), b"first");
        assert_eq!(stream.read(2).unwrap(), b"third");
    }

    #[test]
    fn oversized_payloads_are_rejected() {
        let dir = tempdir().unwrap();
        let stream =
            LocalRecordStream::open(dir.path(), "tiny", StreamOptions::new(64, 32), None).unwrap();
        assert!(matches!(
            stream.append(&[0u8; 64]),
            Err(PersistenceError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn stream_names_must_be_plain() {
        let dir = tempdir().unwrap();
        for name in ["", "..", "a/b", "with space"] {
            assert!(
                LocalRecordStream::open(dir.path(), name, StreamOptions::default(), None).is_err(),
                "{name:?} accepted"
            );
        }
    }

    #[test]
    fn store_caches_opened_streams() {
        let dir = tempdir().unwrap();
        let store = StreamStore::new(dir.path(), StreamOptions::default(), None);
        let a = store.open_stream("exports").unwrap();
        let b = store.open_stream("exports").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        a.append(b"x").unwrap();
        store.flush_all().unwrap();
    }

    #[tokio::test]
    async fn append_wakes_waiters() {
        let dir = tempdir().unwrap();
        let stream = Arc::new(
            LocalRecordStream::open(dir.path(), "local", StreamOptions::default(), None).unwrap(),
        );
        let writer = Arc::clone(&stream);
        let waiter = tokio::spawn(async move {
            stream.wait_for_append(Duration::from_secs(5)).await;
            stream.newest_sequence()
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.append(b"late").unwrap();
        assert_eq!(waiter.await.unwrap(), Some(0));
    }
}
