//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Durable local stream, checkpoints and per-connection state files."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Everything the edge runtime keeps on disk between restarts.
//!
//! * [`LocalRecordStream`]: bounded, segmented, append-only log of opaque
//!   payloads keyed by a monotonically increasing sequence number.
//! * [`CheckpointStore`]: `(stream, kind) -> sequence` table used by the
//!   publisher to resume without gaps.
//! * [`ConnectionStateStore`]: the last accepted connection definition.
//! * [`TimeCursorFile`]: the historian connector's last-read instant.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// A stored definition failed to decode or validate.
    #[error("stored definition is invalid: {0}")]
    Model(#[from] m2c_model::ModelError),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// A file exists but its contents cannot be decoded.
    #[error("corrupt {what} at {path}: {reason}")]
    Corrupt {
        /// Kind of file (`checkpoint store`, `segment`, ...).
        what: &'static str,
        /// Offending path.
        path: String,
        /// Decoder message.
        reason: String,
    },
    /// Stream names become directory names and must be plain.
    #[error("invalid stream name `{0}`")]
    InvalidStreamName(String),
    /// Payload larger than a whole segment.
    #[error("payload of {size} bytes exceeds the segment size of {limit} bytes")]
    PayloadTooLarge {
        /// Payload length.
        size: usize,
        /// Segment capacity.
        limit: u64,
    },
    /// The requested sequence has not been appended yet.
    #[error("sequence {requested} of stream {stream} is not yet available (next {next})")]
    NotYetAvailable {
        /// Stream name.
        stream: String,
        /// Requested sequence.
        requested: u64,
        /// Sequence the next append will receive.
        next: u64,
    },
    /// The requested sequence was overwritten by capacity pressure.
    #[error("sequence {requested} of stream {stream} was evicted (oldest {oldest})")]
    Evicted {
        /// Stream name.
        stream: String,
        /// Requested sequence.
        requested: u64,
        /// Oldest sequence still retained.
        oldest: u64,
    },
}

pub mod atomic;
pub mod checkpoint;
pub mod cursor;
pub mod metrics;
pub mod state_file;
pub mod stream;

pub use atomic::write_atomic;
pub use checkpoint::{CheckpointKind, CheckpointStore, CHECKPOINT_FILE_NAME};
pub use cursor::TimeCursorFile;
pub use metrics::PersistenceMetrics;
pub use state_file::{ConnectionStateStore, StoredConnection, LAST_UPDATE_KEY, STATE_FILE_NAME};
pub use stream::{LocalRecordStream, StreamOptions, StreamStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_errors_render_sequences() {
        let err = PersistenceError::Evicted {
            stream: "s".into(),
            requested: 3,
            oldest: 10,
        };
        assert_eq!(
            format!("{err}"),
            "sequence 3 of stream s was evicted (oldest 10)"
        );
    }
}
