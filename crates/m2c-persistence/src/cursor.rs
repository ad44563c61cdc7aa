//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Last-read instant of a historian-style connector."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::atomic::write_atomic;
use crate::{PersistenceError, Result};

/// Single RFC 3339 instant stored in a file and fsync'd on every update.
#[derive(Debug, Clone)]
pub struct TimeCursorFile {
    path: PathBuf,
}

impl TimeCursorFile {
    /// Cursor stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored instant, `None` when the cursor was never written.
    pub fn load(&self) -> Result<Option<DateTime<Utc>>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let instant = DateTime::parse_from_rfc3339(text.trim()).map_err(|err| {
            PersistenceError::Corrupt {
                what: "time cursor",
                path: self.path.display().to_string(),
                reason: err.to_string(),
            }
        })?;
        Ok(Some(instant.with_timezone(&Utc)))
    }

    /// Replace the stored instant.
    pub fn store(&self, instant: DateTime<Utc>) -> Result<()> {
        let text = instant.to_rfc3339_opts(SecondsFormat::Micros, true);
        write_atomic(&self.path, text.as_bytes())
    }

    /// Forget the cursor so the next read starts a fresh window.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
