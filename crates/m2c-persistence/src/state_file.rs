//! ---
//! m2c_section: "03-persistence-logging"
//! m2c_subsection: "module"
//! m2c_type: "source"
//! m2c_scope: "code"
//! m2c_description: "Per-connection state file holding the last accepted definition."
//! m2c_version: "v0.1.0"
//! m2c_owner: "tbd"
//! ---
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use m2c_model::ConnectionDefinition;
use serde_json::Value;

use crate::atomic::write_atomic;
use crate::Result;

/// File name of the state file inside the connection directory.
pub const STATE_FILE_NAME: &str = "opc-da-config.json";
/// Key added next to the definition fields on every rewrite.
pub const LAST_UPDATE_KEY: &str = "_last-update-timestamp_";

/// Decoded state file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredConnection {
    /// The definition as last accepted by the control handler.
    pub definition: ConnectionDefinition,
    /// Wall-clock time of the rewrite, as stored.
    pub last_update: Option<String>,
}

/// Reads and atomically rewrites `{dir}/opc-da-config.json`.
#[derive(Debug, Clone)]
pub struct ConnectionStateStore {
    dir: PathBuf,
}

impl ConnectionStateStore {
    /// Store rooted at a connection directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the state file.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Full path of the state file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE_NAME)
    }

    /// Persist `definition` with a fresh `_last-update-timestamp_`.
    pub fn write(&self, definition: &ConnectionDefinition) -> Result<()> {
        let mut value = definition.to_value()?;
        if let Value::Object(map) = &mut value {
            map.insert(
                LAST_UPDATE_KEY.to_owned(),
                Value::String(Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            );
        }
        write_atomic(&self.path(), &serde_json::to_vec_pretty(&value)?)
    }

    /// Raw JSON contents, `None` when no state file exists.
    pub fn read_raw(&self) -> Result<Option<Value>> {
        match fs::read(self.path()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Decoded contents, `None` when no state file exists.
    pub fn read(&self) -> Result<Option<StoredConnection>> {
        let Some(value) = self.read_raw()? else {
            return Ok(None);
        };
        let last_update = value
            .get(LAST_UPDATE_KEY)
            .and_then(Value::as_str)
            .map(str::to_owned);
        let definition = ConnectionDefinition::from_value(value)?;
        Ok(Some(StoredConnection {
            definition,
            last_update,
        }))
    }

    /// Restore raw contents captured earlier with [`Self::read_raw`], or remove
    /// the file when there was none. Used to roll back a failed update.
    pub fn restore(&self, previous: Option<&Value>) -> Result<()> {
        match previous {
            Some(value) => write_atomic(&self.path(), &serde_json::to_vec_pretty(value)?),
            None => match fs::remove_file(self.path()) {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2c_model::ControlVerb;
    use serde_json::json;
    use tempfile::tempdir;

    fn definition() -> ConnectionDefinition {
        ConnectionDefinition::from_value(json!({
            "control": "start",
            "connectionName": "conn",
            "protocol": "opcda",
            "siteName": "site",
            "area": "area",
            "process": "process",
            "machineName": "machine",
            "opcDa": {
                "serverName": "Matrikon.OPC.Simulation.1",
                "machineIp": "127.0.0.1",
                "tags": ["Random.Int4"],
                "iterations": 1,
                "interval": 0.1
            }
        }))
        .unwrap()
    }

    #[test]
    fn write_then_read_carries_timestamp() {
        let dir = tempdir().unwrap();
        let store = ConnectionStateStore::new(dir.path().join("m2c2-conn"));
        assert!(store.read().unwrap().is_none());

        store.write(&definition().with_control(ControlVerb::Stop)).unwrap();
        let stored = store.read().unwrap().unwrap();
        assert_eq!(stored.definition.control, ControlVerb::Stop);
        assert!(stored.last_update.is_some());
        let raw = store.read_raw().unwrap().unwrap();
        assert_eq!(raw["control"], "stop");
    }

    #[test]
    fn restore_reverts_or_removes() {
        let dir = tempdir().unwrap();
        let store = ConnectionStateStore::new(dir.path());
        store.write(&definition()).unwrap();
        let before = store.read_raw().unwrap();
        store.write(&definition().with_control(ControlVerb::Stop)).unwrap();
        store.restore(before.as_ref()).unwrap();
        assert_eq!(store.read().unwrap().unwrap().definition.control, ControlVerb::Start);

        store.restore(None).unwrap();
        assert!(!store.path().exists());
    }
}
