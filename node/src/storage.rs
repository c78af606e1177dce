//! # Snapshots
//!
//! The node keeps all state in memory and persists it as a single JSON
//! document (`escrows.json` in the data directory) on shutdown. On start the
//! snapshot, when present, is loaded back into a registry and a ledger.
//!
//! Writes go to a temporary sibling file first and are renamed into place,
//! so a crash mid-write leaves the previous snapshot intact.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use covenant_contracts::{Escrow, EscrowRegistry};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::ledger::{Ledger, LedgerSnapshot};

/// File name of the snapshot inside the data directory.
pub const SNAPSHOT_FILE_NAME: &str = "escrows.json";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Errors that can occur while reading or writing a snapshot.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("snapshot I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },

    /// The records do not form a valid registry.
    #[error("snapshot is inconsistent: {0}")]
    Corrupt(String),
}

/// Everything the node needs to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub escrows: Vec<Escrow>,
    pub ledger: LedgerSnapshot,
}

impl Snapshot {
    /// Captures the current registry and ledger.
    pub fn capture(registry: &EscrowRegistry, ledger: &Ledger) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            escrows: registry.records(),
            ledger: ledger.snapshot(),
        }
    }

    /// Splits the snapshot back into a registry and a ledger.
    pub fn restore(self) -> Result<(EscrowRegistry, Ledger), StorageError> {
        let registry = EscrowRegistry::from_records(self.escrows)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok((registry, Ledger::from_snapshot(self.ledger)))
    }
}

/// Writes `snapshot` to `path`, replacing any previous file.
pub fn save(path: &Path, snapshot: &Snapshot) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");

    fs::write(&tmp, json).map_err(|source| StorageError::Io {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    info!(
        path = %path.display(),
        escrows = snapshot.escrows.len(),
        "snapshot saved"
    );
    Ok(())
}

/// Reads the snapshot at `path`. Returns `Ok(None)` if no file exists.
pub fn load(path: &Path) -> Result<Option<Snapshot>, StorageError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StorageError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(StorageError::Version {
            found: snapshot.version,
            expected: SNAPSHOT_VERSION,
        });
    }

    info!(
        path = %path.display(),
        escrows = snapshot.escrows.len(),
        saved_at = %snapshot.saved_at,
        "snapshot loaded"
    );
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use covenant_contracts::events::NoopSink;
    use covenant_contracts::{EscrowConfig, EscrowEngine, EscrowState, PartyId, SystemClock};
    use std::sync::Arc;
    use std::time::Duration;

    fn populated() -> (EscrowEngine, Arc<Ledger>) {
        let ledger = Arc::new(Ledger::new());
        let engine = EscrowEngine::new(
            EscrowConfig::default(),
            Arc::new(SystemClock::new()),
            ledger.clone(),
            Arc::new(NoopSink),
        );

        let buyer = PartyId::new("alice");
        ledger.credit(&buyer, 500).unwrap();
        for amount in [100, 200] {
            ledger.deposit(&buyer, amount).unwrap();
            engine
                .create_escrow(
                    &buyer,
                    "bob".into(),
                    Duration::from_secs(3600),
                    "parts",
                    amount,
                )
                .unwrap();
        }
        engine.confirm_delivery(&buyer, 0).unwrap();
        (engine, ledger)
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join(SNAPSHOT_FILE_NAME)).unwrap().is_none());
    }

    #[test]
    fn save_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        let (engine, ledger) = populated();

        save(&path, &Snapshot::capture(engine.registry(), &ledger)).unwrap();
        let (registry, restored) = load(&path).unwrap().unwrap().restore().unwrap();

        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get(0).unwrap().state(), EscrowState::Complete);
        assert_eq!(registry.get(1).unwrap(), engine.escrow(1).unwrap());
        assert_eq!(restored.balance(&"alice".into()), 200);
        assert_eq!(restored.balance(&"bob".into()), 100);
        assert_eq!(restored.vault_balance(), 200);
        assert!(!dir.path().join("escrows.json.tmp").exists());
    }

    #[test]
    fn restored_registry_continues_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        let (engine, ledger) = populated();
        save(&path, &Snapshot::capture(engine.registry(), &ledger)).unwrap();

        let (registry, _) = load(&path).unwrap().unwrap().restore().unwrap();
        assert_eq!(registry.allocate(), 2);
    }

    #[test]
    fn garbage_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(load(&path), Err(StorageError::Serde(_))));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        let (engine, ledger) = populated();
        let mut snapshot = Snapshot::capture(engine.registry(), &ledger);
        snapshot.version = 99;
        save(&path, &snapshot).unwrap();

        assert!(matches!(
            load(&path),
            Err(StorageError::Version { found: 99, .. })
        ));
    }
}
