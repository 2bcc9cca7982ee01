//! Optional snapshot of reliability statistics and budget spend.
//!
//! Nothing depends on a snapshot for correctness. Restoring one only spares
//! a restarted process from re-learning which providers are failing and
//! from forgetting what the current windows have already spent.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::budget::BudgetWindow;
use crate::registry::ProviderStats;

/// Current on-disk format.
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unsupported snapshot version {found} (expected {SNAPSHOT_VERSION})")]
    Version { found: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub version: u32,
    pub saved_at_ms: u64,
    pub providers: Vec<ProviderStats>,
    pub budget: Vec<BudgetWindow>,
}

/// What a restore actually applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub providers: usize,
    pub windows: usize,
}

impl EngineSnapshot {
    pub fn new(saved_at_ms: u64, providers: Vec<ProviderStats>, budget: Vec<BudgetWindow>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at_ms,
            providers,
            budget,
        }
    }

    /// Write as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a snapshot. A missing file is `Ok(None)`.
    pub fn load(path: &Path) -> Result<Option<Self>, SnapshotError> {
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        let snapshot: Self = serde_json::from_str(&json)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
            });
        }
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("engine.json");
        let mut stats = ProviderStats::new("solver");
        stats.attempts = 3;
        let snapshot = EngineSnapshot::new(42, vec![stats], vec![]);
        snapshot.save(&path).unwrap();

        let loaded = EngineSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(EngineSnapshot::load(&dir.path().join("nope.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            EngineSnapshot::load(&path),
            Err(SnapshotError::Decode(_))
        ));
    }

    #[test]
    fn test_version_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.json");
        let mut snapshot = EngineSnapshot::new(1, vec![], vec![]);
        snapshot.version = 99;
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();
        assert!(matches!(
            EngineSnapshot::load(&path),
            Err(SnapshotError::Version { found: 99 })
        ));
    }
}
