//! Whole-file checkpoint encoding (C10): one map of `tenant.module ->
//! store bytes` plus both stream offsets, versioned so an incompatible
//! format is refused rather than silently misread.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

const SNAPSHOT_VERSION: u8 = 1;

#[derive(Debug, Snafu)]
pub enum SnapshotError {
    #[snafu(display("failed to read snapshot {path}: {source}"))]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write snapshot {path}: {source}"))]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("snapshot {path} is not valid: {source}"))]
    Decode {
        path: String,
        source: serde_json::Error,
    },
    #[snafu(context(false))]
    Encode { source: serde_json::Error },
    #[snafu(display("snapshot version {found} is not supported (expected {expected})"))]
    VersionMismatch { expected: u8, found: u8 },
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDto {
    version: u8,
    source_stream_offset: u64,
    event_stream_offset: u64,
    stores: BTreeMap<String, Vec<u8>>,
}

/// The full engine checkpoint. `stores` is keyed by `tenant.module_name`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub source_stream_offset: u64,
    pub event_stream_offset: u64,
    pub stores: BTreeMap<String, Vec<u8>>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Snapshot::default()
    }

    /// Loads a snapshot from `path`. A missing file is a fresh start, not an
    /// error: both offsets are zero and every module binds a fresh store.
    pub fn load(path: &Path) -> Result<Snapshot, SnapshotError> {
        if !path.exists() {
            return Ok(Snapshot::empty());
        }
        let display = path.display().to_string();
        let bytes = std::fs::read(path).context(ReadSnafu {
            path: display.clone(),
        })?;
        let dto: SnapshotDto = serde_json::from_slice(&bytes).context(DecodeSnafu {
            path: display.clone(),
        })?;
        if dto.version != SNAPSHOT_VERSION {
            return VersionMismatchSnafu {
                expected: SNAPSHOT_VERSION,
                found: dto.version,
            }
            .fail();
        }
        Ok(Snapshot {
            source_stream_offset: dto.source_stream_offset,
            event_stream_offset: dto.event_stream_offset,
            stores: dto.stores,
        })
    }

    /// Writes the snapshot as a single file, via a temp-file-then-rename so
    /// a crash mid-write never leaves a truncated checkpoint in place.
    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let dto = SnapshotDto {
            version: SNAPSHOT_VERSION,
            source_stream_offset: self.source_stream_offset,
            event_stream_offset: self.event_stream_offset,
            stores: self.stores.clone(),
        };
        let bytes = serde_json::to_vec(&dto)?;
        let display = path.display().to_string();
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &bytes).context(WriteSnafu {
            path: display.clone(),
        })?;
        std::fs::rename(&tmp_path, path).context(WriteSnafu { path: display })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let snapshot = Snapshot::load(&dir.path().join("absent")).unwrap();
        assert_eq!(snapshot.source_stream_offset, 0);
        assert!(snapshot.stores.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.json");
        let mut stores = BTreeMap::new();
        stores.insert("acme.sshd".to_string(), vec![1, 2, 3]);
        let snapshot = Snapshot {
            source_stream_offset: 42,
            event_stream_offset: 7,
            stores,
        };
        snapshot.save(&path).unwrap();
        let loaded = Snapshot::load(&path).unwrap();
        assert_eq!(loaded.source_stream_offset, 42);
        assert_eq!(loaded.event_stream_offset, 7);
        assert_eq!(loaded.stores["acme.sshd"], vec![1, 2, 3]);
    }

    #[test]
    fn version_mismatch_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("snap.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 99,
                "source_stream_offset": 0,
                "event_stream_offset": 0,
                "stores": {}
            })
            .to_string(),
        )
        .unwrap();
        let err = Snapshot::load(&path).unwrap_err();
        assert!(matches!(err, SnapshotError::VersionMismatch { .. }));
    }
}
