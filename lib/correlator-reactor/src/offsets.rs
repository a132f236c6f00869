//! Where a reactor's delivered-offset bookkeeping lives. The contract is
//! intentionally small: load the last stored offset for a subscriber name,
//! store a new one. What backs it (file, stream-broker consumer group, ...)
//! is a deployment detail.

use std::collections::BTreeMap;
use std::path::PathBuf;

pub trait OffsetStore: Send {
    fn load(&self, subscriber: &str) -> Option<u64>;
    fn store(&mut self, subscriber: &str, offset: u64);
}

#[derive(Debug, Default)]
pub struct InMemoryOffsetStore {
    offsets: BTreeMap<String, u64>,
}

impl OffsetStore for InMemoryOffsetStore {
    fn load(&self, subscriber: &str) -> Option<u64> {
        self.offsets.get(subscriber).copied()
    }

    fn store(&mut self, subscriber: &str, offset: u64) {
        self.offsets.insert(subscriber.to_string(), offset);
    }
}

/// A reference offset store backed by one JSON file per subscriber under a
/// base directory. Every call to [`OffsetStore::store`] writes whole-file,
/// matching the checkpoint/offset durability model used elsewhere (C10).
pub struct JsonFileOffsetStore {
    base_dir: PathBuf,
}

impl JsonFileOffsetStore {
    pub fn new(base_dir: PathBuf) -> Self {
        JsonFileOffsetStore { base_dir }
    }

    fn path_for(&self, subscriber: &str) -> PathBuf {
        crate::default_offset_path(&self.base_dir, subscriber)
    }
}

impl OffsetStore for JsonFileOffsetStore {
    fn load(&self, subscriber: &str) -> Option<u64> {
        let bytes = std::fs::read(self.path_for(subscriber)).ok()?;
        serde_json::from_slice::<u64>(&bytes).ok()
    }

    fn store(&mut self, subscriber: &str, offset: u64) {
        let path = self.path_for(subscriber);
        if let Ok(bytes) = serde_json::to_vec(&offset) {
            if let Err(error) = std::fs::write(&path, bytes) {
                tracing::error!(%error, subscriber, "failed to persist reactor offset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn json_file_store_round_trips() {
        let dir = tempdir().unwrap();
        let mut store = JsonFileOffsetStore::new(dir.path().to_path_buf());
        assert_eq!(store.load("reactor-a"), None);
        store.store("reactor-a", 7);
        assert_eq!(store.load("reactor-a"), Some(7));
    }
}
