use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use localbase_core::errors::{Error, Result};

use super::PersistenceAdapter;

/// Process-local blob store.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    save_count: Arc<Mutex<usize>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.save_count.lock().map(|count| *count).unwrap_or(0)
    }

    pub fn contains(&self, partition: &str) -> bool {
        self.blobs
            .lock()
            .map(|blobs| blobs.contains_key(partition))
            .unwrap_or(false)
    }

    fn poisoned() -> Error {
        Error::persistence("Memory blob store lock is poisoned")
    }
}

impl PersistenceAdapter for MemoryBlobStore {
    fn load(&self, partition: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().map_err(|_| Self::poisoned())?;
        Ok(blobs.get(partition).cloned())
    }

    fn save(&self, partition: &str, bytes: &[u8]) -> Result<()> {
        {
            let mut blobs = self.blobs.lock().map_err(|_| Self::poisoned())?;
            blobs.insert(partition.to_string(), bytes.to_vec());
        }
        let mut count = self.save_count.lock().map_err(|_| Self::poisoned())?;
        *count += 1;
        Ok(())
    }

    fn delete(&self, partition: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().map_err(|_| Self::poisoned())?;
        blobs.remove(partition);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_blobs_per_partition() {
        let store = MemoryBlobStore::new();
        store.save("a", b"one").expect("save a");
        store.save("b", b"two").expect("save b");
        assert_eq!(store.load("a").expect("load a"), Some(b"one".to_vec()));
        assert_eq!(store.load("missing").expect("load missing"), None);
        store.delete("a").expect("delete a");
        assert!(!store.contains("a"));
        assert_eq!(store.save_count(), 2);
    }
}
