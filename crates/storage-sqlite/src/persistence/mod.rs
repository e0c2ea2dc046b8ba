//! Persistence adapters: opaque snapshot blobs keyed by partition name.

mod blob_store;
mod memory;

pub use blob_store::SqliteBlobStore;
pub use memory::MemoryBlobStore;

use localbase_core::errors::Result;

/// Block-oriented key/blob store used by the key-blob durability tier.
///
/// Partitions are independent; there is no cross-session lock, so two sessions
/// writing the same partition race and the last write wins.
pub trait PersistenceAdapter: Send + Sync {
    /// Returns the stored snapshot, or `None` when the partition was never saved.
    fn load(&self, partition: &str) -> Result<Option<Vec<u8>>>;

    fn save(&self, partition: &str, bytes: &[u8]) -> Result<()>;

    fn delete(&self, partition: &str) -> Result<()>;
}

/// `sha256:<hex>` checksum of a snapshot payload.
pub fn sha256_checksum(payload: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("sha256:{}", hex::encode(Sha256::digest(payload)))
}
