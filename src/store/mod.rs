pub mod disk;
#[cfg(test)]
pub(crate) mod memory;

use anyhow::{Context, Result};
use disk::DiskCollection;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};
use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

/// A named bucket of raw key/value pairs.
///
/// Values are opaque bytes; callers own the encoding. Operations are
/// synchronous and short, so they are safe to call from async code.
pub trait KeyValueCollection: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// A thread-safe key-value store that can hold multiple collections, backed
/// by a fjall keyspace with one partition per collection.
pub struct KeyValueStore {
    collections: RwLock<HashMap<String, Arc<dyn KeyValueCollection>>>,
    keyspace: Keyspace,
}

impl KeyValueStore {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create data directory: {}", path.display()))?;
        let keyspace = fjall::Config::new(path.join("cache"))
            .open()
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        debug!(path = %path.display(), "Opened key-value store");

        Ok(Self {
            collections: RwLock::new(HashMap::new()),
            keyspace,
        })
    }

    /// Returns the collection called `name`, creating it on first use.
    pub fn collection(&self, name: &str) -> Result<Arc<dyn KeyValueCollection>> {
        if let Some(existing) = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(Arc::clone(existing));
        }

        let mut collections = self
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = collections.get(name) {
            return Ok(Arc::clone(existing));
        }

        let partition = self
            .keyspace
            .open_partition(name, PartitionCreateOptions::default())
            .with_context(|| format!("Failed to open collection '{name}'"))?;
        let collection: Arc<dyn KeyValueCollection> = Arc::new(DiskCollection::new(partition));
        collections.insert(name.to_string(), Arc::clone(&collection));
        debug!(collection = name, "Created collection");
        Ok(collection)
    }

    /// Flushes the journal to disk.
    pub fn persist(&self) -> Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("Failed to persist store")
    }
}
