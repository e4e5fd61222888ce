use super::KeyValueCollection;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Map-backed collection for tests.
#[derive(Default)]
pub struct MemoryCollection {
    inner: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueCollection for MemoryCollection {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(key, "Memory PUT");
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
        debug!(key, "Memory REMOVE");
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_collection_get_put() {
        let collection = MemoryCollection::new();

        assert!(collection.get("key1").unwrap().is_none());

        collection.put("key1", b"123").unwrap();
        assert_eq!(collection.get("key1").unwrap(), Some(b"123".to_vec()));
        assert!(collection.get("key2").unwrap().is_none());
    }

    #[test]
    fn test_memory_collection_remove() {
        let collection = MemoryCollection::new();

        collection.put("key1", b"123").unwrap();
        collection.remove("key1").unwrap();
        assert!(collection.get("key1").unwrap().is_none());
        assert!(collection.entries().unwrap().is_empty());
    }
}
