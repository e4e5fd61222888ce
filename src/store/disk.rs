use super::KeyValueCollection;
use anyhow::Result;
use fjall::PartitionHandle;
use tracing::debug;

/// A collection persisted in one fjall partition.
pub struct DiskCollection {
    partition: PartitionHandle,
}

impl DiskCollection {
    pub fn new(partition: PartitionHandle) -> Self {
        Self { partition }
    }
}

impl KeyValueCollection for DiskCollection {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.partition.get(key.as_bytes())?;
        if value.is_some() {
            debug!(key, "Store HIT");
        } else {
            debug!(key, "Store MISS");
        }
        Ok(value.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.partition.insert(key.as_bytes(), value)?;
        debug!(key, bytes = value.len(), "Store PUT");
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.partition.remove(key.as_bytes())?;
        debug!(key, "Store REMOVE");
        Ok(())
    }

    fn entries(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self.partition.iter() {
            let (key, value) = item?;
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fjall::PartitionCreateOptions;
    use tempfile::tempdir;

    fn open_collection(path: &std::path::Path) -> DiskCollection {
        let keyspace = fjall::Config::new(path).open().unwrap();
        let partition = keyspace
            .open_partition("test", PartitionCreateOptions::default())
            .unwrap();
        DiskCollection::new(partition)
    }

    #[test]
    fn test_disk_collection_get_put() {
        let dir = tempdir().unwrap();
        let collection = open_collection(dir.path());

        // Initially, collection is empty
        assert!(collection.get("key1").unwrap().is_none());

        collection.put("key1", b"123").unwrap();
        assert_eq!(collection.get("key1").unwrap(), Some(b"123".to_vec()));

        // Overwrite replaces the value
        collection.put("key1", b"456").unwrap();
        assert_eq!(collection.get("key1").unwrap(), Some(b"456".to_vec()));

        assert!(collection.get("key2").unwrap().is_none());
    }

    #[test]
    fn test_disk_collection_remove_and_entries() {
        let dir = tempdir().unwrap();
        let collection = open_collection(dir.path());

        collection.put("a", b"1").unwrap();
        collection.put("b", b"2").unwrap();
        collection.remove("a").unwrap();

        let entries = collection.entries().unwrap();
        assert_eq!(entries, vec![("b".to_string(), b"2".to_vec())]);
    }
}
