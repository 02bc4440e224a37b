use parking_lot::RwLock;
use sled::{Db, Tree};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::types::Block;

/// Collection holding blocks keyed by big-endian index.
pub const BLOCKS_COLLECTION: &str = "blocks";
/// Collection holding contracts keyed by contract id.
pub const CONTRACTS_COLLECTION: &str = "contracts";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Store unavailable: {0}")]
    Unavailable(#[from] sled::Error),
    #[error("Data not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid block index: expected {expected}, got {found}")]
    IndexConflict { expected: u64, found: u64 },
    #[error("Block index {0} already taken")]
    IndexTaken(u64),
    #[error("Malformed block key: {0}")]
    MalformedKey(String),
}

/// Minimal CRUD surface of an external key-value store.
///
/// Records are addressed by `(namespace, collection, key)`. Implementations
/// must make `compare_and_swap` atomic per key; the block and contract stores
/// rely on it for index assignment and single execution.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, collection: &str, key: &[u8])
        -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, namespace: &str, collection: &str, key: &[u8], value: &[u8])
        -> Result<(), StorageError>;

    /// Replace the value at `key` with `new` only if it currently equals
    /// `expected` (`None` meaning absent). Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        namespace: &str,
        collection: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError>;

    /// Number of records in the collection. A collection that was never
    /// written counts as empty; backend failures are errors.
    fn count(&self, namespace: &str, collection: &str) -> Result<u64, StorageError>;

    /// Greatest key in the collection, `None` when it is empty.
    fn last_key(&self, namespace: &str, collection: &str)
        -> Result<Option<Vec<u8>>, StorageError>;
}

pub struct SledStorage {
    db: Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    /// Database removed on drop, for tests and throwaway nodes.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn tree(&self, namespace: &str, collection: &str) -> Result<Tree, StorageError> {
        Ok(self.db.open_tree(format!("{}/{}", namespace, collection))?)
    }

}

impl KeyValueStore for SledStorage {
    fn get(&self, namespace: &str, collection: &str, key: &[u8])
        -> Result<Option<Vec<u8>>, StorageError> {
        let encoded = self.tree(namespace, collection)?.get(key)?;
        Ok(encoded.map(|e| e.to_vec()))
    }

    fn put(&self, namespace: &str, collection: &str, key: &[u8], value: &[u8])
        -> Result<(), StorageError> {
        let tree = self.tree(namespace, collection)?;
        tree.insert(key, value)?;
        tree.flush()?;
        Ok(())
    }

    fn compare_and_swap(
        &self,
        namespace: &str,
        collection: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let tree = self.tree(namespace, collection)?;
        let swapped = tree.compare_and_swap(key, expected, Some(new))?.is_ok();
        if swapped {
            tree.flush()?;
        }
        Ok(swapped)
    }

    fn count(&self, namespace: &str, collection: &str) -> Result<u64, StorageError> {
        // Tree::len swallows iteration errors.
        let mut count = 0;
        for item in self.tree(namespace, collection)?.iter() {
            item?;
            count += 1;
        }
        Ok(count)
    }

    fn last_key(&self, namespace: &str, collection: &str)
        -> Result<Option<Vec<u8>>, StorageError> {
        let last = self.tree(namespace, collection)?.last()?;
        Ok(last.map(|(key, _)| key.to_vec()))
    }
}

/// In-process key-value store with the same semantics as [`SledStorage`].
#[derive(Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn collection_key(namespace: &str, collection: &str) -> String {
    format!("{}/{}", namespace, collection)
}

impl KeyValueStore for MemoryStorage {
    fn get(&self, namespace: &str, collection: &str, key: &[u8])
        -> Result<Option<Vec<u8>>, StorageError> {
        let collections = self.collections.read();
        Ok(collections
            .get(&collection_key(namespace, collection))
            .and_then(|records| records.get(key).cloned()))
    }

    fn put(&self, namespace: &str, collection: &str, key: &[u8], value: &[u8])
        -> Result<(), StorageError> {
        self.collections
            .write()
            .entry(collection_key(namespace, collection))
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn compare_and_swap(
        &self,
        namespace: &str,
        collection: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let mut collections = self.collections.write();
        let records = collections
            .entry(collection_key(namespace, collection))
            .or_default();
        if records.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        records.insert(key.to_vec(), new.to_vec());
        Ok(true)
    }

    fn count(&self, namespace: &str, collection: &str) -> Result<u64, StorageError> {
        let collections = self.collections.read();
        Ok(collections
            .get(&collection_key(namespace, collection))
            .map_or(0, |records| records.len() as u64))
    }

    fn last_key(&self, namespace: &str, collection: &str)
        -> Result<Option<Vec<u8>>, StorageError> {
        let collections = self.collections.read();
        Ok(collections
            .get(&collection_key(namespace, collection))
            .and_then(|records| records.keys().next_back().cloned()))
    }
}

/// Block persistence used by the ledger.
///
/// `append` is conditional: it only accepts the block whose index is
/// `len() + 1`, so concurrent writers cannot claim the same index or leave
/// gaps.
pub trait LedgerStore: Send + Sync {
    fn append(&self, block: &Block) -> Result<(), StorageError>;

    /// Block at the 1-based `index`, `NotFound` when out of range.
    fn get_by_index(&self, index: u64) -> Result<Block, StorageError>;

    fn len(&self) -> Result<u64, StorageError>;

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    /// All blocks in index order.
    fn blocks(&self) -> Result<Vec<Block>, StorageError> {
        (1..=self.len()?).map(|i| self.get_by_index(i)).collect()
    }
}

fn check_next_index(len: u64, block: &Block) -> Result<(), StorageError> {
    let expected = len + 1;
    if block.index != expected {
        return Err(StorageError::IndexConflict {
            expected,
            found: block.index,
        });
    }
    Ok(())
}

/// Blocks held in an append-only vector.
#[derive(Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<Vec<Block>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryBlockStore {
    fn append(&self, block: &Block) -> Result<(), StorageError> {
        let mut blocks = self.blocks.write();
        check_next_index(blocks.len() as u64, block)?;
        blocks.push(block.clone());
        Ok(())
    }

    fn get_by_index(&self, index: u64) -> Result<Block, StorageError> {
        let blocks = self.blocks.read();
        index
            .checked_sub(1)
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| blocks.get(i).cloned())
            .ok_or(StorageError::NotFound)
    }

    fn len(&self) -> Result<u64, StorageError> {
        Ok(self.blocks.read().len() as u64)
    }

    fn blocks(&self) -> Result<Vec<Block>, StorageError> {
        Ok(self.blocks.read().clone())
    }
}

/// Blocks stored in a [`KeyValueStore`] under `(namespace, "blocks", index)`.
pub struct KvBlockStore<K: KeyValueStore> {
    kv: Arc<K>,
    namespace: String,
}

impl<K: KeyValueStore> KvBlockStore<K> {
    pub fn new(kv: Arc<K>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
        }
    }

    fn key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn index_from_key(key: &[u8]) -> Result<u64, StorageError> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| StorageError::MalformedKey(hex::encode(key)))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl<K: KeyValueStore> LedgerStore for KvBlockStore<K> {
    fn append(&self, block: &Block) -> Result<(), StorageError> {
        check_next_index(self.len()?, block)?;
        let encoded = bincode::serialize(block)?;
        let inserted = self.kv.compare_and_swap(
            &self.namespace,
            BLOCKS_COLLECTION,
            &Self::key(block.index),
            None,
            &encoded,
        )?;
        if !inserted {
            return Err(StorageError::IndexTaken(block.index));
        }
        debug!(index = block.index, namespace = %self.namespace, "block persisted");
        Ok(())
    }

    fn get_by_index(&self, index: u64) -> Result<Block, StorageError> {
        let encoded = self
            .kv
            .get(&self.namespace, BLOCKS_COLLECTION, &Self::key(index))?
            .ok_or(StorageError::NotFound)?;
        Ok(bincode::deserialize(&encoded)?)
    }

    /// Keys are contiguous big-endian indices from 1, so the last key is the
    /// length.
    fn len(&self) -> Result<u64, StorageError> {
        match self.kv.last_key(&self.namespace, BLOCKS_COLLECTION)? {
            Some(key) => Self::index_from_key(&key),
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transaction;

    fn block(index: u64) -> Block {
        Block {
            index,
            timestamp: 1.5,
            transactions: vec![Transaction::new("A", "B", 1.0)],
            proof: index * 10,
            previous_hash: "0".to_string(),
        }
    }

    fn exercise_ledger_store(store: &dyn LedgerStore) {
        assert_eq!(store.len().unwrap(), 0);
        assert!(store.is_empty().unwrap());
        assert!(matches!(store.get_by_index(1), Err(StorageError::NotFound)));

        for i in 1..=3 {
            store.append(&block(i)).unwrap();
            assert_eq!(store.get_by_index(i).unwrap(), block(i));
        }
        assert_eq!(store.len().unwrap(), 3);
        assert!(matches!(store.get_by_index(0), Err(StorageError::NotFound)));
        assert!(matches!(store.get_by_index(4), Err(StorageError::NotFound)));

        let err = store.append(&block(3)).unwrap_err();
        assert!(matches!(err, StorageError::IndexConflict { expected: 4, found: 3 }));
        let err = store.append(&block(5)).unwrap_err();
        assert!(matches!(err, StorageError::IndexConflict { expected: 4, found: 5 }));

        let all = store.blocks().unwrap();
        assert_eq!(all.iter().map(|b| b.index).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_memory_block_store() {
        exercise_ledger_store(&MemoryBlockStore::new());
    }

    #[test]
    fn test_kv_block_store_over_memory() {
        exercise_ledger_store(&KvBlockStore::new(Arc::new(MemoryStorage::new()), "test"));
    }

    #[test]
    fn test_kv_block_store_over_sled() {
        let kv = Arc::new(SledStorage::temporary().unwrap());
        exercise_ledger_store(&KvBlockStore::new(kv, "test"));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let kv = Arc::new(MemoryStorage::new());
        let first = KvBlockStore::new(Arc::clone(&kv), "one");
        let second = KvBlockStore::new(Arc::clone(&kv), "two");
        first.append(&block(1)).unwrap();
        assert_eq!(first.len().unwrap(), 1);
        assert_eq!(second.len().unwrap(), 0);
    }

    #[test]
    fn test_kv_block_length_follows_last_key() {
        let kv = Arc::new(SledStorage::temporary().unwrap());
        let store = KvBlockStore::new(Arc::clone(&kv), "test");
        for i in 1..=300 {
            store.append(&block(i)).unwrap();
        }
        assert_eq!(store.len().unwrap(), 300);
        assert_eq!(kv.count("test", BLOCKS_COLLECTION).unwrap(), 300);
        assert_eq!(
            kv.last_key("test", BLOCKS_COLLECTION).unwrap(),
            Some(300u64.to_be_bytes().to_vec())
        );
    }

    #[test]
    fn test_malformed_block_key_is_an_error() {
        let kv = Arc::new(MemoryStorage::new());
        kv.put("test", BLOCKS_COLLECTION, b"bogus", b"x").unwrap();
        let store = KvBlockStore::new(kv, "test");
        assert!(matches!(store.len(), Err(StorageError::MalformedKey(_))));
    }

    #[test]
    fn test_compare_and_swap_semantics() {
        let stores: Vec<Box<dyn KeyValueStore>> = vec![
            Box::new(MemoryStorage::new()),
            Box::new(SledStorage::temporary().unwrap()),
        ];
        for kv in stores {
            assert_eq!(kv.count("ns", "c").unwrap(), 0);
            assert!(kv.compare_and_swap("ns", "c", b"k", None, b"v1").unwrap());
            assert!(!kv.compare_and_swap("ns", "c", b"k", None, b"v2").unwrap());
            assert!(!kv.compare_and_swap("ns", "c", b"k", Some(&b"zz"[..]), b"v2").unwrap());
            assert!(kv.compare_and_swap("ns", "c", b"k", Some(&b"v1"[..]), b"v2").unwrap());
            assert_eq!(kv.get("ns", "c", b"k").unwrap(), Some(b"v2".to_vec()));

            kv.put("ns", "c", b"other", b"x").unwrap();
            assert_eq!(kv.count("ns", "c").unwrap(), 2);
            assert_eq!(kv.last_key("ns", "c").unwrap(), Some(b"other".to_vec()));
            assert_eq!(kv.last_key("ns", "empty").unwrap(), None);
            assert_eq!(kv.get("ns", "missing", b"k").unwrap(), None);
        }
    }
}
