use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proofchain::config::NodeConfig;
use proofchain::consensus::{CancelToken, PowError};
use proofchain::contracts::{ContractError, ContractStore, ExecuteOutcome};
use proofchain::ledger::{Ledger, LedgerError};
use proofchain::runtime::{Runtime, RuntimeError};
use proofchain::storage::{
    KeyValueStore, KvBlockStore, LedgerStore, MemoryStorage, SledStorage, StorageError,
};

fn config(difficulty: usize) -> NodeConfig {
    NodeConfig {
        difficulty,
        ..NodeConfig::default()
    }
}

#[tokio::test]
async fn concurrent_mining_assigns_contiguous_indices() {
    let runtime = Arc::new(Runtime::in_memory(config(2)).unwrap());
    let start = runtime.get_chain().unwrap().length;

    let tasks: Vec<_> = (0..8)
        .map(|_| tokio::spawn(Arc::clone(&runtime).mine_block_async()))
        .collect();
    let mut indices = Vec::new();
    for task in tasks {
        indices.push(task.await.unwrap().unwrap().index);
    }
    indices.sort_unstable();

    let expected: Vec<u64> = (start + 1..=start + 8).collect();
    assert_eq!(indices, expected);
    assert_eq!(runtime.get_chain().unwrap().length, start + 8);
    runtime.validate_chain().unwrap();
}

#[tokio::test]
async fn cancelled_mining_leaves_chain_untouched() {
    let runtime = Arc::new(Runtime::in_memory(config(64)).unwrap());
    let token = CancelToken::new();
    let task = tokio::spawn(Arc::clone(&runtime).mine_block_cancellable(token.clone()));
    token.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, RuntimeError::PowError(PowError::Cancelled(_))));
    assert_eq!(runtime.get_chain().unwrap().length, 1);
}

#[test]
fn transactions_submitted_during_mining_are_never_lost_or_duplicated() {
    let runtime = Arc::new(Runtime::in_memory(config(2)).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let miner = {
        let runtime = Arc::clone(&runtime);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::SeqCst) {
                runtime.mine_block().unwrap();
            }
        })
    };
    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let runtime = Arc::clone(&runtime);
            thread::spawn(move || {
                for i in 0..50 {
                    runtime
                        .add_transaction(&format!("s{}", t), &format!("r{}", i), f64::from(i))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in submitters {
        handle.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    miner.join().unwrap();
    runtime.mine_block().unwrap();

    let chain = runtime.get_chain().unwrap().chain;
    let mut seen = HashSet::new();
    for block in &chain {
        for tx in &block.transactions {
            assert!(seen.insert((tx.sender.clone(), tx.receiver.clone())));
        }
    }
    assert_eq!(seen.len(), 200);

    // Per-submitter order is preserved across blocks.
    for t in 0..4 {
        let sender = format!("s{}", t);
        let amounts: Vec<f64> = chain
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter(|tx| tx.sender == sender)
            .map(|tx| tx.amount)
            .collect();
        let expected: Vec<f64> = (0..50).map(f64::from).collect();
        assert_eq!(amounts, expected);
    }
    assert!(runtime.ledger().pending_transactions().is_empty());
}

#[test]
fn sled_node_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("db");

    let (genesis, mined) = {
        let runtime = Runtime::open_sled(config(2), &path).unwrap();
        runtime.add_transaction("A", "B", 10.0).unwrap();
        let mined = runtime.mine_block().unwrap();
        let mut conditions = BTreeMap::new();
        conditions.insert("status".to_string(), json!("paid"));
        runtime.create_contract("c1", conditions).unwrap();
        (runtime.ledger().get_block(1).unwrap(), mined)
    };

    let runtime = Runtime::open_sled(config(2), &path).unwrap();
    let snapshot = runtime.get_chain().unwrap();
    assert_eq!(snapshot.length, 2);
    assert_eq!(snapshot.chain, vec![genesis, mined]);
    runtime.validate_chain().unwrap();

    let mut context = BTreeMap::new();
    context.insert("status".to_string(), json!("paid"));
    assert_eq!(
        runtime.execute_contract("c1", &context).unwrap(),
        ExecuteOutcome::Executed
    );
    assert_eq!(runtime.mine_block().unwrap().index, 3);
}

fn unreachable() -> StorageError {
    StorageError::Unavailable(sled::Error::Unsupported("connection refused".to_string()))
}

/// Key-value store whose introspection calls are unreachable.
struct UnreachableIntrospection(MemoryStorage);

impl KeyValueStore for UnreachableIntrospection {
    fn get(&self, namespace: &str, collection: &str, key: &[u8])
        -> Result<Option<Vec<u8>>, StorageError> {
        self.0.get(namespace, collection, key)
    }

    fn put(&self, namespace: &str, collection: &str, key: &[u8], value: &[u8])
        -> Result<(), StorageError> {
        self.0.put(namespace, collection, key, value)
    }

    fn compare_and_swap(
        &self,
        namespace: &str,
        collection: &str,
        key: &[u8],
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        self.0.compare_and_swap(namespace, collection, key, expected, new)
    }

    fn count(&self, _namespace: &str, _collection: &str) -> Result<u64, StorageError> {
        Err(unreachable())
    }

    fn last_key(&self, _namespace: &str, _collection: &str)
        -> Result<Option<Vec<u8>>, StorageError> {
        Err(unreachable())
    }
}

#[test]
fn unreachable_store_is_not_treated_as_empty() {
    let kv = Arc::new(UnreachableIntrospection(MemoryStorage::new()));
    let store = Arc::new(KvBlockStore::new(Arc::clone(&kv), "chain"));
    assert!(matches!(store.len(), Err(StorageError::Unavailable(_))));
    let result = Ledger::new(store);
    assert!(matches!(
        result,
        Err(LedgerError::StorageError(StorageError::Unavailable(_)))
    ));

    let contracts = ContractStore::new(kv, "chain");
    assert!(matches!(
        contracts.len(),
        Err(ContractError::StorageError(StorageError::Unavailable(_)))
    ));
}

#[test]
fn shared_sled_database_keeps_blocks_and_contracts_apart() {
    let kv = Arc::new(SledStorage::temporary().unwrap());
    let runtime = Runtime::with_sled(config(1), Arc::clone(&kv)).unwrap();
    runtime.create_contract("c1", BTreeMap::new()).unwrap();
    runtime.mine_block().unwrap();

    assert_eq!(runtime.get_chain().unwrap().length, 2);
    assert_eq!(runtime.contracts().len().unwrap(), 1);
    assert_eq!(kv.count("proofchain", "blocks").unwrap(), 2);
    assert_eq!(kv.count("proofchain", "contracts").unwrap(), 1);
}
