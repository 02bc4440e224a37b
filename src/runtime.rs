//! Boundary operations of a node.
//!
//! `Runtime` ties the ledger, the proof-of-work and the contract store
//! together and exposes the operations a transport layer would call.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ConfigError, NodeConfig};
use crate::consensus::{CancelToken, PowError, ProofOfWork, SearchBudget};
use crate::contracts::{ContractError, ContractStore, CreateOutcome, ExecuteOutcome};
use crate::ledger::{ChainSnapshot, Ledger, LedgerError};
use crate::storage::{
    KeyValueStore, KvBlockStore, LedgerStore, MemoryBlockStore, MemoryStorage, SledStorage,
    StorageError,
};
use crate::types::{Block, Contract};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Mining error: {0}")]
    PowError(#[from] PowError),
    #[error("Contract error: {0}")]
    ContractError(#[from] ContractError),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Mining task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

pub type MemoryRuntime = Runtime<MemoryBlockStore, MemoryStorage>;
pub type SledRuntime = Runtime<KvBlockStore<SledStorage>, SledStorage>;

pub struct Runtime<S: LedgerStore, K: KeyValueStore> {
    config: NodeConfig,
    pow: ProofOfWork,
    ledger: Ledger<S>,
    contracts: ContractStore<K>,
    // Held across read-tip, solve, hash and append.
    mining: Mutex<()>,
}

impl MemoryRuntime {
    pub fn in_memory(config: NodeConfig) -> Result<Self, RuntimeError> {
        Runtime::new(
            config,
            Arc::new(MemoryBlockStore::new()),
            Arc::new(MemoryStorage::new()),
        )
    }
}

impl SledRuntime {
    /// Open (or create) a node persisted in the sled database at `path`.
    pub fn open_sled(config: NodeConfig, path: impl AsRef<Path>) -> Result<Self, RuntimeError> {
        let kv = Arc::new(SledStorage::open(path)?);
        Self::with_sled(config, kv)
    }

    pub fn with_sled(config: NodeConfig, kv: Arc<SledStorage>) -> Result<Self, RuntimeError> {
        let blocks = Arc::new(KvBlockStore::new(Arc::clone(&kv), config.namespace.clone()));
        Runtime::new(config, blocks, kv)
    }
}

impl<S: LedgerStore, K: KeyValueStore> Runtime<S, K> {
    pub fn new(config: NodeConfig, blocks: Arc<S>, kv: Arc<K>) -> Result<Self, RuntimeError> {
        config.validate()?;
        let pow = ProofOfWork::new(config.difficulty);
        let ledger = Ledger::new(blocks)?;
        let contracts = ContractStore::new(kv, config.namespace.clone());
        info!(difficulty = config.difficulty, namespace = %config.namespace, "Runtime ready");
        Ok(Runtime {
            config,
            pow,
            ledger,
            contracts,
            mining: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger<S> {
        &self.ledger
    }

    pub fn contracts(&self) -> &ContractStore<K> {
        &self.contracts
    }

    /// Mine a block bounded by the configured mining timeout.
    pub fn mine_block(&self) -> Result<Block, RuntimeError> {
        self.mine_block_with(&self.config.search_budget())
    }

    /// Solve the proof for the current tip and append the next block.
    ///
    /// Transactions submitted while the search runs stay pending until the
    /// append, so they land in this block.
    pub fn mine_block_with(&self, budget: &SearchBudget) -> Result<Block, RuntimeError> {
        let _guard = self.mining.lock();
        let previous = self.ledger.get_previous_block()?;
        let proof = match self.pow.solve(previous.proof, budget) {
            Ok(proof) => proof,
            Err(e) => {
                warn!(tip = previous.index, error = %e, "Mining aborted");
                return Err(e.into());
            }
        };
        let previous_hash = previous.calculate_hash();
        Ok(self.ledger.create_block(proof, previous_hash)?)
    }

    pub fn add_transaction(
        &self,
        sender: &str,
        receiver: &str,
        amount: f64,
    ) -> Result<u64, RuntimeError> {
        Ok(self.ledger.add_transaction(sender, receiver, amount)?)
    }

    pub fn get_chain(&self) -> Result<ChainSnapshot, RuntimeError> {
        Ok(self.ledger.chain()?)
    }

    pub fn validate_chain(&self) -> Result<(), RuntimeError> {
        Ok(self.ledger.validate_chain(&self.pow)?)
    }

    pub fn create_contract(
        &self,
        contract_id: &str,
        conditions: BTreeMap<String, Value>,
    ) -> Result<CreateOutcome, RuntimeError> {
        Ok(self.contracts.create_contract(contract_id, conditions)?)
    }

    pub fn execute_contract(
        &self,
        contract_id: &str,
        context: &BTreeMap<String, Value>,
    ) -> Result<ExecuteOutcome, RuntimeError> {
        Ok(self.contracts.execute_contract(contract_id, context)?)
    }

    pub fn get_contract(&self, contract_id: &str) -> Result<Option<Contract>, RuntimeError> {
        Ok(self.contracts.get_contract(contract_id)?)
    }
}

impl<S, K> Runtime<S, K>
where
    S: LedgerStore + 'static,
    K: KeyValueStore + 'static,
{
    /// Run [`Runtime::mine_block`] on tokio's blocking pool.
    pub async fn mine_block_async(self: Arc<Self>) -> Result<Block, RuntimeError> {
        tokio::task::spawn_blocking(move || self.mine_block()).await?
    }

    /// Like [`Runtime::mine_block_async`], abortable through `token`.
    pub async fn mine_block_cancellable(
        self: Arc<Self>,
        token: CancelToken,
    ) -> Result<Block, RuntimeError> {
        tokio::task::spawn_blocking(move || {
            let budget = self.config.search_budget().with_cancel_token(token);
            self.mine_block_with(&budget)
        })
        .await?
    }
}
