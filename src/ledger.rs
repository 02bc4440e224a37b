use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::consensus::ProofOfWork;
use crate::storage::{LedgerStore, StorageError};
use crate::types::{current_timestamp, Block, Transaction, GENESIS_PREVIOUS_HASH, GENESIS_PROOF};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Chain is empty")]
    EmptyChain,
    #[error("Block validation failed: {0}")]
    BlockValidation(String),
    #[error("Invalid transaction amount: {0}")]
    InvalidAmount(f64),
}

/// Exported view of the whole chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub chain: Vec<Block>,
    pub length: u64,
}

/// Chain growth on top of a [`LedgerStore`].
///
/// The ledger owns the pending pool. The pool lock is held from index
/// assignment until the append returns, and the pool is only drained after a
/// successful append, so a transaction lands in exactly one block.
pub struct Ledger<S: LedgerStore> {
    storage: Arc<S>,
    pending: Mutex<Vec<Transaction>>,
}

impl<S: LedgerStore> Ledger<S> {
    /// Open the ledger, creating the genesis block if the store is empty.
    pub fn new(storage: Arc<S>) -> Result<Self, LedgerError> {
        let ledger = Ledger {
            storage,
            pending: Mutex::new(Vec::new()),
        };
        ledger.initialize_chain()?;
        Ok(ledger)
    }

    fn initialize_chain(&self) -> Result<(), LedgerError> {
        let length = self.storage.len()?;
        if length > 0 {
            info!(length, "Chain already initialized");
            return Ok(());
        }
        let genesis = self.create_block(GENESIS_PROOF, GENESIS_PREVIOUS_HASH.to_string())?;
        info!(hash = %genesis.calculate_hash(), "Chain initialized with genesis block");
        Ok(())
    }

    /// Seal the pending transactions into block `len() + 1`.
    pub fn create_block(&self, proof: u64, previous_hash: String) -> Result<Block, LedgerError> {
        let mut pending = self.pending.lock();
        let block = Block {
            index: self.storage.len()? + 1,
            timestamp: current_timestamp(),
            transactions: pending.clone(),
            proof,
            previous_hash,
        };
        self.storage.append(&block)?;
        pending.clear();
        info!(
            index = block.index,
            transactions = block.transactions.len(),
            proof,
            "Block appended"
        );
        Ok(block)
    }

    /// Block at the current tip.
    pub fn get_previous_block(&self) -> Result<Block, LedgerError> {
        let length = self.storage.len()?;
        if length == 0 {
            return Err(LedgerError::EmptyChain);
        }
        Ok(self.storage.get_by_index(length)?)
    }

    pub fn get_block(&self, index: u64) -> Result<Block, LedgerError> {
        Ok(self.storage.get_by_index(index)?)
    }

    /// Queue a transaction and return the index of the block it will land in.
    ///
    /// Non-finite amounts are rejected: they have no JSON form and would hash
    /// as `null`.
    pub fn add_transaction(
        &self,
        sender: impl Into<String>,
        receiver: impl Into<String>,
        amount: f64,
    ) -> Result<u64, LedgerError> {
        if !amount.is_finite() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let mut pending = self.pending.lock();
        let next_index = self.storage.len()? + 1;
        let transaction = Transaction::new(sender, receiver, amount);
        debug!(
            sender = %transaction.sender,
            receiver = %transaction.receiver,
            amount,
            next_index,
            "Transaction queued"
        );
        pending.push(transaction);
        Ok(next_index)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.pending.lock().clone()
    }

    pub fn len(&self) -> Result<u64, LedgerError> {
        Ok(self.storage.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.storage.is_empty()?)
    }

    pub fn chain(&self) -> Result<ChainSnapshot, LedgerError> {
        let chain = self.storage.blocks()?;
        Ok(ChainSnapshot {
            length: chain.len() as u64,
            chain,
        })
    }

    /// Check genesis, index contiguity, hash linkage and every proof.
    pub fn validate_chain(&self, pow: &ProofOfWork) -> Result<(), LedgerError> {
        let chain = self.storage.blocks()?;
        let genesis = chain.first().ok_or(LedgerError::EmptyChain)?;
        if !genesis.is_genesis() || genesis.previous_hash != GENESIS_PREVIOUS_HASH {
            return Err(LedgerError::BlockValidation(
                "Invalid genesis block".to_string(),
            ));
        }
        for pair in chain.windows(2) {
            let (previous, block) = (&pair[0], &pair[1]);
            if block.index != previous.index + 1 {
                return Err(LedgerError::BlockValidation(format!(
                    "Invalid block index: expected {}, got {}",
                    previous.index + 1,
                    block.index
                )));
            }
            let expected_hash = previous.calculate_hash();
            if block.previous_hash != expected_hash {
                return Err(LedgerError::BlockValidation(format!(
                    "Invalid previous hash at block {}: expected {}, got {}",
                    block.index, expected_hash, block.previous_hash
                )));
            }
            if !pow.is_valid_proof(previous.proof, block.proof) {
                return Err(LedgerError::BlockValidation(format!(
                    "Invalid proof {} at block {}",
                    block.proof, block.index
                )));
            }
        }
        Ok(())
    }
}
