//! Conditional contract store.
//!
//! A contract is a set of `key -> expected value` conditions persisted in a
//! [`KeyValueStore`]. It is created once and moves from pending to executed
//! exactly once, when a caller supplies a context satisfying every
//! condition. Both transitions go through the store's compare-and-swap, so
//! concurrent callers cannot create a contract twice or execute it twice.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::{KeyValueStore, StorageError, CONTRACTS_COLLECTION};
use crate::types::Contract;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Contract encoding error: {0}")]
    EncodingError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Executed,
    AlreadyExecuted,
    ConditionsNotMet,
    NotFound,
}

impl fmt::Display for CreateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CreateOutcome::Created => "Contract created successfully",
            CreateOutcome::AlreadyExists => "Contract already exists",
        })
    }
}

impl fmt::Display for ExecuteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecuteOutcome::Executed => "Contract executed successfully",
            ExecuteOutcome::AlreadyExecuted => "Contract already executed",
            ExecuteOutcome::ConditionsNotMet => "Contract conditions not met",
            ExecuteOutcome::NotFound => "Contract not found",
        })
    }
}

pub struct ContractStore<K: KeyValueStore> {
    kv: Arc<K>,
    namespace: String,
}

impl<K: KeyValueStore> ContractStore<K> {
    pub fn new(kv: Arc<K>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
        }
    }

    pub fn create_contract(
        &self,
        contract_id: &str,
        conditions: BTreeMap<String, Value>,
    ) -> Result<CreateOutcome, ContractError> {
        let encoded = serde_json::to_vec(&Contract::new(conditions))?;
        let inserted = self.kv.compare_and_swap(
            &self.namespace,
            CONTRACTS_COLLECTION,
            contract_id.as_bytes(),
            None,
            &encoded,
        )?;
        if !inserted {
            debug!(contract_id, "Contract already exists");
            return Ok(CreateOutcome::AlreadyExists);
        }
        info!(contract_id, "Contract created");
        Ok(CreateOutcome::Created)
    }

    pub fn get_contract(&self, contract_id: &str) -> Result<Option<Contract>, ContractError> {
        let encoded = self
            .kv
            .get(&self.namespace, CONTRACTS_COLLECTION, contract_id.as_bytes())?;
        Ok(encoded.map(|e| serde_json::from_slice(&e)).transpose()?)
    }

    /// Execute the contract if every condition matches `context`.
    ///
    /// A mismatch leaves the contract untouched. The executed flag is written
    /// with a compare-and-swap against the bytes that were evaluated; losing
    /// that race re-reads the contract, which then reports `AlreadyExecuted`.
    pub fn execute_contract(
        &self,
        contract_id: &str,
        context: &BTreeMap<String, Value>,
    ) -> Result<ExecuteOutcome, ContractError> {
        loop {
            let current = match self.kv.get(
                &self.namespace,
                CONTRACTS_COLLECTION,
                contract_id.as_bytes(),
            )? {
                Some(bytes) => bytes,
                None => return Ok(ExecuteOutcome::NotFound),
            };
            let mut contract: Contract = serde_json::from_slice(&current)?;
            if contract.executed {
                return Ok(ExecuteOutcome::AlreadyExecuted);
            }
            if !contract.conditions_met(context) {
                debug!(contract_id, "Contract conditions not met");
                return Ok(ExecuteOutcome::ConditionsNotMet);
            }

            contract.executed = true;
            let updated = serde_json::to_vec(&contract)?;
            if self.kv.compare_and_swap(
                &self.namespace,
                CONTRACTS_COLLECTION,
                contract_id.as_bytes(),
                Some(current.as_slice()),
                &updated,
            )? {
                info!(contract_id, "Contract executed");
                return Ok(ExecuteOutcome::Executed);
            }
        }
    }

    pub fn len(&self) -> Result<u64, ContractError> {
        Ok(self.kv.count(&self.namespace, CONTRACTS_COLLECTION)?)
    }

    pub fn is_empty(&self) -> Result<bool, ContractError> {
        Ok(self.len()? == 0)
    }
}
