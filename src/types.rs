//! Core type definitions for the ledger.
//!
//! This module contains the data structures shared by the ledger, the
//! block stores and the contract store: blocks, transactions and contracts.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::hash::{canonical_json, sha256_hex};

/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Proof recorded in the genesis block.
pub const GENESIS_PROOF: u64 = 1;

/// A block in the chain.
///
/// Blocks are immutable once appended. `previous_hash` is the hex digest of
/// the previous block's canonical form, or [`GENESIS_PREVIOUS_HASH`] for
/// index 1.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Block {
    /// 1-based position in the chain
    pub index: u64,
    /// Unix time in seconds (fractional) at creation
    pub timestamp: f64,
    /// Transactions buffered since the prior block, in submission order
    pub transactions: Vec<Transaction>,
    /// Proof-of-work solution relative to the previous block's proof
    pub proof: u64,
    /// Digest of the previous block
    pub previous_hash: String,
}

/// A value transfer record. No balance or identity checks are applied.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: f64,
}

/// A conditional contract as persisted by the contract store.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub conditions: BTreeMap<String, Value>,
    pub executed: bool,
}

impl Transaction {
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, amount: f64) -> Self {
        Self {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
        }
    }
}

impl Block {
    /// External representation used both for export and for hashing.
    pub fn to_json(&self) -> Value {
        json!({
            "index": self.index,
            "timestamp": self.timestamp,
            "transactions": self.transactions,
            "proof": self.proof,
            "previous_hash": self.previous_hash,
        })
    }

    /// Calculate the SHA-256 digest of the block's canonical form.
    ///
    /// Every field takes part, including transaction order, so any change to
    /// the block changes the digest.
    pub fn calculate_hash(&self) -> String {
        sha256_hex(canonical_json(&self.to_json()))
    }

    /// True for the block at index 1.
    pub fn is_genesis(&self) -> bool {
        self.index == 1
    }
}

impl Contract {
    pub fn new(conditions: BTreeMap<String, Value>) -> Self {
        Self {
            conditions,
            executed: false,
        }
    }

    /// All conditions must be present in `context` with an equal value.
    pub fn conditions_met(&self, context: &BTreeMap<String, Value>) -> bool {
        self.conditions.iter().all(|(key, expected)| {
            context
                .get(key)
                .map_or(false, |actual| values_match(expected, actual))
        })
    }
}

/// JSON equality where numbers compare by value, so `1` matches `1.0`.
pub fn values_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (a.as_u64(), b.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            },
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_match(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).map_or(false, |other| values_match(v, other)))
        }
        _ => expected == actual,
    }
}

/// Current Unix time in fractional seconds.
pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}
