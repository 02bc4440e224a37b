pub mod config;
pub mod consensus;
pub mod contracts;
pub mod hash;
pub mod ledger;
pub mod runtime;
pub mod storage;
pub mod types;
