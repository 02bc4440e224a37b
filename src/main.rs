use clap::Parser;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::error;
use tracing_subscriber::EnvFilter;

use proofchain::config::{NodeConfig, StorageBackend};
use proofchain::runtime::Runtime;
use proofchain::storage::{KeyValueStore, LedgerStore};

#[derive(Parser, Debug)]
#[command(name = "proofchain", about = "Proof-of-work ledger node with conditional contracts", version)]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Persist the chain in a sled database at this directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Leading zero hex digits required by the proof-of-work
    #[arg(long)]
    difficulty: Option<usize>,
    /// Abort a proof search after this many milliseconds
    #[arg(long)]
    mining_timeout_ms: Option<u64>,
}

const HELP: &str = "Available commands:
  mine
  tx <sender> <receiver> <amount>
  chain
  validate
  contract create <id> <conditions-json>
  contract exec <id> <context-json>
  help
  exit";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(path) = cli.data_dir {
        config.storage = StorageBackend::Sled { path };
    }
    if let Some(difficulty) = cli.difficulty {
        config.difficulty = difficulty;
    }
    if let Some(timeout) = cli.mining_timeout_ms {
        config.mining_timeout_ms = Some(timeout);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .with_target(false)
        .init();

    match config.storage.clone() {
        StorageBackend::Memory => run(Arc::new(Runtime::in_memory(config)?)).await,
        StorageBackend::Sled { path } => run(Arc::new(Runtime::open_sled(config, path)?)).await,
    }
}

async fn run<S, K>(runtime: Arc<Runtime<S, K>>) -> Result<(), Box<dyn std::error::Error>>
where
    S: LedgerStore + 'static,
    K: KeyValueStore + 'static,
{
    println!("Node is running. Type 'help' for commands.");
    let mut stdout = io::stdout();
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let words: Vec<&str> = line.split_whitespace().collect();

        match words.as_slice() {
            [] => continue,
            ["exit"] => break,
            ["help"] => println!("{}", HELP),
            ["mine"] => match Arc::clone(&runtime).mine_block_async().await {
                Ok(block) => {
                    println!("New block mined successfully!");
                    println!("{}", serde_json::to_string_pretty(&block.to_json())?);
                }
                Err(e) => error!("Failed to mine block: {}", e),
            },
            ["tx", sender, receiver, amount] => match amount.parse::<f64>() {
                Ok(amount) if !amount.is_finite() => println!("Amount must be a finite number"),
                Ok(amount) => match runtime.add_transaction(sender, receiver, amount) {
                    Ok(index) => println!("Transaction added to block {}", index),
                    Err(e) => error!("Failed to add transaction: {}", e),
                },
                Err(_) => println!("Invalid amount: {}", amount),
            },
            ["chain"] => match runtime.get_chain() {
                Ok(snapshot) => {
                    let chain: Vec<Value> = snapshot.chain.iter().map(|b| b.to_json()).collect();
                    let export = serde_json::json!({ "chain": chain, "length": snapshot.length });
                    println!("{}", serde_json::to_string_pretty(&export)?);
                }
                Err(e) => error!("Failed to read chain: {}", e),
            },
            ["validate"] => match runtime.validate_chain() {
                Ok(()) => println!("Chain is valid"),
                Err(e) => println!("Chain is invalid: {}", e),
            },
            ["contract", "create", id, rest @ ..] => match parse_object(&rest.join(" ")) {
                Some(conditions) => match runtime.create_contract(id, conditions) {
                    Ok(outcome) => println!("{}", outcome),
                    Err(e) => error!("Failed to create contract: {}", e),
                },
                None => println!("Conditions must be a JSON object"),
            },
            ["contract", "exec", id, rest @ ..] => match parse_object(&rest.join(" ")) {
                Some(context) => match runtime.execute_contract(id, &context) {
                    Ok(outcome) => println!("{}", outcome),
                    Err(e) => error!("Failed to execute contract: {}", e),
                },
                None => println!("Context must be a JSON object"),
            },
            _ => println!("Unknown command: {}", line.trim()),
        }
    }

    println!("Exiting node.");
    Ok(())
}

fn parse_object(text: &str) -> Option<BTreeMap<String, Value>> {
    let text = if text.trim().is_empty() { "{}" } else { text };
    serde_json::from_str(text).ok()
}
