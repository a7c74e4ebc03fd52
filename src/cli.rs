//! CLI implementation for roverctl
//!
//! Inspection and administration of the indexer's store. All commands
//! output pretty JSON. The daemon holds the database lock while running, so
//! these commands are meant for a stopped indexer.

use crate::config::parse_address;
use crate::records::{ContactRecord, TransactionRecord};
use crate::registry::Registry;
use crate::{Persistence, RocksStore};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Indexer store CLI tool
#[derive(Parser)]
#[command(name = "roverctl")]
#[command(about = "Inspect and administer the chain indexer store")]
pub struct Cli {
    /// Path to the RocksDB database directory
    #[arg(short, long, default_value = "./rover_db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Get the cursor of a network
    GetCursor {
        /// Chain ID
        network: u64,
    },
    /// Reposition the cursor of a network
    SetCursor {
        /// Chain ID
        network: u64,
        /// Block number
        number: u64,
        /// Block hash in hex (64 hex chars, with or without 0x prefix)
        hash: String,
    },
    /// Register an address (backfilled when the indexer next starts)
    Register {
        /// Ethereum address (hex, with or without 0x prefix)
        address: String,
    },
    /// List registered addresses
    ListRegistry,
    /// Get a persisted block by number
    GetBlock {
        /// Chain ID
        network: u64,
        /// Block number
        number: u64,
    },
    /// Get a persisted transaction
    GetTransaction {
        /// Transaction hash in hex (64 hex chars, with or without 0x prefix)
        hash: String,
    },
    /// Get the projection of a lock
    GetLock {
        /// Chain ID
        network: u64,
        /// Lock address (hex, with or without 0x prefix)
        address: String,
    },
    /// Set the email of a key holder
    SetContact {
        /// Lock address (hex, with or without 0x prefix)
        lock: String,
        /// Key holder address (hex, with or without 0x prefix)
        owner: String,
        /// Email address
        email: String,
    },
    /// List notifications sent for a lock
    ListDispatches {
        /// Lock address (hex, with or without 0x prefix)
        lock: String,
    },
}

/// Parse a hex string into a 32-byte hash (B256).
fn parse_hash(s: &str) -> Result<B256> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("Invalid hex hash: {}", s))?;
    if bytes.len() != 32 {
        anyhow::bail!("Hash must be 32 bytes (64 hex chars), got {} bytes", bytes.len());
    }
    Ok(B256::from_slice(&bytes))
}

fn transaction_json(tx: &TransactionRecord) -> Value {
    json!({
        "hash": format!("0x{:x}", tx.hash),
        "network": tx.network,
        "block_hash": format!("0x{:x}", tx.block_hash),
        "block_number": tx.block_number,
        "transaction_index": tx.transaction_index,
        "confirmations": tx.confirmations,
        "from": format!("0x{:x}", tx.from),
        "to": tx.to.map(|to| format!("0x{:x}", to)),
        "value": format!("0x{:x}", tx.value),
        "nonce": tx.nonce,
        "gas_price": format!("0x{:x}", tx.gas_price),
        "gas_limit": format!("0x{:x}", tx.gas_limit),
        "creates": tx.creates.map(|c| format!("0x{:x}", c)),
        "data": tx.data.as_ref().map(|d| format!("0x{}", hex::encode(d))),
    })
}

/// Execute a command against `store` and return its JSON output.
pub fn execute(store: Arc<dyn Persistence>, command: Commands) -> Result<Value> {
    let result = match command {
        Commands::GetCursor { network } => match store.get_cursor(network)? {
            Some(cursor) => json!({
                "network": network,
                "cursor": {
                    "number": cursor.number,
                    "hash": format!("0x{:x}", cursor.hash),
                }
            }),
            None => json!({ "network": network, "cursor": null }),
        },
        Commands::SetCursor {
            network,
            number,
            hash,
        } => {
            let hash = parse_hash(&hash)?;
            crate::cursor::ChainCursor::new(store).rewind(network, number, hash)?;
            json!({
                "status": "ok",
                "network": network,
                "cursor": { "number": number, "hash": format!("0x{:x}", hash) }
            })
        }
        Commands::Register { address } => {
            let addr = parse_address(&address)?;
            let registry = Registry::load(store)?;
            let inserted = registry.register(addr)?;
            json!({
                "status": "ok",
                "address": format!("0x{:x}", addr),
                "new": inserted,
            })
        }
        Commands::ListRegistry => {
            let entries: Vec<Value> = store
                .list_registry()?
                .into_iter()
                .map(|entry| {
                    json!({
                        "address": format!("0x{:x}", entry.address),
                        "added_at": entry.added_at,
                        "backfilled_through": entry.backfilled_through,
                    })
                })
                .collect();
            json!({ "count": entries.len(), "registry": entries })
        }
        Commands::GetBlock { network, number } => {
            let block = match store.get_block_hash(network, number)? {
                Some(hash) => store.get_block(hash)?,
                None => None,
            };
            match block {
                Some(block) => json!({
                    "network": network,
                    "block": {
                        "number": block.number,
                        "hash": format!("0x{:x}", block.hash),
                        "parent_hash": format!("0x{:x}", block.parent_hash),
                        "timestamp": block.timestamp,
                        "miner": format!("0x{:x}", block.miner),
                        "gas_limit": format!("0x{:x}", block.gas_limit),
                        "gas_used": format!("0x{:x}", block.gas_used),
                    }
                }),
                None => json!({ "network": network, "number": number, "block": null }),
            }
        }
        Commands::GetTransaction { hash } => {
            let hash = parse_hash(&hash)?;
            match store.get_transaction(hash)? {
                Some(tx) => json!({ "transaction": transaction_json(&tx) }),
                None => json!({ "hash": format!("0x{:x}", hash), "transaction": null }),
            }
        }
        Commands::GetLock { network, address } => {
            let addr = parse_address(&address)?;
            match store.get_lock(network, addr)? {
                Some(lock) => json!({
                    "address": format!("0x{:x}", addr),
                    "lock": {
                        "name": lock.name,
                        "owner": format!("0x{:x}", lock.owner),
                        "network": lock.network,
                        "as_of": lock.as_of,
                    }
                }),
                None => json!({ "address": format!("0x{:x}", addr), "lock": null }),
            }
        }
        Commands::SetContact { lock, owner, email } => {
            let contact = ContactRecord {
                lock_address: parse_address(&lock)?,
                owner: parse_address(&owner)?,
                email,
            };
            store.put_contact(&contact)?;
            json!({
                "status": "ok",
                "lock": format!("0x{:x}", contact.lock_address),
                "owner": format!("0x{:x}", contact.owner),
            })
        }
        Commands::ListDispatches { lock } => {
            let lock = parse_address(&lock)?;
            let dispatches: Vec<Value> = store
                .list_dispatches(lock)?
                .into_iter()
                .map(|d| {
                    json!({
                        "key_id": d.key_id,
                        "email": d.email,
                        "dispatched_at": d.dispatched_at,
                    })
                })
                .collect();
            json!({
                "lock": format!("0x{:x}", lock),
                "count": dispatches.len(),
                "dispatches": dispatches,
            })
        }
    };
    Ok(result)
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let store = RocksStore::open(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;

    let result = execute(Arc::new(store), cli.command)?;

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fixtures::{block_hash, block_record, create_test_store, tx_record};
    use alloy_primitives::address;

    #[test]
    fn test_cursor_commands() {
        let (store, _temp_dir) = create_test_store();
        let store: Arc<dyn Persistence> = Arc::new(store);

        let out = execute(store.clone(), Commands::GetCursor { network: 1 }).unwrap();
        assert!(out["cursor"].is_null());

        execute(
            store.clone(),
            Commands::SetCursor {
                network: 1,
                number: 42,
                hash: format!("0x{:x}", block_hash(42)),
            },
        )
        .unwrap();
        let out = execute(store, Commands::GetCursor { network: 1 }).unwrap();
        assert_eq!(out["cursor"]["number"], 42);
    }

    #[test]
    fn test_register_normalizes_address() {
        let (store, _temp_dir) = create_test_store();
        let store: Arc<dyn Persistence> = Arc::new(store);

        let out = execute(
            store.clone(),
            Commands::Register {
                address: "0x00000000000000000000000000000000000ABCDE".to_string(),
            },
        )
        .unwrap();
        assert_eq!(out["address"], "0x00000000000000000000000000000000000abcde");
        assert_eq!(out["new"], true);

        let out = execute(store, Commands::ListRegistry).unwrap();
        assert_eq!(out["count"], 1);
    }

    #[test]
    fn test_get_block_and_transaction() {
        let (store, _temp_dir) = create_test_store();
        let store: Arc<dyn Persistence> = Arc::new(store);
        store.upsert_block(&block_record(1, 7)).unwrap();
        let from = address!("0000000000000000000000000000000000000001");
        store.upsert_transaction(&tx_record(1, 7, 5, from, None)).unwrap();

        let out = execute(store.clone(), Commands::GetBlock { network: 1, number: 7 }).unwrap();
        assert_eq!(out["block"]["number"], 7);

        let out = execute(
            store,
            Commands::GetTransaction {
                hash: format!("0x{:x}", B256::repeat_byte(5)),
            },
        )
        .unwrap();
        assert_eq!(out["transaction"]["block_number"], 7);
        assert!(out["transaction"]["to"].is_null());
    }

    #[test]
    fn test_invalid_hash_is_rejected() {
        let (store, _temp_dir) = create_test_store();
        let result = execute(
            Arc::new(store),
            Commands::GetTransaction {
                hash: "0x1234".to_string(),
            },
        );
        assert!(result.is_err());
    }
}
