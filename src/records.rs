//! Record types for indexed chain data
//!
//! These structs represent the data stored in the persistence layer.
//! They use postcard for binary serialization, which is compact and deterministic.

use crate::types::{Block, Transaction};
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Last fully processed block of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRecord {
    /// Chain ID
    pub network: u64,
    /// Number of the last processed block
    pub number: u64,
    /// Hash of the last processed block
    pub hash: B256,
}

/// Persisted block. Immutable once written; keyed by hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
    /// Unix epoch seconds
    pub timestamp: u64,
    pub nonce: u64,
    pub difficulty: U256,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub miner: Address,
    pub extra_data: Vec<u8>,
    /// Chain ID
    pub network: u64,
}

impl BlockRecord {
    /// Build a record from an RPC block.
    pub fn from_rpc(block: &Block, network: u64) -> Self {
        Self {
            hash: block.hash,
            parent_hash: block.parent_hash,
            number: block.number,
            timestamp: block.timestamp,
            nonce: block.nonce.unwrap_or_default(),
            difficulty: block.difficulty.unwrap_or(U256::ZERO),
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            miner: block.miner,
            extra_data: block.extra_data.clone(),
            network,
        }
    }
}

/// Persisted transaction. Keyed by hash; only `confirmations` changes after
/// the first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: B256,
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_index: u64,
    /// Number of blocks on top of (and including) the containing block when
    /// the chain was last read
    pub confirmations: u64,
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub nonce: Option<u64>,
    pub data: Option<Vec<u8>>,
    pub gas_price: U256,
    pub gas_limit: U256,
    pub r: U256,
    pub s: U256,
    pub v: u64,
    pub creates: Option<Address>,
    pub raw: Option<Vec<u8>>,
    /// Chain ID
    pub network: u64,
}

impl TransactionRecord {
    /// Build a record from a mined RPC transaction.
    ///
    /// Returns `None` for transactions that are still pending. `tip` is the
    /// chain height used to compute confirmations.
    pub fn from_rpc(tx: &Transaction, network: u64, tip: u64) -> Option<Self> {
        let block_hash = tx.block_hash?;
        let block_number = tx.block_number?;
        Some(Self {
            hash: tx.hash,
            block_hash,
            block_number,
            transaction_index: tx.transaction_index.unwrap_or_default(),
            confirmations: confirmations_at(block_number, tip),
            from: tx.from,
            to: tx.to,
            value: tx.value,
            nonce: tx.nonce,
            data: if tx.input.is_empty() {
                None
            } else {
                Some(tx.input.clone())
            },
            gas_price: tx.gas_price.unwrap_or(U256::ZERO),
            gas_limit: tx.gas,
            r: tx.r,
            s: tx.s,
            v: tx.v.unwrap_or_default(),
            creates: tx.creates,
            raw: tx.raw.clone(),
            network,
        })
    }

    /// Whether the transaction was sent by, or addressed to, `addr`.
    pub fn touches(&self, addr: Address) -> bool {
        self.from == addr || self.to == Some(addr)
    }
}

/// Confirmations for a block at `block_number` when the chain tip is `tip`.
pub fn confirmations_at(block_number: u64, tip: u64) -> u64 {
    tip.saturating_sub(block_number).saturating_add(1)
}

/// An address the indexer watches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub address: Address,
    /// Unix epoch seconds
    pub added_at: u64,
    /// Highest block covered by a completed backfill, per chain ID
    pub backfilled_through: BTreeMap<u64, u64>,
}

/// Ownership projection of a lock contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub address: Address,
    pub name: String,
    pub owner: Address,
    /// Chain ID
    pub network: u64,
    /// Unix epoch seconds at which the owner was read from the chain
    pub as_of: u64,
}

/// A membership key, as reported by the keys index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub lock_address: Address,
    pub token_id: U256,
    /// Key holder
    pub owner: Address,
    /// Unix epoch seconds
    pub expiration: u64,
    /// Chain ID
    pub network: u64,
    /// Version of the lock contract the key belongs to
    pub lock_version: u64,
    /// ERC20 currency of the lock; None for native currency
    pub currency: Option<Address>,
}

impl Key {
    /// Identifier of the key across the index, `<lock>-<tokenId>`.
    pub fn id(&self) -> String {
        format!("0x{:x}-{}", self.lock_address, self.token_id)
    }
}

/// Idempotency record for a notification sent to a key holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub lock_address: Address,
    pub key_id: String,
    pub email: String,
    /// Unix epoch seconds
    pub dispatched_at: u64,
}

/// Email contact of a key holder for a given lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub lock_address: Address,
    pub owner: Address,
    pub email: String,
}

/// Normalize an email address for uniqueness checks.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
