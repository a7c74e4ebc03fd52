//! JSON-RPC client for Ethereum nodes
//!
//! Provides a typed interface to Ethereum JSON-RPC endpoints.
//! Every call races a timeout so an unresponsive node surfaces an error
//! instead of stalling the caller.

use crate::error::RpcError;
use crate::types::{Block, Log, Transaction};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// `owner()` selector.
const OWNER_SELECTOR: [u8; 4] = [0x8d, 0xa5, 0xcb, 0x5b];
/// `name()` selector.
const NAME_SELECTOR: [u8; 4] = [0x06, 0xfd, 0xde, 0x03];

/// Chain reads the indexer needs from a node.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    /// Current chain height.
    async fn block_number(&self) -> Result<u64>;

    /// Block at `number`, or None if the node does not have it yet.
    async fn get_block(&self, number: u64) -> Result<Option<Block>>;

    /// Transaction by hash, or None if the node does not know it.
    async fn get_transaction(&self, hash: B256) -> Result<Option<Transaction>>;

    /// Logs emitted by `address` in an inclusive block range.
    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> Result<Vec<Log>>;

    /// Current `owner()` of a lock contract.
    async fn lock_owner(&self, lock: Address) -> Result<Address>;

    /// `name()` of a lock contract.
    async fn lock_name(&self, lock: Address) -> Result<String>;
}

/// JSON-RPC client for Ethereum nodes.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl RpcClient {
    /// Create a new RPC client whose calls time out after `timeout`.
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        match tokio::time::timeout(self.timeout, self.send(method, params)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                method: method.to_string(),
                timeout: self.timeout,
            }
            .into()),
        }
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", method))?;

        let json: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", method))?;

        // Check for RPC error
        if let Some(error) = json.get("error") {
            return Err(RpcError::Node {
                method: method.to_string(),
                message: error.to_string(),
            }
            .into());
        }

        // Extract result
        json.get("result")
            .cloned()
            .with_context(|| format!("{} response missing 'result' field", method))
    }

    /// `eth_call` against the latest block.
    async fn eth_call(&self, to: Address, selector: [u8; 4]) -> Result<Vec<u8>> {
        let params = json!([
            {
                "to": format!("0x{:x}", to),
                "data": format!("0x{}", hex::encode(selector)),
            },
            "latest"
        ]);
        let result = self.call("eth_call", params).await?;
        let data = result.as_str().context("eth_call response is not a string")?;
        let data = data.strip_prefix("0x").unwrap_or(data);
        hex::decode(data).context("Failed to decode eth_call result")
    }
}

#[async_trait]
impl ChainProvider for RpcClient {
    async fn block_number(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let number_str = result
            .as_str()
            .context("Block number response is not a string")?;
        let number_str = number_str.strip_prefix("0x").unwrap_or(number_str);
        if number_str.is_empty() {
            anyhow::bail!("Block number is empty");
        }
        u64::from_str_radix(number_str, 16).context("Failed to parse block number")
    }

    async fn get_block(&self, number: u64) -> Result<Option<Block>> {
        let params = json!([format!("0x{:x}", number), false]);
        let result = self.call("eth_getBlockByNumber", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .with_context(|| format!("Failed to deserialize block {}", number))
    }

    async fn get_transaction(&self, hash: B256) -> Result<Option<Transaction>> {
        let params = json!([format!("0x{:x}", hash)]);
        let result = self.call("eth_getTransactionByHash", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .with_context(|| format!("Failed to deserialize transaction {:?}", hash))
    }

    async fn get_logs(&self, address: Address, from_block: u64, to_block: u64) -> Result<Vec<Log>> {
        let params = json!([{
            "address": format!("0x{:x}", address),
            "fromBlock": format!("0x{:x}", from_block),
            "toBlock": format!("0x{:x}", to_block),
        }]);
        let result = self.call("eth_getLogs", params).await?;
        serde_json::from_value(result).context("Failed to deserialize logs")
    }

    async fn lock_owner(&self, lock: Address) -> Result<Address> {
        let data = self.eth_call(lock, OWNER_SELECTOR).await?;
        decode_abi_address(&data)
    }

    async fn lock_name(&self, lock: Address) -> Result<String> {
        let data = self.eth_call(lock, NAME_SELECTOR).await?;
        decode_abi_string(&data)
    }
}

/// Decode an ABI-encoded `address` return value.
fn decode_abi_address(data: &[u8]) -> Result<Address> {
    if data.len() < 32 {
        anyhow::bail!("Address return value must be 32 bytes, got {}", data.len());
    }
    Ok(Address::from_slice(&data[12..32]))
}

/// Decode an ABI-encoded `string` return value.
///
/// Offsets and lengths come from untrusted return data and are bounds
/// checked before use.
fn decode_abi_string(data: &[u8]) -> Result<String> {
    let word = |at: usize| -> Result<usize> {
        let slice = at
            .checked_add(32)
            .and_then(|end| data.get(at..end))
            .with_context(|| format!("String return value truncated at byte {}", at))?;
        if slice[..24].iter().any(|b| *b != 0) {
            anyhow::bail!("String offset or length out of range");
        }
        let value = u64::from_be_bytes(slice[24..32].try_into()?);
        usize::try_from(value).context("String offset or length out of range")
    };

    let offset = word(0)?;
    let len = word(offset)?;
    let bytes = offset
        .checked_add(32)
        .and_then(|start| Some((start, start.checked_add(len)?)))
        .and_then(|(start, end)| data.get(start..end))
        .context("String return value shorter than its length")?;
    String::from_utf8(bytes.to_vec()).context("String return value is not UTF-8")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::store::fixtures::block_hash;
    use alloy_primitives::U256;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Scripted in-memory chain.
    #[derive(Default)]
    pub(crate) struct MockProvider {
        pub(crate) blocks: Mutex<BTreeMap<u64, Block>>,
        pub(crate) transactions: Mutex<HashMap<B256, Transaction>>,
        pub(crate) failing_transactions: Mutex<HashSet<B256>>,
        pub(crate) logs: Mutex<Vec<Log>>,
        pub(crate) owners: Mutex<HashMap<Address, Address>>,
        pub(crate) names: Mutex<HashMap<Address, String>>,
        pub(crate) log_queries: Mutex<Vec<(Address, u64, u64)>>,
        pub(crate) offline: AtomicBool,
    }

    pub(crate) fn transaction(seed: u8, from: Address, to: Option<Address>) -> Transaction {
        Transaction {
            hash: B256::repeat_byte(seed),
            block_hash: None,
            block_number: None,
            transaction_index: None,
            from,
            to,
            value: U256::from(1u64),
            gas_price: Some(U256::from(1u64)),
            gas: U256::from(21_000u64),
            input: vec![],
            nonce: Some(0),
            r: U256::ZERO,
            s: U256::ZERO,
            v: Some(27),
            creates: None,
            raw: None,
        }
    }

    impl MockProvider {
        /// Append a block at `number` holding `txs`, chained on `block_hash(number - 1)`.
        pub(crate) fn push_block(&self, number: u64, txs: Vec<Transaction>) -> Block {
            let hash = block_hash(number);
            let mut hashes = Vec::new();
            let mut transactions = self.transactions.lock().unwrap();
            for (index, mut tx) in txs.into_iter().enumerate() {
                tx.block_hash = Some(hash);
                tx.block_number = Some(number);
                tx.transaction_index = Some(index as u64);
                hashes.push(tx.hash);
                transactions.insert(tx.hash, tx);
            }
            let block = Block {
                number,
                hash,
                parent_hash: block_hash(number.saturating_sub(1)),
                timestamp: 1_700_000_000 + number * 12,
                nonce: Some(0),
                difficulty: Some(U256::ZERO),
                gas_limit: U256::from(30_000_000u64),
                gas_used: U256::from(21_000u64),
                miner: Address::ZERO,
                extra_data: vec![],
                transactions: hashes,
            };
            self.blocks.lock().unwrap().insert(number, block.clone());
            block
        }

        pub(crate) fn fail_transaction(&self, hash: B256) {
            self.failing_transactions.lock().unwrap().insert(hash);
        }

        pub(crate) fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check_online(&self) -> Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ChainProvider for MockProvider {
        async fn block_number(&self) -> Result<u64> {
            self.check_online()?;
            Ok(self
                .blocks
                .lock()
                .unwrap()
                .keys()
                .next_back()
                .copied()
                .unwrap_or_default())
        }

        async fn get_block(&self, number: u64) -> Result<Option<Block>> {
            self.check_online()?;
            Ok(self.blocks.lock().unwrap().get(&number).cloned())
        }

        async fn get_transaction(&self, hash: B256) -> Result<Option<Transaction>> {
            self.check_online()?;
            if self.failing_transactions.lock().unwrap().contains(&hash) {
                anyhow::bail!("transaction lookup failed");
            }
            Ok(self.transactions.lock().unwrap().get(&hash).cloned())
        }

        async fn get_logs(
            &self,
            address: Address,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<Log>> {
            self.check_online()?;
            self.log_queries
                .lock()
                .unwrap()
                .push((address, from_block, to_block));
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| {
                    log.address == address
                        && log
                            .block_number
                            .is_some_and(|n| n >= from_block && n <= to_block)
                })
                .cloned()
                .collect())
        }

        async fn lock_owner(&self, lock: Address) -> Result<Address> {
            self.check_online()?;
            self.owners
                .lock()
                .unwrap()
                .get(&lock)
                .copied()
                .with_context(|| format!("execution reverted for 0x{:x}", lock))
        }

        async fn lock_name(&self, lock: Address) -> Result<String> {
            self.check_online()?;
            self.names
                .lock()
                .unwrap()
                .get(&lock)
                .cloned()
                .context("name() reverted")
        }
    }
}
