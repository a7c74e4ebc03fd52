//! Ethereum JSON-RPC types
//!
//! Type definitions for blocks, transactions, and logs
//! returned from Ethereum JSON-RPC endpoints.

use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer};

/// Ethereum block header with transaction hashes only.
///
/// Fetched with `eth_getBlockByNumber(number, false)`; transaction bodies are
/// pulled one by one through `eth_getTransactionByHash`.
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    /// Block number (hex string in JSON, parsed to u64)
    #[serde(rename = "number", deserialize_with = "deserialize_hex_u64")]
    pub number: u64,

    /// Block hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Parent block hash (hex string in JSON)
    #[serde(rename = "parentHash", deserialize_with = "deserialize_hex_b256")]
    pub parent_hash: B256,

    /// Block timestamp in Unix seconds (hex string in JSON)
    #[serde(rename = "timestamp", deserialize_with = "deserialize_hex_u64")]
    pub timestamp: u64,

    /// Proof-of-work nonce (zero after the merge, absent on some L2s)
    #[serde(rename = "nonce", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub nonce: Option<u64>,

    /// Block difficulty (absent on some L2s)
    #[serde(rename = "difficulty", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub difficulty: Option<U256>,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gasLimit", deserialize_with = "deserialize_hex_u256")]
    pub gas_limit: U256,

    /// Gas used (hex string in JSON)
    #[serde(rename = "gasUsed", deserialize_with = "deserialize_hex_u256")]
    pub gas_used: U256,

    /// Block beneficiary
    #[serde(rename = "miner", deserialize_with = "deserialize_hex_address")]
    pub miner: Address,

    /// Extra data field (hex string in JSON)
    #[serde(rename = "extraData", default, deserialize_with = "deserialize_hex_bytes")]
    pub extra_data: Vec<u8>,

    /// Hashes of the transactions included in the block
    #[serde(rename = "transactions", default, deserialize_with = "deserialize_hex_b256_vec")]
    pub transactions: Vec<B256>,
}

/// Ethereum transaction as returned by `eth_getTransactionByHash`.
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    /// Transaction hash (hex string in JSON)
    #[serde(rename = "hash", deserialize_with = "deserialize_hex_b256")]
    pub hash: B256,

    /// Hash of the containing block (None while pending)
    #[serde(rename = "blockHash", default, deserialize_with = "deserialize_hex_b256_opt")]
    pub block_hash: Option<B256>,

    /// Number of the containing block (None while pending)
    #[serde(rename = "blockNumber", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub block_number: Option<u64>,

    /// Position in the block (None while pending)
    #[serde(rename = "transactionIndex", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub transaction_index: Option<u64>,

    /// Sender address (hex string in JSON)
    #[serde(rename = "from", deserialize_with = "deserialize_hex_address")]
    pub from: Address,

    /// Recipient address (None for contract creation, hex string in JSON)
    #[serde(rename = "to", default, deserialize_with = "deserialize_hex_address_opt")]
    pub to: Option<Address>,

    /// Value transferred in wei (hex string in JSON)
    #[serde(rename = "value", deserialize_with = "deserialize_hex_u256")]
    pub value: U256,

    /// Gas price (hex string in JSON; effective price for typed transactions)
    #[serde(rename = "gasPrice", default, deserialize_with = "deserialize_hex_u256_opt")]
    pub gas_price: Option<U256>,

    /// Gas limit (hex string in JSON)
    #[serde(rename = "gas", deserialize_with = "deserialize_hex_u256")]
    pub gas: U256,

    /// Transaction input data (hex string in JSON, "0x" for simple transfers)
    #[serde(rename = "input", default, deserialize_with = "deserialize_hex_bytes")]
    pub input: Vec<u8>,

    /// Transaction nonce (hex string in JSON)
    #[serde(rename = "nonce", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub nonce: Option<u64>,

    /// Signature r value
    #[serde(rename = "r", default, deserialize_with = "deserialize_hex_u256_or_zero")]
    pub r: U256,

    /// Signature s value
    #[serde(rename = "s", default, deserialize_with = "deserialize_hex_u256_or_zero")]
    pub s: U256,

    /// Signature v value (recovery id / y-parity for typed transactions)
    #[serde(rename = "v", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub v: Option<u64>,

    /// Deployed contract address, reported by some clients for creations
    #[serde(rename = "creates", default, deserialize_with = "deserialize_hex_address_opt")]
    pub creates: Option<Address>,

    /// Raw signed transaction bytes, reported by some clients
    #[serde(rename = "raw", default, deserialize_with = "deserialize_hex_bytes_opt")]
    pub raw: Option<Vec<u8>>,
}

/// Log entry returned by `eth_getLogs`.
#[derive(Debug, Clone, Deserialize)]
pub struct Log {
    /// Address of the contract that emitted the log
    #[serde(rename = "address", deserialize_with = "deserialize_hex_address")]
    pub address: Address,

    /// Indexed topics (topic0 = event signature, topics[1..] = indexed params)
    #[serde(rename = "topics", default)]
    pub topics: Vec<String>,

    /// Non-indexed event data (hex string)
    #[serde(rename = "data", default, deserialize_with = "deserialize_hex_bytes")]
    pub data: Vec<u8>,

    /// Block the log was emitted in
    #[serde(rename = "blockNumber", default, deserialize_with = "deserialize_hex_u64_opt")]
    pub block_number: Option<u64>,

    /// Transaction that emitted the log
    #[serde(rename = "transactionHash", default, deserialize_with = "deserialize_hex_b256_opt")]
    pub transaction_hash: Option<B256>,

    /// Set by the node when the log was removed by a reorg
    #[serde(rename = "removed", default)]
    pub removed: bool,
}

// Hex deserialization helpers

/// Pad an odd-length hex string with a leading zero.
/// This handles cases where RPC returns hex strings without leading zeros.
fn pad_hex_string(s: &str) -> String {
    if s.is_empty() {
        return s.to_string();
    }
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

fn parse_u64(s: &str) -> Result<u64, std::num::ParseIntError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 16)
}

fn parse_u256(s: &str) -> Result<U256, hex::FromHexError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(U256::ZERO);
    }
    let bytes = hex::decode(pad_hex_string(s))?;
    if bytes.len() > 32 {
        return Err(hex::FromHexError::InvalidStringLength);
    }
    Ok(U256::from_be_slice(&bytes))
}

fn parse_b256(s: &str) -> Result<B256, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(pad_hex_string(s)).map_err(|e| e.to_string())?;
    if bytes.len() != 32 {
        return Err(format!("Expected 32 bytes for hash, got {}", bytes.len()));
    }
    Ok(B256::from_slice(&bytes))
}

fn parse_address(s: &str) -> Result<Address, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(pad_hex_string(s)).map_err(|e| e.to_string())?;
    if bytes.len() != 20 {
        return Err(format!("Expected 20 bytes for address, got {}", bytes.len()));
    }
    Ok(Address::from_slice(&bytes))
}

/// Deserialize a hex string to u64.
fn deserialize_hex_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_u64(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to u64.
fn deserialize_hex_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_u64(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string to U256.
fn deserialize_hex_u256<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_u256(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to U256.
fn deserialize_hex_u256_opt<'de, D>(deserializer: D) -> Result<Option<U256>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_u256(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string (or null / missing) to U256.
///
/// - null / missing ⇒ 0
/// - empty string  ⇒ 0
fn deserialize_hex_u256_or_zero<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_hex_u256_opt(deserializer)?.unwrap_or(U256::ZERO))
}

/// Deserialize a hex string to B256.
fn deserialize_hex_b256<'de, D>(deserializer: D) -> Result<B256, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_b256(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to B256.
fn deserialize_hex_b256_opt<'de, D>(deserializer: D) -> Result<Option<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => parse_b256(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a list of hex strings to B256 values.
fn deserialize_hex_b256_vec<'de, D>(deserializer: D) -> Result<Vec<B256>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|s| parse_b256(s).map_err(serde::de::Error::custom))
        .collect()
}

/// Deserialize a hex string to Address.
fn deserialize_hex_address<'de, D>(deserializer: D) -> Result<Address, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_address(&s).map_err(serde::de::Error::custom)
}

/// Deserialize an optional hex string to Address.
fn deserialize_hex_address_opt<'de, D>(deserializer: D) -> Result<Option<Address>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) if s.strip_prefix("0x").unwrap_or(&s).is_empty() => Ok(None),
        Some(s) => parse_address(&s).map(Some).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

/// Deserialize a hex string to bytes.
fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_hex_bytes_opt(deserializer)?.unwrap_or_default())
}

/// Deserialize an optional hex string to bytes.
fn deserialize_hex_bytes_opt<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => {
            let s = s.strip_prefix("0x").unwrap_or(&s);
            if s.is_empty() {
                Ok(Some(Vec::new()))
            } else {
                hex::decode(pad_hex_string(s))
                    .map(Some)
                    .map_err(serde::de::Error::custom)
            }
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};
    use serde_json::json;

    #[test]
    fn test_block_deserialization() {
        let value = json!({
            "number": "0x10",
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "parentHash": "0x00000000000000000000000000000000000000000000000000000000000000bb",
            "timestamp": "0x65000000",
            "nonce": "0x0000000000000000",
            "difficulty": "0x0",
            "gasLimit": "0x1c9c380",
            "gasUsed": "0x5208",
            "miner": "0x0000000000000000000000000000000000000001",
            "extraData": "0x",
            "transactions": [
                "0x00000000000000000000000000000000000000000000000000000000000000cc"
            ]
        });

        let block: Block = serde_json::from_value(value).unwrap();
        assert_eq!(block.number, 16);
        assert_eq!(
            block.parent_hash,
            b256!("00000000000000000000000000000000000000000000000000000000000000bb")
        );
        assert_eq!(block.nonce, Some(0));
        assert_eq!(block.gas_used, U256::from(21000));
        assert_eq!(block.transactions.len(), 1);
        assert!(block.extra_data.is_empty());
    }

    #[test]
    fn test_block_without_pow_fields() {
        let value = json!({
            "number": "0x1",
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "parentHash": "0x00000000000000000000000000000000000000000000000000000000000000bb",
            "timestamp": "0x1",
            "gasLimit": "0x1",
            "gasUsed": "0x0",
            "miner": "0x0000000000000000000000000000000000000001",
            "transactions": []
        });

        let block: Block = serde_json::from_value(value).unwrap();
        assert_eq!(block.nonce, None);
        assert_eq!(block.difficulty, None);
    }

    #[test]
    fn test_contract_creation_transaction() {
        let value = json!({
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000cc",
            "blockHash": "0x00000000000000000000000000000000000000000000000000000000000000aa",
            "blockNumber": "0x10",
            "transactionIndex": "0x0",
            "from": "0xABCDEF0000000000000000000000000000000001",
            "to": null,
            "value": "0x0",
            "gasPrice": "0x3b9aca00",
            "gas": "0x5208",
            "input": "0x6080",
            "nonce": "0x7",
            "r": "0x1",
            "s": "0x2",
            "v": "0x1b",
            "creates": "0x0000000000000000000000000000000000000002"
        });

        let tx: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(tx.to, None);
        assert_eq!(tx.block_number, Some(16));
        assert_eq!(tx.from, address!("abcdef0000000000000000000000000000000001"));
        assert_eq!(tx.input, vec![0x60, 0x80]);
        assert_eq!(tx.v, Some(27));
        assert_eq!(tx.creates, Some(address!("0000000000000000000000000000000000000002")));
        assert_eq!(tx.raw, None);
    }

    #[test]
    fn test_pending_transaction() {
        let value = json!({
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000cc",
            "blockHash": null,
            "blockNumber": null,
            "transactionIndex": null,
            "from": "0x0000000000000000000000000000000000000001",
            "to": "0x0000000000000000000000000000000000000002",
            "value": "0xde0b6b3a7640000",
            "gas": "0x5208",
            "input": "0x"
        });

        let tx: Transaction = serde_json::from_value(value).unwrap();
        assert_eq!(tx.block_hash, None);
        assert_eq!(tx.block_number, None);
        assert_eq!(tx.value, U256::from(1_000_000_000_000_000_000u64));
    }

    #[test]
    fn test_log_deserialization() {
        let value = json!({
            "address": "0x0000000000000000000000000000000000000abc",
            "topics": ["0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"],
            "data": "0x",
            "blockNumber": "0x20",
            "transactionHash": "0x00000000000000000000000000000000000000000000000000000000000000dd"
        });

        let log: Log = serde_json::from_value(value).unwrap();
        assert_eq!(log.block_number, Some(32));
        assert!(!log.removed);
        assert_eq!(log.topics.len(), 1);
    }
}
