//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data.
//! This ensures deterministic, lexicographically ordered keys in RocksDB.
//! Integers are big-endian so range scans follow numeric order.

use alloy_primitives::{Address, B256};

/// Encode a cursor key.
///
/// Format: byte 'K' + network (8 bytes, big-endian)
/// Total length: 9 bytes
pub fn encode_cursor_key(network: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(b'K');
    key.extend_from_slice(&network.to_be_bytes());
    key
}

/// Encode a block key.
///
/// Format: byte 'B' + block hash (32 bytes)
/// Total length: 33 bytes
pub fn encode_block_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'B');
    key.extend_from_slice(hash.as_slice());
    key
}

/// Encode a canonical block number key.
///
/// Format: byte 'N' + network (8 bytes) + block number (8 bytes)
/// Total length: 17 bytes
pub fn encode_block_number_key(network: u64, number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(b'N');
    key.extend_from_slice(&network.to_be_bytes());
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Encode a transaction key.
///
/// Format: byte 'T' + transaction hash (32 bytes)
/// Total length: 33 bytes
pub fn encode_transaction_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'T');
    key.extend_from_slice(hash.as_slice());
    key
}

/// Encode a transaction position key, used to scan transactions by block.
///
/// Format: byte 'I' + network (8 bytes) + block number (8 bytes) + tx hash (32 bytes)
/// Total length: 49 bytes
pub fn encode_tx_position_key(network: u64, block: u64, hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(49);
    key.push(b'I');
    key.extend_from_slice(&network.to_be_bytes());
    key.extend_from_slice(&block.to_be_bytes());
    key.extend_from_slice(hash.as_slice());
    key
}

/// Lower bound of all position keys for `(network, block)`.
pub fn encode_tx_position_prefix(network: u64, block: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(b'I');
    key.extend_from_slice(&network.to_be_bytes());
    key.extend_from_slice(&block.to_be_bytes());
    key
}

/// Decode a transaction position key into (network, block, tx hash).
pub fn decode_tx_position_key(key: &[u8]) -> Option<(u64, u64, B256)> {
    if key.len() != 49 || key[0] != b'I' {
        return None;
    }
    let network = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let block = u64::from_be_bytes(key[9..17].try_into().ok()?);
    Some((network, block, B256::from_slice(&key[17..49])))
}

/// Encode a registry key.
///
/// Format: byte 'R' + address (20 bytes)
/// Total length: 21 bytes
pub fn encode_registry_key(addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(21);
    key.push(b'R');
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode a lock key.
///
/// Format: byte 'L' + network (8 bytes) + lock address (20 bytes)
/// Total length: 29 bytes
pub fn encode_lock_key(network: u64, addr: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(29);
    key.push(b'L');
    key.extend_from_slice(&network.to_be_bytes());
    key.extend_from_slice(addr.as_slice());
    key
}

/// Encode a dispatch key.
///
/// Format: byte 'D' + lock address (20 bytes) + key id length (4 bytes)
/// + key id + email. The length prefix keeps `("1", "2x@y")` and
/// `("12", "x@y")` apart.
pub fn encode_dispatch_key(lock: Address, key_id: &str, email: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(25 + key_id.len() + email.len());
    key.push(b'D');
    key.extend_from_slice(lock.as_slice());
    key.extend_from_slice(&(key_id.len() as u32).to_be_bytes());
    key.extend_from_slice(key_id.as_bytes());
    key.extend_from_slice(email.as_bytes());
    key
}

/// Encode a contact key.
///
/// Format: byte 'C' + lock address (20 bytes) + owner address (20 bytes)
/// Total length: 41 bytes
pub fn encode_contact_key(lock: Address, owner: Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(41);
    key.push(b'C');
    key.extend_from_slice(lock.as_slice());
    key.extend_from_slice(owner.as_slice());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{address, b256};

    #[test]
    fn test_cursor_key_encoding() {
        let key = encode_cursor_key(137);
        assert_eq!(key.len(), 9);
        assert_eq!(key[0], b'K');
        assert_eq!(u64::from_be_bytes(key[1..9].try_into().unwrap()), 137);
    }

    #[test]
    fn test_tx_position_key_roundtrip() {
        let hash = b256!("0000000000000000000000000000000000000000000000000000000000000001");
        let key = encode_tx_position_key(1, 42, hash);
        assert_eq!(key.len(), 49);
        assert!(key.starts_with(&encode_tx_position_prefix(1, 42)));
        assert_eq!(decode_tx_position_key(&key), Some((1, 42, hash)));
        assert_eq!(decode_tx_position_key(&key[..48]), None);
    }

    #[test]
    fn test_tx_position_keys_sort_by_block() {
        let hash = b256!("ff00000000000000000000000000000000000000000000000000000000000000");
        let low = encode_tx_position_key(1, 255, hash);
        let high = encode_tx_position_prefix(1, 256);
        assert!(low < high);
    }

    #[test]
    fn test_dispatch_key_is_unambiguous() {
        let lock = address!("0000000000000000000000000000000000000abc");
        let a = encode_dispatch_key(lock, "1", "2x@y.z");
        let b = encode_dispatch_key(lock, "12", "x@y.z");
        assert_ne!(a, b);
    }

    #[test]
    fn test_lock_key_encoding() {
        let lock = address!("0000000000000000000000000000000000000abc");
        let key = encode_lock_key(5, lock);
        assert_eq!(key.len(), 29);
        assert_eq!(key[0], b'L');
        assert_eq!(&key[9..], lock.as_slice());
    }
}
