//! Typed errors that callers branch on.
//!
//! Everything else flows through `anyhow` with context, the same way the
//! rest of the crate reports failures.

use alloy_primitives::B256;
use std::time::Duration;
use thiserror::Error;

/// Error raised when a block does not extend the network's cursor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CursorError {
    /// The block's parent is not the block the cursor points at: a block was
    /// missed or the chain reorganized.
    #[error(
        "stale cursor on network {network}: block {number} has parent {parent_hash:#x}, cursor is at {cursor_number} ({cursor_hash:#x})"
    )]
    Stale {
        /// Chain ID
        network: u64,
        /// Number of the rejected block
        number: u64,
        /// Parent hash carried by the rejected block
        parent_hash: B256,
        /// Block number the cursor points at
        cursor_number: u64,
        /// Block hash the cursor points at
        cursor_hash: B256,
    },
}

/// Errors returned by provider calls.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The call did not complete within the configured timeout.
    #[error("{method} timed out after {timeout:?}")]
    Timeout {
        /// JSON-RPC method or query name
        method: String,
        /// Configured timeout
        timeout: Duration,
    },
    /// The node answered with a JSON-RPC error object.
    #[error("RPC error from {method}: {message}")]
    Node {
        /// JSON-RPC method
        method: String,
        /// Error object, rendered as JSON
        message: String,
    },
}

/// Reasons a webhook delivery is rejected.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// No `x-hub-signature` header.
    #[error("Missing signature")]
    Missing,
    /// Malformed header, unsupported algorithm, or digest mismatch.
    #[error("Invalid signature")]
    Invalid,
}

/// Whether an `anyhow` error chain contains a provider timeout.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<RpcError>(),
            Some(RpcError::Timeout { .. })
        )
    })
}

/// The stale cursor error carried by an `anyhow` error chain, if any.
pub fn stale_cursor(err: &anyhow::Error) -> Option<&CursorError> {
    err.chain().find_map(|cause| cause.downcast_ref::<CursorError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_wrapped_errors() {
        let timeout: anyhow::Result<()> = Err(RpcError::Timeout {
            method: "eth_blockNumber".to_string(),
            timeout: Duration::from_secs(1),
        }
        .into());
        let err = timeout.context("poll failed").unwrap_err();
        assert!(is_timeout(&err));
        assert!(stale_cursor(&err).is_none());

        let stale: anyhow::Result<()> = Err(CursorError::Stale {
            network: 1,
            number: 11,
            parent_hash: B256::ZERO,
            cursor_number: 10,
            cursor_hash: B256::repeat_byte(1),
        }
        .into());
        let err = stale.context("advance failed").unwrap_err();
        assert!(!is_timeout(&err));
        assert!(matches!(stale_cursor(&err), Some(CursorError::Stale { number: 11, .. })));
    }

    #[test]
    fn test_signature_error_messages() {
        assert_eq!(SignatureError::Missing.to_string(), "Missing signature");
        assert_eq!(SignatureError::Invalid.to_string(), "Invalid signature");
    }
}
