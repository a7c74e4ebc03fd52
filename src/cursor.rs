//! Per-network chain cursor
//!
//! The cursor records the last block whose contents were fully processed and
//! persisted. It only moves forward along the parent-hash chain; anything
//! else is reported as a stale cursor for the caller to resolve.

use crate::error::CursorError;
use crate::records::{BlockRecord, CursorRecord};
use crate::store::Persistence;
use alloy_primitives::B256;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resumable position of the indexer on each network.
#[derive(Clone)]
pub struct ChainCursor {
    store: Arc<dyn Persistence>,
}

impl ChainCursor {
    /// Create a cursor backed by `store`.
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Get the cursor of a network, if one was ever advanced.
    pub fn get(&self, network: u64) -> Result<Option<CursorRecord>> {
        self.store.get_cursor(network)
    }

    /// Number of the next block to process.
    ///
    /// Without a cursor this is `start_block`, or genesis when none is configured.
    pub fn next_block_number(&self, network: u64, start_block: Option<u64>) -> Result<u64> {
        Ok(match self.get(network)? {
            Some(cursor) => cursor.number + 1,
            None => start_block.unwrap_or(0),
        })
    }

    /// Move the cursor of `network` to `block`.
    ///
    /// Returns false when the cursor already points at `block` (re-processing
    /// the same block). Fails with [`CursorError::Stale`] when `block` does
    /// not extend the current cursor.
    pub fn advance(&self, network: u64, block: &BlockRecord) -> Result<bool> {
        if !self.check_extends(network, block)? {
            debug!(network, number = block.number, "cursor already at block");
            return Ok(false);
        }

        self.store
            .put_cursor(&CursorRecord {
                network,
                number: block.number,
                hash: block.hash,
            })
            .with_context(|| format!("Failed to advance cursor of network {}", network))?;
        Ok(true)
    }

    /// Check that `block` is the successor of the cursor without moving it.
    ///
    /// Returns false when the cursor already points at `block`.
    pub fn check_extends(&self, network: u64, block: &BlockRecord) -> Result<bool> {
        let Some(cursor) = self.get(network)? else {
            return Ok(true);
        };
        if cursor.number == block.number && cursor.hash == block.hash {
            return Ok(false);
        }
        if block.parent_hash != cursor.hash || block.number != cursor.number + 1 {
            return Err(CursorError::Stale {
                network,
                number: block.number,
                parent_hash: block.parent_hash,
                cursor_number: cursor.number,
                cursor_hash: cursor.hash,
            }
            .into());
        }
        Ok(true)
    }

    /// Reposition the cursor regardless of the current value.
    ///
    /// Used for reorg resolution and by operators.
    pub fn rewind(&self, network: u64, number: u64, hash: B256) -> Result<()> {
        warn!(network, number, hash = %format!("0x{:x}", hash), "rewinding cursor");
        self.store
            .put_cursor(&CursorRecord {
                network,
                number,
                hash,
            })
            .with_context(|| format!("Failed to rewind cursor of network {}", network))
    }
}
