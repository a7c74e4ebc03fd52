//! Rover - chain indexing and reconciliation core
//!
//! Polls blocks from JSON-RPC nodes, keeps the transactions of registered
//! addresses in a RocksDB store, and fans events out to backfill,
//! reconciliation and notification jobs. Signed webhook deliveries enter
//! through the same event dispatcher.

pub mod error;
pub mod keys;
pub mod records;
pub mod store;
pub mod types;

// Chain following
pub mod cursor;
pub mod fetcher;
pub mod registry;
pub mod rpc;
pub mod watcher;

// Event fan-out
pub mod backfill;
pub mod events;
pub mod notify;
pub mod reconciler;
pub mod subgraph;
pub mod websub;

pub mod cli;
pub mod config;

// Re-export the main types for convenience
pub use records::{
    BlockRecord, ContactRecord, CursorRecord, DispatchRecord, Key, LockRecord, RegistryEntry,
    TransactionRecord,
};
pub use store::{Persistence, RocksStore};
