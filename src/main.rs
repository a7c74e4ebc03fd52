//! roverctl - chain indexer store CLI tool
//!
//! Inspects cursors, registry entries, persisted transactions and lock
//! projections in the indexer's RocksDB store.

use rover::cli;

fn main() {
    if let Err(e) = cli::run() {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
