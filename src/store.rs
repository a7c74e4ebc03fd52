//! Persistence trait and RocksDB implementation
//!
//! Provides a persistent key-value store for indexed chain data.
//! Uses RocksDB with column families for efficient organization.
//!
//! Every write is an idempotent upsert keyed by the record's unique key, so
//! the fetch loops, the backfill worker and the reconciler can share one
//! store without coordinating.

use crate::keys::{
    decode_tx_position_key, encode_block_key, encode_block_number_key, encode_contact_key,
    encode_cursor_key, encode_dispatch_key, encode_lock_key, encode_registry_key,
    encode_transaction_key, encode_tx_position_key, encode_tx_position_prefix,
};
use crate::records::{
    normalize_email, unix_now, BlockRecord, ContactRecord, CursorRecord, DispatchRecord,
    LockRecord, RegistryEntry, TransactionRecord,
};
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;

/// Trait defining the repository contract of the indexer.
///
/// All methods return Results for proper error handling.
/// Upserts return whether a new row was created.
pub trait Persistence: Send + Sync {
    /// Get the cursor of a network.
    fn get_cursor(&self, network: u64) -> Result<Option<CursorRecord>>;

    /// Store the cursor of a network.
    fn put_cursor(&self, cursor: &CursorRecord) -> Result<()>;

    /// Insert a block if its hash is unknown.
    ///
    /// The canonical number index always points at the latest block stored
    /// for that height, so a reorged height resolves to the new block.
    fn upsert_block(&self, block: &BlockRecord) -> Result<bool>;

    /// Get a block by hash.
    fn get_block(&self, hash: B256) -> Result<Option<BlockRecord>>;

    /// Get the canonical block hash at a height.
    fn get_block_hash(&self, network: u64, number: u64) -> Result<Option<B256>>;

    /// Insert a transaction, or refresh `confirmations` of a known one.
    fn upsert_transaction(&self, tx: &TransactionRecord) -> Result<bool>;

    /// Get a transaction by hash.
    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>>;

    /// Get all persisted transactions of a network in an inclusive block range,
    /// ordered by block number.
    fn get_transactions_in_range(
        &self,
        network: u64,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<TransactionRecord>>;

    /// Insert a registry entry. Returns false if the address is already registered.
    fn insert_registry_entry(&self, entry: &RegistryEntry) -> Result<bool>;

    /// Get a registry entry.
    fn get_registry_entry(&self, addr: Address) -> Result<Option<RegistryEntry>>;

    /// List all registry entries.
    fn list_registry(&self) -> Result<Vec<RegistryEntry>>;

    /// Record the highest block of `network` covered by a backfill of `addr`.
    fn set_backfilled_through(&self, addr: Address, network: u64, block: u64) -> Result<()>;

    /// Upsert a lock projection, last-writer-wins on `as_of`.
    ///
    /// Returns false when the stored projection is newer than `lock`.
    fn upsert_lock(&self, lock: &LockRecord) -> Result<bool>;

    /// Get a lock projection.
    fn get_lock(&self, network: u64, addr: Address) -> Result<Option<LockRecord>>;

    /// Record a notification dispatch for `(lock, key_id, email)`.
    ///
    /// Returns false if the tuple was already recorded; that is not an error.
    fn record_dispatch(&self, lock: Address, key_id: &str, email: &str) -> Result<bool>;

    /// List dispatches recorded for a lock.
    fn list_dispatches(&self, lock: Address) -> Result<Vec<DispatchRecord>>;

    /// Store the contact of a key holder.
    fn put_contact(&self, contact: &ContactRecord) -> Result<()>;

    /// Get the contact of a key holder.
    fn get_contact(&self, lock: Address, owner: Address) -> Result<Option<ContactRecord>>;
}

const COLUMN_FAMILIES: [&str; 9] = [
    "cursors",
    "blocks",
    "block_numbers",
    "transactions",
    "tx_positions",
    "registry",
    "locks",
    "dispatches",
    "contacts",
];

/// RocksDB-backed implementation of Persistence.
///
/// Uses column families to organize different types of data:
/// - cursors: one cursor per network
/// - blocks / block_numbers: blocks by hash, canonical hash by height
/// - transactions / tx_positions: transactions by hash, positions by block
/// - registry: watched addresses
/// - locks: ownership projections
/// - dispatches / contacts: notification bookkeeping
pub struct RocksStore {
    db: DB,
    /// Serializes read-check-write upserts.
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    fn get_record<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        let handle = self.get_cf(cf)?;
        match self
            .db
            .get_cf(handle, key)
            .with_context(|| format!("Failed to read from {}", cf))?
        {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .with_context(|| format!("Failed to deserialize record from {}", cf))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, cf: &str, key: &[u8], record: &T) -> Result<()> {
        let handle = self.get_cf(cf)?;
        let value = postcard::to_allocvec(record)
            .with_context(|| format!("Failed to serialize record for {}", cf))?;
        self.db
            .put_cf(handle, key, &value)
            .with_context(|| format!("Failed to write to {}", cf))?;
        Ok(())
    }

    fn exists(&self, cf: &str, key: &[u8]) -> Result<bool> {
        let handle = self.get_cf(cf)?;
        Ok(self
            .db
            .get_pinned_cf(handle, key)
            .with_context(|| format!("Failed to read from {}", cf))?
            .is_some())
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        // A poisoned guard protects no data; keep going.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Collect every record of a column family whose key starts with `prefix`.
    fn scan_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let handle = self.get_cf(cf)?;
        let iter = self.db.iterator_cf(
            handle,
            rocksdb::IteratorMode::From(prefix, rocksdb::Direction::Forward),
        );

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if !key.starts_with(prefix) {
                break;
            }
            let record = postcard::from_bytes(&value)
                .with_context(|| format!("Failed to deserialize record from {}", cf))?;
            records.push(record);
        }
        Ok(records)
    }
}

impl Persistence for RocksStore {
    fn get_cursor(&self, network: u64) -> Result<Option<CursorRecord>> {
        self.get_record("cursors", &encode_cursor_key(network))
            .context("Failed to get cursor")
    }

    fn put_cursor(&self, cursor: &CursorRecord) -> Result<()> {
        self.put_record("cursors", &encode_cursor_key(cursor.network), cursor)
            .context("Failed to put cursor")
    }

    fn upsert_block(&self, block: &BlockRecord) -> Result<bool> {
        let _guard = self.guard();
        let key = encode_block_key(block.hash);
        let inserted = if self.exists("blocks", &key)? {
            false
        } else {
            self.put_record("blocks", &key, block)
                .context("Failed to put block")?;
            true
        };

        let cf = self.get_cf("block_numbers")?;
        self.db
            .put_cf(
                cf,
                encode_block_number_key(block.network, block.number),
                block.hash.as_slice(),
            )
            .context("Failed to put block number index")?;
        Ok(inserted)
    }

    fn get_block(&self, hash: B256) -> Result<Option<BlockRecord>> {
        self.get_record("blocks", &encode_block_key(hash))
            .context("Failed to get block")
    }

    fn get_block_hash(&self, network: u64, number: u64) -> Result<Option<B256>> {
        let cf = self.get_cf("block_numbers")?;
        match self
            .db
            .get_cf(cf, encode_block_number_key(network, number))
            .context("Failed to get block hash")?
        {
            Some(bytes) => {
                if bytes.len() != 32 {
                    anyhow::bail!("Block hash must be 32 bytes, got {}", bytes.len());
                }
                Ok(Some(B256::from_slice(&bytes)))
            }
            None => Ok(None),
        }
    }

    fn upsert_transaction(&self, tx: &TransactionRecord) -> Result<bool> {
        let _guard = self.guard();
        let key = encode_transaction_key(tx.hash);
        match self.get_record::<TransactionRecord>("transactions", &key)? {
            Some(mut existing) => {
                if existing.confirmations != tx.confirmations {
                    existing.confirmations = tx.confirmations;
                    self.put_record("transactions", &key, &existing)
                        .context("Failed to update transaction confirmations")?;
                }
                Ok(false)
            }
            None => {
                self.put_record("transactions", &key, tx)
                    .context("Failed to put transaction")?;
                let cf = self.get_cf("tx_positions")?;
                self.db
                    .put_cf(
                        cf,
                        encode_tx_position_key(tx.network, tx.block_number, tx.hash),
                        b"",
                    )
                    .context("Failed to put transaction position")?;
                Ok(true)
            }
        }
    }

    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>> {
        self.get_record("transactions", &encode_transaction_key(hash))
            .context("Failed to get transaction")
    }

    fn get_transactions_in_range(
        &self,
        network: u64,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<TransactionRecord>> {
        if start_block > end_block {
            return Ok(Vec::new());
        }

        let cf = self.get_cf("tx_positions")?;
        let start_key = encode_tx_position_prefix(network, start_block);
        let end_key = match end_block.checked_add(1) {
            Some(next) => encode_tx_position_prefix(network, next),
            None => encode_tx_position_prefix(network.saturating_add(1), 0),
        };

        let mut hashes = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            rocksdb::IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item.context("Failed to read iterator")?;

            // Stop if we've gone past the end key
            if key.as_ref() >= end_key.as_slice() {
                break;
            }

            let (key_network, _, hash) = decode_tx_position_key(&key)
                .context("Failed to decode transaction position key")?;
            if key_network != network {
                break;
            }
            hashes.push(hash);
        }

        let mut transactions = Vec::with_capacity(hashes.len());
        for hash in hashes {
            match self.get_transaction(hash)? {
                Some(tx) => transactions.push(tx),
                None => anyhow::bail!("Transaction position points at missing tx {:?}", hash),
            }
        }
        Ok(transactions)
    }

    fn insert_registry_entry(&self, entry: &RegistryEntry) -> Result<bool> {
        let _guard = self.guard();
        let key = encode_registry_key(entry.address);
        if self.exists("registry", &key)? {
            return Ok(false);
        }
        self.put_record("registry", &key, entry)
            .context("Failed to put registry entry")?;
        Ok(true)
    }

    fn get_registry_entry(&self, addr: Address) -> Result<Option<RegistryEntry>> {
        self.get_record("registry", &encode_registry_key(addr))
            .context("Failed to get registry entry")
    }

    fn list_registry(&self) -> Result<Vec<RegistryEntry>> {
        self.scan_prefix("registry", b"R")
            .context("Failed to list registry")
    }

    fn set_backfilled_through(&self, addr: Address, network: u64, block: u64) -> Result<()> {
        let _guard = self.guard();
        let key = encode_registry_key(addr);
        let mut entry: RegistryEntry = self
            .get_record("registry", &key)?
            .with_context(|| format!("Address 0x{:x} is not registered", addr))?;
        let through = entry.backfilled_through.entry(network).or_insert(block);
        *through = (*through).max(block);
        self.put_record("registry", &key, &entry)
            .context("Failed to update registry entry")
    }

    fn upsert_lock(&self, lock: &LockRecord) -> Result<bool> {
        let _guard = self.guard();
        let key = encode_lock_key(lock.network, lock.address);
        if let Some(existing) = self.get_record::<LockRecord>("locks", &key)? {
            if existing.as_of > lock.as_of {
                return Ok(false);
            }
        }
        self.put_record("locks", &key, lock)
            .context("Failed to put lock")?;
        Ok(true)
    }

    fn get_lock(&self, network: u64, addr: Address) -> Result<Option<LockRecord>> {
        self.get_record("locks", &encode_lock_key(network, addr))
            .context("Failed to get lock")
    }

    fn record_dispatch(&self, lock: Address, key_id: &str, email: &str) -> Result<bool> {
        let _guard = self.guard();
        let email = normalize_email(email);
        let key = encode_dispatch_key(lock, key_id, &email);
        if self.exists("dispatches", &key)? {
            return Ok(false);
        }
        let record = DispatchRecord {
            lock_address: lock,
            key_id: key_id.to_string(),
            email,
            dispatched_at: unix_now(),
        };
        self.put_record("dispatches", &key, &record)
            .context("Failed to put dispatch")?;
        Ok(true)
    }

    fn list_dispatches(&self, lock: Address) -> Result<Vec<DispatchRecord>> {
        let mut prefix = vec![b'D'];
        prefix.extend_from_slice(lock.as_slice());
        self.scan_prefix("dispatches", &prefix)
            .context("Failed to list dispatches")
    }

    fn put_contact(&self, contact: &ContactRecord) -> Result<()> {
        let record = ContactRecord {
            email: normalize_email(&contact.email),
            ..contact.clone()
        };
        self.put_record(
            "contacts",
            &encode_contact_key(contact.lock_address, contact.owner),
            &record,
        )
        .context("Failed to put contact")
    }

    fn get_contact(&self, lock: Address, owner: Address) -> Result<Option<ContactRecord>> {
        self.get_record("contacts", &encode_contact_key(lock, owner))
            .context("Failed to get contact")
    }
}
