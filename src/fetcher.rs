//! Block and transaction fetcher
//!
//! Pulls the block after the cursor, fetches its transactions one by one,
//! keeps the ones the registry cares about, persists everything, emits
//! events, and only then advances the cursor. A crash anywhere before the
//! advance means the block is processed again, which the idempotent upserts
//! absorb.

use crate::cursor::ChainCursor;
use crate::events::{Event, EventDispatcher};
use crate::records::{confirmations_at, BlockRecord, TransactionRecord};
use crate::registry::Registry;
use crate::rpc::ChainProvider;
use crate::store::Persistence;
use crate::types::{Block, Transaction};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of one processed block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOutcome {
    pub number: u64,
    /// Transactions listed in the block
    pub transactions: usize,
    /// Transactions persisted as relevant
    pub relevant: usize,
    /// Transactions that could not be fetched
    pub skipped: usize,
    /// False when the block had already been processed
    pub advanced: bool,
}

/// Fetch-process-advance pipeline of a single network.
pub struct BlockFetcher {
    network: u64,
    start_block: Option<u64>,
    provider: Arc<dyn ChainProvider>,
    store: Arc<dyn Persistence>,
    cursor: ChainCursor,
    registry: Arc<Registry>,
    dispatcher: Arc<EventDispatcher>,
    /// Chain height seen by the last poll
    tip: AtomicU64,
}

impl BlockFetcher {
    pub fn new(
        network: u64,
        start_block: Option<u64>,
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn Persistence>,
        registry: Arc<Registry>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            network,
            start_block,
            provider,
            cursor: ChainCursor::new(store.clone()),
            store,
            registry,
            dispatcher,
            tip: AtomicU64::new(0),
        }
    }

    /// Chain ID this fetcher follows.
    pub fn network(&self) -> u64 {
        self.network
    }

    /// The network's cursor.
    pub fn cursor(&self) -> &ChainCursor {
        &self.cursor
    }

    /// Fetch the block after the cursor, or None if the chain tip has not
    /// moved past it.
    pub async fn poll_next_block(&self) -> Result<Option<Block>> {
        let next = self.cursor.next_block_number(self.network, self.start_block)?;
        let tip = self
            .provider
            .block_number()
            .await
            .context("Failed to get latest block number")?;
        self.tip.fetch_max(tip, Ordering::Relaxed);

        if next > tip {
            debug!(network = self.network, next, tip, "up to date");
            return Ok(None);
        }

        self.provider
            .get_block(next)
            .await
            .with_context(|| format!("Failed to fetch block {}", next))
    }

    /// Process a block fetched by [`Self::poll_next_block`].
    ///
    /// Fails with a stale cursor error before doing any work if `block` does
    /// not extend the cursor.
    ///
    /// Addresses registered while the block is in flight are picked up by
    /// re-filtering the block's transactions until the registry generation
    /// is stable, both before and right after the cursor moves. A
    /// registration that lands after the final check sees the advanced
    /// cursor, so its backfill covers this block.
    pub async fn process_block(&self, block: &Block) -> Result<BlockOutcome> {
        let record = BlockRecord::from_rpc(block, self.network);
        let mut outcome = BlockOutcome {
            number: block.number,
            transactions: block.transactions.len(),
            relevant: 0,
            skipped: 0,
            advanced: false,
        };

        if !self.cursor.check_extends(self.network, &record)? {
            debug!(network = self.network, number = block.number, "block already processed");
            return Ok(outcome);
        }

        let tip = self.tip.load(Ordering::Relaxed).max(block.number);
        let mut pending = Vec::with_capacity(block.transactions.len());
        for hash in &block.transactions {
            match self.provider.get_transaction(*hash).await {
                Ok(Some(tx)) => pending.push(tx),
                Ok(None) => {
                    warn!(network = self.network, block = block.number, "transaction 0x{:x} not found, skipping", hash);
                    outcome.skipped += 1;
                }
                Err(e) => {
                    warn!(network = self.network, block = block.number, "failed to fetch transaction 0x{:x}, skipping: {:#}", hash, e);
                    outcome.skipped += 1;
                }
            }
        }

        let mut generation = self.registry.generation();
        let relevant = self.take_relevant(&mut pending, tip, &mut outcome);

        self.store
            .upsert_block(&record)
            .with_context(|| format!("Failed to persist block {}", block.number))?;
        self.persist(&relevant)?;

        self.dispatcher
            .emit(Event::Block {
                block: record.clone(),
            })
            .await;
        self.publish(block.number, relevant).await;

        while self.registry.generation() != generation {
            generation = self.registry.generation();
            let late = self.take_relevant(&mut pending, tip, &mut outcome);
            self.persist(&late)?;
            self.publish(block.number, late).await;
        }

        outcome.advanced = self.cursor.advance(self.network, &record)?;

        if self.registry.generation() != generation {
            let late = self.take_relevant(&mut pending, tip, &mut outcome);
            self.persist(&late)?;
            self.publish(block.number, late).await;
        }

        info!(
            network = self.network,
            block = block.number,
            transactions = outcome.transactions,
            relevant = outcome.relevant,
            skipped = outcome.skipped,
            "Completed block"
        );
        Ok(outcome)
    }

    /// Remove the transactions the registry currently cares about from
    /// `pending` and convert them to records.
    fn take_relevant(
        &self,
        pending: &mut Vec<Transaction>,
        tip: u64,
        outcome: &mut BlockOutcome,
    ) -> Vec<TransactionRecord> {
        let (matched, rest): (Vec<_>, Vec<_>) = std::mem::take(pending)
            .into_iter()
            .partition(|tx| self.registry.is_relevant(tx));
        *pending = rest;

        let mut records = Vec::with_capacity(matched.len());
        for tx in matched {
            match TransactionRecord::from_rpc(&tx, self.network, tip) {
                Some(record) => records.push(record),
                None => {
                    warn!(network = self.network, "transaction 0x{:x} reported without block, skipping", tx.hash);
                    outcome.skipped += 1;
                }
            }
        }
        outcome.relevant += records.len();
        records
    }

    fn persist(&self, transactions: &[TransactionRecord]) -> Result<()> {
        for tx in transactions {
            self.store
                .upsert_transaction(tx)
                .with_context(|| format!("Failed to persist transaction {:?}", tx.hash))?;
        }
        Ok(())
    }

    async fn publish(&self, number: u64, transactions: Vec<TransactionRecord>) {
        for transaction in transactions {
            info!(
                network = self.network,
                block = number,
                "Relevant transaction 0x{:x}: from=0x{:x}",
                transaction.hash,
                transaction.from
            );
            self.dispatcher
                .emit(Event::Transaction {
                    transaction,
                    backfill: false,
                })
                .await;
        }
    }

    /// Poll and process at most one block.
    pub async fn step(&self) -> Result<Option<BlockOutcome>> {
        match self.poll_next_block().await? {
            Some(block) => self.process_block(&block).await.map(Some),
            None => Ok(None),
        }
    }

    /// Recompute confirmations of persisted transactions in the last
    /// `depth` blocks below the tip.
    pub fn refresh_confirmations(&self, depth: u64) -> Result<usize> {
        let tip = self.tip.load(Ordering::Relaxed);
        if depth == 0 || tip == 0 {
            return Ok(0);
        }
        let mut refreshed = 0;
        for mut tx in self
            .store
            .get_transactions_in_range(self.network, tip.saturating_sub(depth), tip)?
        {
            let confirmations = confirmations_at(tx.block_number, tip);
            if tx.confirmations != confirmations {
                tx.confirmations = confirmations;
                self.store.upsert_transaction(&tx)?;
                refreshed += 1;
            }
        }
        Ok(refreshed)
    }
}
