//! Backfill of newly registered addresses
//!
//! A registration only affects blocks fetched afterwards. The backfill worker
//! closes that gap: it scans a bounded window below each network's cursor for
//! transactions involving the new address, persists the ones it learns about
//! from the node, and re-emits every match once as a backfilled transaction.

use crate::events::{Event, EventDispatcher, EventHandler, Topic};
use crate::records::TransactionRecord;
use crate::rpc::ChainProvider;
use crate::store::Persistence;
use alloy_primitives::{Address, B256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue depth between registrations and the worker.
pub const BACKFILL_QUEUE: usize = 256;

/// Result of one backfill run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSummary {
    /// Networks scanned
    pub networks: usize,
    /// Transactions newly persisted from provider logs
    pub fetched: usize,
    /// Transactions re-emitted
    pub emitted: usize,
    /// Networks whose provider scan hit a failure; not recorded as backfilled
    pub incomplete: usize,
}

/// Transactions found by one provider log scan.
struct LogScan {
    transactions: Vec<TransactionRecord>,
    /// Requests that failed; the scan has gaps when non-zero
    failures: usize,
}

struct Network {
    id: u64,
    provider: Option<Arc<dyn ChainProvider>>,
}

/// Scans history for addresses as they are registered.
pub struct BackfillWorker {
    store: Arc<dyn Persistence>,
    dispatcher: Arc<EventDispatcher>,
    networks: Vec<Network>,
    /// Blocks below the cursor to scan
    window: u64,
    /// Block span of each `eth_getLogs` request
    log_chunk: u64,
}

impl BackfillWorker {
    pub fn new(
        store: Arc<dyn Persistence>,
        dispatcher: Arc<EventDispatcher>,
        window: u64,
        log_chunk: u64,
    ) -> Self {
        Self {
            store,
            dispatcher,
            networks: Vec::new(),
            window,
            log_chunk: log_chunk.max(1),
        }
    }

    /// Scan `network`, querying `provider` for historical logs when given.
    pub fn with_network(mut self, network: u64, provider: Option<Arc<dyn ChainProvider>>) -> Self {
        self.networks.push(Network {
            id: network,
            provider,
        });
        self
    }

    /// Backfill `address` on every configured network.
    ///
    /// Networks that have not been indexed yet (no cursor) are skipped. Each
    /// matching transaction is emitted once per run even if both the store
    /// and the node report it. A network is recorded as backfilled only when
    /// every provider request of its scan succeeded.
    pub async fn backfill(&self, address: Address) -> Result<BackfillSummary> {
        let mut summary = BackfillSummary::default();
        let registered = self.store.get_registry_entry(address)?.is_some();

        for network in &self.networks {
            let Some(cursor) = self.store.get_cursor(network.id)? else {
                debug!(network = network.id, "no cursor yet, nothing to backfill");
                continue;
            };
            let end = cursor.number;
            let start = end.saturating_sub(self.window);
            summary.networks += 1;

            // Ordered by (block, index) so consumers see history in chain order.
            let mut found: BTreeMap<(u64, u64, B256), TransactionRecord> = BTreeMap::new();
            for tx in self
                .store
                .get_transactions_in_range(network.id, start, end)
                .with_context(|| format!("Failed to scan persisted transactions of network {}", network.id))?
            {
                if tx.touches(address) {
                    found.insert((tx.block_number, tx.transaction_index, tx.hash), tx);
                }
            }

            let mut complete = true;
            if let Some(provider) = &network.provider {
                let known: HashSet<B256> = found.keys().map(|(_, _, hash)| *hash).collect();
                let scan = self
                    .scan_logs(provider.as_ref(), network.id, address, start, end, &known)
                    .await;
                if scan.failures > 0 {
                    warn!(
                        network = network.id,
                        failures = scan.failures,
                        "Backfill of 0x{:x} is incomplete, it will be retried on restart",
                        address
                    );
                    summary.incomplete += 1;
                    complete = false;
                }
                for tx in scan.transactions {
                    if self.store.upsert_transaction(&tx)? {
                        summary.fetched += 1;
                    }
                    found.insert((tx.block_number, tx.transaction_index, tx.hash), tx);
                }
            }

            for transaction in found.into_values() {
                self.dispatcher
                    .emit(Event::Transaction {
                        transaction,
                        backfill: true,
                    })
                    .await;
                summary.emitted += 1;
            }

            if complete && registered {
                self.store.set_backfilled_through(address, network.id, end)?;
            }
        }

        info!(
            networks = summary.networks,
            fetched = summary.fetched,
            emitted = summary.emitted,
            incomplete = summary.incomplete,
            "Backfilled 0x{:x}",
            address
        );
        Ok(summary)
    }

    /// Transactions referenced by logs of `address` in `[start, end]` that
    /// are not in `known`. Provider failures are logged, counted and skipped.
    async fn scan_logs(
        &self,
        provider: &dyn ChainProvider,
        network: u64,
        address: Address,
        start: u64,
        end: u64,
        known: &HashSet<B256>,
    ) -> LogScan {
        let mut seen = known.clone();
        let mut scan = LogScan {
            transactions: Vec::new(),
            failures: 0,
        };

        let mut from = start;
        while from <= end {
            let to = from.saturating_add(self.log_chunk - 1).min(end);
            let logs = match provider.get_logs(address, from, to).await {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(network, from, to, "eth_getLogs failed during backfill: {:#}", e);
                    scan.failures += 1;
                    Vec::new()
                }
            };

            for hash in logs
                .iter()
                .filter(|log| !log.removed)
                .filter_map(|log| log.transaction_hash)
            {
                if !seen.insert(hash) {
                    continue;
                }
                match provider.get_transaction(hash).await {
                    Ok(Some(tx)) => match TransactionRecord::from_rpc(&tx, network, end) {
                        Some(record) => scan.transactions.push(record),
                        None => debug!(network, "backfilled transaction 0x{:x} is pending", hash),
                    },
                    Ok(None) => {
                        warn!(network, "transaction 0x{:x} from logs not found", hash);
                        scan.failures += 1;
                    }
                    Err(e) => {
                        warn!(network, "failed to fetch transaction 0x{:x}: {:#}", hash, e);
                        scan.failures += 1;
                    }
                }
            }

            if to == u64::MAX {
                break;
            }
            from = to + 1;
        }
        scan
    }

    /// Process queued addresses until the queue closes or `cancel` fires.
    pub async fn run(self, mut queue: mpsc::Receiver<Address>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Backfill worker stopping");
                    break;
                }
                next = queue.recv() => {
                    let Some(address) = next else {
                        break;
                    };
                    if let Err(e) = self.backfill(address).await {
                        error!("Backfill of 0x{:x} failed: {:#}", address, e);
                    }
                }
            }
        }
    }
}

/// Forwards registrations to the backfill worker's queue.
pub struct BackfillTrigger {
    queue: mpsc::Sender<Address>,
}

impl BackfillTrigger {
    pub fn new(queue: mpsc::Sender<Address>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventHandler for BackfillTrigger {
    fn name(&self) -> &'static str {
        "backfill-trigger"
    }

    fn handles(&self, topic: Topic) -> bool {
        topic == Topic::Registration
    }

    async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
        if let Event::Registration { address } = event {
            self.queue
                .send(*address)
                .await
                .context("Backfill worker is not running")?;
            debug!("Queued backfill of 0x{:x}", address);
        }
        Ok(Vec::new())
    }
}
