//! Ownership and renewal reconciliation
//!
//! Two periodic jobs re-derive state from authoritative sources:
//! - ownership sync reads `owner()` and `name()` of locks on chain and
//!   overwrites their projection
//! - the renewal scan pages through the keys index for keys expiring in a
//!   window and hands each batch to the notification step

use crate::events::{Event, EventDispatcher};
use crate::records::{unix_now, Key, LockRecord};
use crate::registry::Registry;
use crate::rpc::ChainProvider;
use crate::store::Persistence;
use crate::subgraph::{KeysIndex, KeysQuery};
use alloy_primitives::Address;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Keys requested per page of the renewal scan.
pub const RENEWAL_PAGE_SIZE: u64 = 1000;

/// Oldest lock version whose keys can be renewed.
pub const MINIMUM_LOCK_VERSION: u64 = 10;

/// Outcome of an ownership sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Locks whose projection was written
    pub updated: usize,
    /// Locks skipped because a newer projection was already stored
    pub superseded: usize,
    /// Addresses whose owner could not be read
    pub failed: usize,
}

/// Keeps lock projections in line with the chain.
pub struct OwnershipReconciler {
    store: Arc<dyn Persistence>,
    providers: HashMap<u64, Arc<dyn ChainProvider>>,
}

impl OwnershipReconciler {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self {
            store,
            providers: HashMap::new(),
        }
    }

    pub fn with_network(mut self, network: u64, provider: Arc<dyn ChainProvider>) -> Self {
        self.providers.insert(network, provider);
        self
    }

    /// Refresh the lock projection of every address on `network`.
    ///
    /// A failure to read one lock is logged and counted; the others are
    /// still reconciled. A failing `name()` keeps the previously stored name.
    pub async fn update(&self, addresses: &[Address], network: u64) -> Result<ReconcileSummary> {
        let provider = self
            .providers
            .get(&network)
            .with_context(|| format!("No provider configured for network {}", network))?;

        let mut summary = ReconcileSummary::default();
        for address in addresses {
            match self.update_lock(provider.as_ref(), *address, network).await {
                Ok(true) => summary.updated += 1,
                Ok(false) => summary.superseded += 1,
                Err(e) => {
                    warn!(network, "Failed to reconcile lock 0x{:x}: {:#}", address, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            network,
            updated = summary.updated,
            superseded = summary.superseded,
            failed = summary.failed,
            "Ownership sync complete"
        );
        Ok(summary)
    }

    async fn update_lock(
        &self,
        provider: &dyn ChainProvider,
        address: Address,
        network: u64,
    ) -> Result<bool> {
        let owner = provider.lock_owner(address).await?;
        let name = match provider.lock_name(address).await {
            Ok(name) => name,
            Err(e) => {
                debug!(network, "name() of 0x{:x} unavailable: {:#}", address, e);
                self.store
                    .get_lock(network, address)?
                    .map(|lock| lock.name)
                    .unwrap_or_default()
            }
        };

        self.store.upsert_lock(&LockRecord {
            address,
            name,
            owner,
            network,
            as_of: unix_now(),
        })
    }

    /// Sync every registered address on `networks` each `interval` until
    /// `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<Registry>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut networks: Vec<u64> = self.providers.keys().copied().collect();
        networks.sort_unstable();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let addresses = registry.addresses();
            for network in &networks {
                if let Err(e) = self.update(&addresses, *network).await {
                    error!(network, "Ownership sync failed: {:#}", e);
                }
            }
        }
        info!("Ownership reconciler stopped");
    }
}

/// Finds keys due for renewal and announces them.
pub struct RenewalScanner {
    indexes: HashMap<u64, Arc<dyn KeysIndex>>,
    dispatcher: Arc<EventDispatcher>,
}

impl RenewalScanner {
    pub fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            indexes: HashMap::new(),
            dispatcher,
        }
    }

    pub fn with_network(mut self, network: u64, index: Arc<dyn KeysIndex>) -> Self {
        self.indexes.insert(network, index);
        self
    }

    /// Keys of `network` expiring within the last `within` seconds.
    ///
    /// The window is `[now - within, now]`, unbounded below when `within` is
    /// absent or zero. Every key is emitted as [`Event::RenewalDue`] page by
    /// page before the next page is requested.
    pub async fn get_renewal_keys(&self, within: Option<u64>, network: u64) -> Result<Vec<Key>> {
        self.get_renewal_keys_at(unix_now(), within, network).await
    }

    async fn get_renewal_keys_at(
        &self,
        now: u64,
        within: Option<u64>,
        network: u64,
    ) -> Result<Vec<Key>> {
        let index = self
            .indexes
            .get(&network)
            .with_context(|| format!("No keys index configured for network {}", network))?;

        let start = within.filter(|w| *w > 0).map(|w| now.saturating_sub(w));
        let mut keys = Vec::new();
        let mut page = 0;
        loop {
            let query = KeysQuery {
                start,
                end: now,
                network,
                page,
                limit: RENEWAL_PAGE_SIZE,
                minimum_lock_version: MINIMUM_LOCK_VERSION,
                allow_native_currency: true,
            };
            let batch = index
                .get_keys_to_renew(&query)
                .await
                .with_context(|| format!("Failed to fetch page {} of keys to renew", page))?;
            if batch.is_empty() {
                break;
            }

            debug!(network, page, keys = batch.len(), "renewal page");
            for key in &batch {
                self.dispatcher
                    .emit(Event::RenewalDue { key: key.clone() })
                    .await;
            }
            keys.extend(batch);
            page += 1;
        }

        info!(network, keys = keys.len(), pages = page, "Renewal scan complete");
        Ok(keys)
    }

    /// Scan every configured network each `interval` until `cancel` fires.
    pub async fn run(self: Arc<Self>, within: Option<u64>, interval: Duration, cancel: CancellationToken) {
        let mut networks: Vec<u64> = self.indexes.keys().copied().collect();
        networks.sort_unstable();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for network in &networks {
                if let Err(e) = self.get_renewal_keys(within, *network).await {
                    error!(network, "Renewal scan failed: {:#}", e);
                }
            }
        }
        info!("Renewal scanner stopped");
    }
}
