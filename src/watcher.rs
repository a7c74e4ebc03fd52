//! Per-network watcher loop
//!
//! Drives a [`BlockFetcher`] until the chain tip, sleeps for the poll
//! interval, and repeats. Failed iterations are retried on the next tick;
//! a streak of failures raises an alert. A stale cursor is resolved by
//! walking back to the common ancestor when automatic reorg handling is on.

use crate::config::{Config, NetworkConfig};
use crate::error::{is_timeout, stale_cursor};
use crate::events::{Event, EventDispatcher};
use crate::fetcher::BlockFetcher;
use crate::rpc::ChainProvider;
use crate::store::Persistence;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loop settings of one network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherSettings {
    pub poll_interval: Duration,
    pub alert_threshold: u32,
    pub auto_reorg: bool,
    pub max_reorg_depth: u64,
    pub confirmation_depth: u64,
}

impl WatcherSettings {
    pub fn from_config(config: &Config, network: &NetworkConfig) -> Self {
        Self {
            poll_interval: network.poll_interval(),
            alert_threshold: config.alert_threshold.max(1),
            auto_reorg: config.auto_reorg,
            max_reorg_depth: config.max_reorg_depth,
            confirmation_depth: config.confirmation_depth,
        }
    }
}

/// Fetch-process-advance loop of a single network.
pub struct NetworkWatcher {
    fetcher: BlockFetcher,
    provider: Arc<dyn ChainProvider>,
    store: Arc<dyn Persistence>,
    dispatcher: Arc<EventDispatcher>,
    settings: WatcherSettings,
    consecutive_failures: u32,
    alerted: bool,
}

impl NetworkWatcher {
    pub fn new(
        fetcher: BlockFetcher,
        provider: Arc<dyn ChainProvider>,
        store: Arc<dyn Persistence>,
        dispatcher: Arc<EventDispatcher>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            fetcher,
            provider,
            store,
            dispatcher,
            settings,
            consecutive_failures: 0,
            alerted: false,
        }
    }

    /// Run until `cancel` fires.
    ///
    /// Cancellation is observed between blocks, so a block being processed
    /// is completed and the cursor persisted before the loop stops.
    pub async fn run(mut self, cancel: CancellationToken) {
        let network = self.fetcher.network();
        info!(network, "Starting watcher loop");

        while !cancel.is_cancelled() {
            self.tick(&cancel).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        match self.fetcher.cursor().get(network) {
            Ok(Some(cursor)) => info!(network, block = cursor.number, "Watcher stopped"),
            _ => info!(network, "Watcher stopped"),
        }
    }

    /// One iteration: process every available block, then handle the outcome.
    async fn tick(&mut self, cancel: &CancellationToken) {
        match self.catch_up(cancel).await {
            Ok(processed) => {
                if self.consecutive_failures > 0 {
                    info!(
                        network = self.fetcher.network(),
                        failures = self.consecutive_failures,
                        "Watcher recovered"
                    );
                }
                self.consecutive_failures = 0;
                self.alerted = false;
                if processed > 0 {
                    debug!(network = self.fetcher.network(), processed, "caught up");
                }
            }
            Err(e) => self.on_failure(e).await,
        }
    }

    async fn catch_up(&self, cancel: &CancellationToken) -> Result<usize> {
        let mut processed = 0;
        while !cancel.is_cancelled() {
            match self.fetcher.step().await? {
                Some(_) => processed += 1,
                None => break,
            }
        }
        if processed > 0 {
            self.fetcher
                .refresh_confirmations(self.settings.confirmation_depth)
                .context("Failed to refresh confirmations")?;
        }
        Ok(processed)
    }

    async fn on_failure(&mut self, err: anyhow::Error) {
        let network = self.fetcher.network();
        let stale = stale_cursor(&err).is_some();

        if stale && self.settings.auto_reorg {
            match self.resolve_reorg().await {
                Ok(ancestor) => {
                    warn!(network, ancestor, "Resolved reorg, resuming from common ancestor");
                    return;
                }
                Err(reorg_err) => {
                    error!(network, "Failed to resolve reorg: {:#}", reorg_err);
                }
            }
        }

        self.consecutive_failures += 1;
        warn!(
            network,
            failures = self.consecutive_failures,
            timeout = is_timeout(&err),
            "Watcher iteration failed: {:#}",
            err
        );

        let escalate = stale || self.consecutive_failures >= self.settings.alert_threshold;
        if escalate && !self.alerted {
            self.alerted = true;
            self.dispatcher
                .emit(Event::Alert {
                    network,
                    consecutive_failures: self.consecutive_failures,
                    reason: format!("{:#}", err),
                })
                .await;
        }
    }

    /// Walk back from the cursor to the newest block whose persisted hash
    /// matches the provider's, rewind the cursor there, and return its
    /// number.
    ///
    /// Fails when the cursor block itself is still canonical: the provider
    /// then disagrees with itself about the next block, and rewinding would
    /// not change anything.
    async fn resolve_reorg(&self) -> Result<u64> {
        let network = self.fetcher.network();
        let cursor = self
            .fetcher
            .cursor()
            .get(network)?
            .context("Stale cursor without a cursor")?;
        let lowest = cursor.number.saturating_sub(self.settings.max_reorg_depth);

        for number in (lowest..=cursor.number).rev() {
            let Some(stored) = self.store.get_block_hash(network, number)? else {
                anyhow::bail!("No persisted block at {} to compare against", number);
            };
            let canonical = self
                .provider
                .get_block(number)
                .await
                .with_context(|| format!("Failed to fetch block {} during reorg walk-back", number))?
                .with_context(|| format!("Provider has no block {}", number))?;
            if canonical.hash == stored {
                if number == cursor.number {
                    anyhow::bail!(
                        "Block {} is still canonical but its successor does not extend it",
                        number
                    );
                }
                self.fetcher.cursor().rewind(network, number, stored)?;
                return Ok(number);
            }
            debug!(network, number, "block orphaned by reorg");
        }

        anyhow::bail!(
            "Reorg deeper than {} blocks below {}",
            self.settings.max_reorg_depth,
            cursor.number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::Recorder;
    use crate::events::Topic;
    use crate::registry::Registry;
    use crate::rpc::testing::{transaction, MockProvider};
    use crate::store::fixtures::{block_hash, create_test_store};
    use alloy_primitives::{address, Address, B256};

    const WATCHED: Address = address!("0000000000000000000000000000000000000abc");

    struct Setup {
        provider: Arc<MockProvider>,
        store: Arc<dyn Persistence>,
        recorder: Arc<Recorder>,
        watcher: NetworkWatcher,
        _temp_dir: tempfile::TempDir,
    }

    fn setup(settings: WatcherSettings) -> Setup {
        let (store, temp_dir) = create_test_store();
        let store: Arc<dyn Persistence> = Arc::new(store);
        let provider = Arc::new(MockProvider::default());
        let registry = Arc::new(Registry::load(store.clone()).unwrap());
        registry.register(WATCHED).unwrap();
        let recorder = Recorder::new(&[Topic::Alert]);
        let dispatcher = Arc::new(EventDispatcher::builder().subscribe(recorder.clone()).build());
        let fetcher = BlockFetcher::new(
            1,
            Some(1),
            provider.clone(),
            store.clone(),
            registry,
            dispatcher.clone(),
        );
        let watcher = NetworkWatcher::new(fetcher, provider.clone(), store.clone(), dispatcher, settings);
        Setup {
            provider,
            store,
            recorder,
            watcher,
            _temp_dir: temp_dir,
        }
    }

    fn settings(auto_reorg: bool) -> WatcherSettings {
        WatcherSettings {
            poll_interval: Duration::from_millis(10),
            alert_threshold: 3,
            auto_reorg,
            max_reorg_depth: 10,
            confirmation_depth: 12,
        }
    }

    #[tokio::test]
    async fn test_alert_once_per_failure_streak() {
        let mut s = setup(settings(true));
        let cancel = CancellationToken::new();
        s.provider.set_offline(true);

        for _ in 0..5 {
            s.watcher.tick(&cancel).await;
        }
        let alerts = s.recorder.events();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            alerts[0],
            Event::Alert {
                network: 1,
                consecutive_failures: 3,
                ..
            }
        ));

        // Recovery ends the streak; the next streak alerts again.
        s.provider.set_offline(false);
        s.watcher.tick(&cancel).await;
        s.provider.set_offline(true);
        for _ in 0..3 {
            s.watcher.tick(&cancel).await;
        }
        assert_eq!(s.recorder.events().len(), 2);
    }

    #[tokio::test]
    async fn test_reorg_resolved_by_walk_back() {
        let mut s = setup(settings(true));
        let cancel = CancellationToken::new();
        for number in 1..=5 {
            s.provider.push_block(number, vec![]);
        }
        s.watcher.tick(&cancel).await;
        assert_eq!(s.store.get_cursor(1).unwrap().unwrap().number, 5);

        // Blocks 4 and 5 are replaced and the chain grows to 6.
        {
            let mut blocks = s.provider.blocks.lock().unwrap();
            let mut parent = block_hash(3);
            for number in 4..=6u64 {
                let mut block = blocks.get(&3).unwrap().clone();
                block.number = number;
                block.hash = B256::repeat_byte(0xf0 + number as u8);
                block.parent_hash = parent;
                parent = block.hash;
                blocks.insert(number, block);
            }
        }

        // Stale cursor, rewound to 3.
        s.watcher.tick(&cancel).await;
        let cursor = s.store.get_cursor(1).unwrap().unwrap();
        assert_eq!((cursor.number, cursor.hash), (3, block_hash(3)));
        assert!(s.recorder.events().is_empty());

        // Resumes on the new branch.
        s.watcher.tick(&cancel).await;
        let cursor = s.store.get_cursor(1).unwrap().unwrap();
        assert_eq!((cursor.number, cursor.hash), (6, B256::repeat_byte(0xf6)));
        assert_eq!(s.store.get_block_hash(1, 4).unwrap(), Some(B256::repeat_byte(0xf4)));
    }

    #[tokio::test]
    async fn test_stale_cursor_alerts_without_auto_reorg() {
        let mut s = setup(settings(false));
        let cancel = CancellationToken::new();
        s.provider.push_block(1, vec![]);
        s.watcher.tick(&cancel).await;

        let mut orphan = s.provider.push_block(2, vec![]);
        orphan.parent_hash = B256::repeat_byte(0x99);
        s.provider.blocks.lock().unwrap().insert(2, orphan);

        s.watcher.tick(&cancel).await;
        assert_eq!(s.recorder.events().len(), 1);
        assert_eq!(s.store.get_cursor(1).unwrap().unwrap().number, 1);
    }

    #[tokio::test]
    async fn test_inconsistent_successor_alerts_with_auto_reorg() {
        let mut s = setup(settings(true));
        let cancel = CancellationToken::new();
        s.provider.push_block(1, vec![]);
        s.watcher.tick(&cancel).await;

        // Block 1 stays canonical, block 2 points elsewhere.
        let mut orphan = s.provider.push_block(2, vec![]);
        orphan.parent_hash = B256::repeat_byte(0x99);
        s.provider.blocks.lock().unwrap().insert(2, orphan);

        s.watcher.tick(&cancel).await;
        s.watcher.tick(&cancel).await;
        let alerts = s.recorder.events();
        assert_eq!(alerts.len(), 1);
        assert!(matches!(
            alerts[0],
            Event::Alert {
                network: 1,
                consecutive_failures: 1,
                ..
            }
        ));
        assert_eq!(s.watcher.consecutive_failures, 2);
        assert_eq!(s.store.get_cursor(1).unwrap().unwrap().number, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel_with_cursor_persisted() {
        let s = setup(settings(true));
        for number in 1..=3 {
            s.provider
                .push_block(number, vec![transaction(number as u8, WATCHED, None)]);
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(s.watcher.run(cancel.clone()));

        let mut reached = false;
        for _ in 0..200 {
            if s.store.get_cursor(1).unwrap().map(|c| c.number) == Some(3) {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert!(reached);
        assert_eq!(s.store.get_transactions_in_range(1, 0, 10).unwrap().len(), 3);
    }
}
