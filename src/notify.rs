//! Expiration notifications
//!
//! Turns renewal notices into outbound notifications. Each (lock, key,
//! email) triple is recorded before sending, so retries and overlapping
//! scans never notify the same holder twice for the same key.

use crate::events::{Event, EventHandler, Topic};
use crate::records::Key;
use crate::store::Persistence;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Document sent to the notification endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub template: &'static str,
    pub recipient: String,
    pub network: u64,
    pub lock_address: Address,
    pub lock_name: Option<String>,
    pub key_id: String,
    /// Unix epoch seconds
    pub expiration: u64,
}

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Posts notifications as JSON to an HTTP endpoint.
pub struct HttpNotifier {
    client: reqwest::Client,
    url: String,
}

impl HttpNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build notifier HTTP client")?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .context("Failed to send notification")?
            .error_for_status()
            .context("Notification endpoint rejected the request")?;
        Ok(())
    }
}

/// Notifies key holders whose keys are due for renewal.
pub struct ExpirationNotifier {
    store: Arc<dyn Persistence>,
    notifier: Arc<dyn Notifier>,
}

impl ExpirationNotifier {
    pub fn new(store: Arc<dyn Persistence>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Notify the holder of `key`. Returns whether a notification was sent.
    pub async fn notify(&self, key: &Key) -> Result<bool> {
        let Some(contact) = self.store.get_contact(key.lock_address, key.owner)? else {
            debug!(
                network = key.network,
                "no contact for holder 0x{:x} of lock 0x{:x}",
                key.owner,
                key.lock_address
            );
            return Ok(false);
        };

        let key_id = key.id();
        if !self
            .store
            .record_dispatch(key.lock_address, &key_id, &contact.email)?
        {
            debug!(key = %key_id, "expiration notice already dispatched");
            return Ok(false);
        }

        let lock_name = self
            .store
            .get_lock(key.network, key.lock_address)?
            .map(|lock| lock.name)
            .filter(|name| !name.is_empty());
        let notification = Notification {
            template: "keyExpiring",
            recipient: contact.email,
            network: key.network,
            lock_address: key.lock_address,
            lock_name,
            key_id,
            expiration: key.expiration,
        };
        self.notifier
            .send(&notification)
            .await
            .with_context(|| format!("Failed to notify holder of key {}", notification.key_id))?;
        info!(network = key.network, key = %notification.key_id, "Sent expiration notice");
        Ok(true)
    }
}

#[async_trait]
impl EventHandler for ExpirationNotifier {
    fn name(&self) -> &'static str {
        "expiration-notifier"
    }

    fn handles(&self, topic: Topic) -> bool {
        topic == Topic::RenewalDue
    }

    async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
        if let Event::RenewalDue { key } = event {
            self.notify(key).await?;
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MockNotifier {
        pub(crate) sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for MockNotifier {
        async fn send(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }
}
