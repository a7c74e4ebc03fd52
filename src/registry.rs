//! Registry of watched addresses
//!
//! Decides whether a transaction is relevant to the indexer. Addresses are
//! held as 20-byte values, so comparisons ignore the case of their textual
//! form.

use crate::config::parse_address;
use crate::events::{Event, EventHandler, Topic};
use crate::records::{unix_now, RegistryEntry};
use crate::store::Persistence;
use crate::types::Transaction;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// In-memory view of the registry, backed by the persistence layer.
pub struct Registry {
    store: Arc<dyn Persistence>,
    addresses: RwLock<HashSet<Address>>,
    /// Bumped after every newly registered address becomes visible
    generation: AtomicU64,
}

impl Registry {
    /// Load every persisted registry entry.
    pub fn load(store: Arc<dyn Persistence>) -> Result<Self> {
        let addresses = store
            .list_registry()
            .context("Failed to load registry")?
            .into_iter()
            .map(|entry| entry.address)
            .collect::<HashSet<_>>();
        info!("Loaded {} registered addresses", addresses.len());
        Ok(Self {
            store,
            addresses: RwLock::new(addresses),
            generation: AtomicU64::new(0),
        })
    }

    /// Register `address`.
    ///
    /// Returns true when the address was not registered before; the caller
    /// announces new entries with an [`Event::Registration`].
    pub fn register(&self, address: Address) -> Result<bool> {
        let inserted = self
            .store
            .insert_registry_entry(&RegistryEntry {
                address,
                added_at: unix_now(),
                backfilled_through: Default::default(),
            })
            .with_context(|| format!("Failed to register 0x{:x}", address))?;

        let added = self
            .addresses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(address);
        if added {
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        if inserted {
            info!("Registered 0x{:x}", address);
        }
        Ok(inserted)
    }

    /// Counter that changes whenever an address is added.
    ///
    /// A reader that sees the same generation before and after a filtering
    /// pass knows no address was added in between.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Whether `address` is registered.
    pub fn contains(&self, address: Address) -> bool {
        self.addresses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&address)
    }

    /// Snapshot of the registered addresses, sorted.
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> = self
            .addresses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .copied()
            .collect();
        addresses.sort_unstable();
        addresses
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.addresses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `tx` was sent by or addressed to a registered address.
    ///
    /// Contract creations have no recipient and only match on the sender.
    pub fn is_relevant(&self, tx: &Transaction) -> bool {
        let addresses = self
            .addresses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        addresses.contains(&tx.from) || tx.to.is_some_and(|to| addresses.contains(&to))
    }
}

/// Registers addresses announced through webhook deliveries.
///
/// Accepts payloads of the form
/// `{"event": "registration", "addresses": ["0x...", ...]}`; everything else
/// is ignored.
pub struct RegistrationHook {
    registry: Arc<Registry>,
}

impl RegistrationHook {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl EventHandler for RegistrationHook {
    fn name(&self) -> &'static str {
        "registration-hook"
    }

    fn handles(&self, topic: Topic) -> bool {
        topic == Topic::Webhook
    }

    async fn handle(&self, event: &Event) -> Result<Vec<Event>> {
        let Event::Webhook { payload } = event else {
            return Ok(Vec::new());
        };
        if payload.get("event").and_then(Value::as_str) != Some("registration") {
            return Ok(Vec::new());
        }

        let mut follow_ups = Vec::new();
        let listed = payload
            .get("addresses")
            .and_then(Value::as_array)
            .context("Registration payload has no 'addresses' array")?;
        for value in listed {
            let Some(text) = value.as_str() else {
                warn!("Skipping non-string address in registration payload");
                continue;
            };
            let address = match parse_address(text) {
                Ok(address) => address,
                Err(e) => {
                    warn!("Skipping invalid address {}: {:#}", text, e);
                    continue;
                }
            };
            if self.registry.register(address)? {
                follow_ups.push(Event::Registration { address });
            }
        }
        Ok(follow_ups)
    }
}
