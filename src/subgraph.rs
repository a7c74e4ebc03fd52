//! Keys index client
//!
//! The keys index is a subgraph that projects lock and key state. The
//! renewal scan only needs one query from it: keys expiring in a window,
//! paged.

use crate::config::parse_address;
use crate::error::RpcError;
use crate::records::Key;
use alloy_primitives::{Address, U256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

/// Parameters of [`KeysIndex::get_keys_to_renew`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysQuery {
    /// Lower expiration bound (inclusive), unbounded when None
    pub start: Option<u64>,
    /// Upper expiration bound (inclusive)
    pub end: u64,
    pub network: u64,
    /// Zero-based page number
    pub page: u64,
    /// Page size
    pub limit: u64,
    pub minimum_lock_version: u64,
    /// Include keys of locks priced in the native currency
    pub allow_native_currency: bool,
}

/// Source of keys approaching expiration.
#[async_trait]
pub trait KeysIndex: Send + Sync {
    async fn get_keys_to_renew(&self, query: &KeysQuery) -> Result<Vec<Key>>;
}

const KEYS_TO_RENEW: &str = r#"
query KeysToRenew($first: Int!, $skip: Int!, $start: BigInt!, $end: BigInt!, $minimumLockVersion: BigInt!) {
  keys(
    first: $first
    skip: $skip
    orderBy: expiration
    orderDirection: asc
    where: {
      expiration_gte: $start
      expiration_lte: $end
      lock_: { version_gte: $minimumLockVersion }
    }
  ) {
    tokenId
    owner
    expiration
    lock {
      address
      version
      tokenAddress
    }
  }
}
"#;

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<KeysData>,
    #[serde(default)]
    errors: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct KeysData {
    keys: Vec<GraphKey>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphKey {
    token_id: String,
    owner: String,
    expiration: String,
    lock: GraphLock,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphLock {
    address: String,
    version: String,
    token_address: Option<String>,
}

impl GraphKey {
    fn into_key(self, network: u64) -> Result<Key> {
        let currency = match self.lock.token_address.as_deref() {
            None => None,
            Some(text) => Some(parse_address(text)?).filter(|addr| *addr != Address::ZERO),
        };
        Ok(Key {
            lock_address: parse_address(&self.lock.address)?,
            token_id: self
                .token_id
                .parse::<U256>()
                .with_context(|| format!("Invalid tokenId: {}", self.token_id))?,
            owner: parse_address(&self.owner)?,
            expiration: self
                .expiration
                .parse()
                .with_context(|| format!("Invalid expiration: {}", self.expiration))?,
            network,
            lock_version: self
                .lock
                .version
                .parse()
                .with_context(|| format!("Invalid lock version: {}", self.lock.version))?,
            currency,
        })
    }
}

/// GraphQL client of one network's subgraph.
pub struct SubgraphClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl SubgraphClient {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }

    async fn post(&self, body: &Value) -> Result<GraphResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .context("Failed to send subgraph query")?;
        response
            .json()
            .await
            .context("Failed to parse subgraph response")
    }
}

#[async_trait]
impl KeysIndex for SubgraphClient {
    async fn get_keys_to_renew(&self, query: &KeysQuery) -> Result<Vec<Key>> {
        let body = json!({
            "query": KEYS_TO_RENEW,
            "variables": {
                "first": query.limit,
                "skip": query.page * query.limit,
                "start": query.start.unwrap_or(0).to_string(),
                "end": query.end.to_string(),
                "minimumLockVersion": query.minimum_lock_version.to_string(),
            }
        });

        let response = match tokio::time::timeout(self.timeout, self.post(&body)).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(RpcError::Timeout {
                    method: "keysToRenew".to_string(),
                    timeout: self.timeout,
                }
                .into())
            }
        };
        if !response.errors.is_empty() {
            anyhow::bail!("Subgraph returned errors: {}", Value::from(response.errors));
        }
        let data = response.data.context("Subgraph response missing 'data'")?;
        Ok(page_keys(data.keys, query))
    }
}

/// Convert one page of index keys, skipping malformed ones.
fn page_keys(raw: Vec<GraphKey>, query: &KeysQuery) -> Vec<Key> {
    let mut keys = Vec::with_capacity(raw.len());
    for raw in raw {
        let token_id = raw.token_id.clone();
        let key = match raw.into_key(query.network) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    network = query.network,
                    page = query.page,
                    "Skipping malformed key {}: {:#}",
                    token_id,
                    e
                );
                continue;
            }
        };
        if key.currency.is_none() && !query.allow_native_currency {
            continue;
        }
        keys.push(key);
    }
    keys
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Serves a fixed key list in pages and records every query.
    #[derive(Default)]
    pub(crate) struct MockKeysIndex {
        pub(crate) keys: Mutex<Vec<Key>>,
        pub(crate) queries: Mutex<Vec<KeysQuery>>,
    }

    #[async_trait]
    impl KeysIndex for MockKeysIndex {
        async fn get_keys_to_renew(&self, query: &KeysQuery) -> Result<Vec<Key>> {
            self.queries.lock().unwrap().push(query.clone());
            let keys = self.keys.lock().unwrap();
            Ok(keys
                .iter()
                .skip((query.page * query.limit) as usize)
                .take(query.limit as usize)
                .cloned()
                .collect())
        }
    }
}
