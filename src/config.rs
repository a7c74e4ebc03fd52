//! Configuration and registry seed loading
//!
//! The daemon reads a TOML file; every setting has a default so a file only
//! needs to name its networks. The registry seed list is a plain text file
//! with one address per line.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A chain the indexer follows.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkConfig {
    /// Chain ID
    pub id: u64,
    pub rpc_url: String,
    /// First block to index when the network has no cursor yet
    #[serde(default)]
    pub start_block: Option<u64>,
    /// Keys index endpoint; renewal scans are skipped without one
    #[serde(default)]
    pub subgraph_url: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Webhook ingress settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub listen: SocketAddr,
    /// Shared HMAC secret; the ingress is disabled when empty
    pub secret: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            secret: String::new(),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub networks: Vec<NetworkConfig>,
    pub db_path: PathBuf,
    /// Timeout of every provider and keys index call
    pub rpc_timeout_ms: u64,
    /// Blocks below the cursor scanned when an address is registered
    pub backfill_window: u64,
    /// Block span of each `eth_getLogs` request during backfill
    pub log_chunk: u64,
    /// Consecutive failed iterations before a network raises an alert
    pub alert_threshold: u32,
    /// Rewind the cursor to the common ancestor on a stale cursor
    pub auto_reorg: bool,
    /// Deepest reorg resolved automatically
    pub max_reorg_depth: u64,
    /// Renewal window in seconds, unbounded when zero
    pub renewal_within_secs: u64,
    pub renewal_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Blocks below the tip whose transactions get confirmations refreshed
    pub confirmation_depth: u64,
    pub webhook: WebhookConfig,
    /// Notification endpoint; notifications are disabled without one
    pub notifier_url: Option<String>,
    /// Addresses registered at startup
    pub registry_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            db_path: PathBuf::from("./rover_db"),
            rpc_timeout_ms: 10_000,
            backfill_window: 10_000,
            log_chunk: 2_000,
            alert_threshold: 5,
            auto_reorg: true,
            max_reorg_depth: 64,
            renewal_within_secs: 86_400,
            renewal_interval_secs: 3_600,
            reconcile_interval_secs: 600,
            confirmation_depth: 12,
            webhook: WebhookConfig::default(),
            notifier_url: None,
            registry_file: None,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    12
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for network in &self.networks {
            if !seen.insert(network.id) {
                anyhow::bail!("Network {} is configured twice", network.id);
            }
            if network.poll_interval_secs == 0 {
                anyhow::bail!("Network {} has a zero poll interval", network.id);
            }
        }
        if self.log_chunk == 0 {
            anyhow::bail!("log_chunk must be positive");
        }
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Renewal window, None when unbounded.
    pub fn renewal_within(&self) -> Option<u64> {
        Some(self.renewal_within_secs).filter(|w| *w > 0)
    }
}

/// Load the registry seed list.
///
/// Each line holds one address in hex, with or without 0x prefix. Empty
/// lines and lines starting with '#' are ignored.
///
/// # Example file format:
/// ```text
/// 0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb
/// # This is a comment
/// 0xdAC17F958D2ee523a2206206994597C13D831ec7
/// ```
pub fn load_registry_seed(path: &Path) -> Result<Vec<Address>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read registry file: {:?}", path))?;

    let mut addresses = Vec::new();
    for (line_num, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let addr = parse_address(line)
            .with_context(|| format!("Invalid address on line {}: {}", line_num + 1, line))?;
        addresses.push(addr);
    }

    Ok(addresses)
}

/// Parse an address from a hex string.
///
/// Accepts addresses with or without 0x prefix, in any letter case.
pub fn parse_address(s: &str) -> Result<Address> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("Invalid hex address: {}", s))?;

    if bytes.len() != 20 {
        anyhow::bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }

    Ok(Address::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_registry_seed() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0x0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap();
        writeln!(file, "# This is a comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "dAC17F958D2ee523a2206206994597C13D831ec7").unwrap();
        file.flush().unwrap();

        let addresses = load_registry_seed(file.path()).unwrap();
        assert_eq!(addresses.len(), 2);
    }

    #[test]
    fn test_load_registry_seed_rejects_bad_line() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "0x1234").unwrap();
        file.flush().unwrap();
        let err = load_registry_seed(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("line 1"));
    }

    #[test]
    fn test_parse_address_ignores_case() {
        let lower = parse_address("0x0742d35cc6634c0532925a3b844bc9e7595f0beb").unwrap();
        let upper = parse_address("0X0742D35CC6634C0532925A3B844BC9E7595F0BEB").unwrap();
        let bare = parse_address("0742d35Cc6634C0532925a3b844Bc9e7595f0bEb").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, bare);
        assert!(parse_address("0x0742d35cc6634c0532925a3b844bc9e7595f0be").is_err());
    }

    #[test]
    fn test_load_config_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
db_path = "/var/lib/rover"
auto_reorg = false

[[networks]]
id = 1
rpc_url = "http://127.0.0.1:8545"
start_block = 19000000
subgraph_url = "http://127.0.0.1:8000/subgraphs/name/locks"

[[networks]]
id = 137
rpc_url = "http://127.0.0.1:8546"
poll_interval_secs = 2

[webhook]
secret = "s3cret"
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.networks.len(), 2);
        assert_eq!(config.networks[0].start_block, Some(19_000_000));
        assert_eq!(config.networks[0].poll_interval(), Duration::from_secs(12));
        assert_eq!(config.networks[1].poll_interval(), Duration::from_secs(2));
        assert_eq!(config.networks[1].subgraph_url, None);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rover"));
        assert!(!config.auto_reorg);
        assert_eq!(config.alert_threshold, 5);
        assert_eq!(config.webhook.secret, "s3cret");
        assert_eq!(config.webhook.listen, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.renewal_within(), Some(86_400));
    }

    #[test]
    fn test_duplicate_network_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[networks]]
id = 1
rpc_url = "http://a"

[[networks]]
id = 1
rpc_url = "http://b"
"#
        )
        .unwrap();
        file.flush().unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
