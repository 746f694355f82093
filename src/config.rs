//! Configuration for the discovery protocol.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dht::{DhtConfig, DEFAULT_ALPHA, DEFAULT_BUCKET_SIZE};
use crate::error::{DiscoveryError, DiscoveryResult};
use crate::protocol::MAX_CLOSER_PEERS;

/// Default listen address of the binary.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:20338";

const DEFAULT_REFRESH_PERIOD_MS: u64 = 10_000;
const DEFAULT_REFRESH_QUERY_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_SEARCH_SWEEP_INTERVAL_MS: u64 = 5 * 60 * 1000;
const DEFAULT_SEARCH_STALE_AFTER_MS: u64 = 3 * 60 * 1000;

fn default_listen() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

const fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE
}

const fn default_alpha() -> usize {
    DEFAULT_ALPHA
}

const fn default_refresh_period_ms() -> u64 {
    DEFAULT_REFRESH_PERIOD_MS
}

const fn default_refresh_query_timeout_ms() -> u64 {
    DEFAULT_REFRESH_QUERY_TIMEOUT_MS
}

const fn default_search_sweep_interval_ms() -> u64 {
    DEFAULT_SEARCH_SWEEP_INTERVAL_MS
}

const fn default_search_stale_after_ms() -> u64 {
    DEFAULT_SEARCH_STALE_AFTER_MS
}

/// Discovery settings. Every field has a default, so an empty TOML file is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Address the TCP listener binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Peers dialed on startup, `host:port`.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Kademlia bucket size (k parameter).
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// Peers queried per lookup round.
    #[serde(default = "default_alpha")]
    pub alpha: usize,

    /// Period of the self-lookup and bucket-refresh loops.
    #[serde(default = "default_refresh_period_ms")]
    pub refresh_period_ms: u64,

    /// Upper bound on a single outbound query issued by a refresh loop.
    #[serde(default = "default_refresh_query_timeout_ms")]
    pub refresh_query_timeout_ms: u64,

    /// How often stale recursive searches are swept.
    #[serde(default = "default_search_sweep_interval_ms")]
    pub search_sweep_interval_ms: u64,

    /// Age after which a recursive search is dropped by the sweep.
    #[serde(default = "default_search_stale_after_ms")]
    pub search_stale_after_ms: u64,

    /// IP addresses hidden from requesters outside this set.
    #[serde(default)]
    pub mask: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            seeds: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            alpha: DEFAULT_ALPHA,
            refresh_period_ms: DEFAULT_REFRESH_PERIOD_MS,
            refresh_query_timeout_ms: DEFAULT_REFRESH_QUERY_TIMEOUT_MS,
            search_sweep_interval_ms: DEFAULT_SEARCH_SWEEP_INTERVAL_MS,
            search_stale_after_ms: DEFAULT_SEARCH_STALE_AFTER_MS,
            mask: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn refresh_period(&self) -> Duration {
        Duration::from_millis(self.refresh_period_ms)
    }

    pub fn refresh_query_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_query_timeout_ms)
    }

    pub fn search_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.search_sweep_interval_ms)
    }

    pub fn search_stale_after(&self) -> Duration {
        Duration::from_millis(self.search_stale_after_ms)
    }

    /// Routing parameters for the DHT facade.
    ///
    /// Zero values for the bucket size or fan-out are raised to one. The
    /// fan-out is capped at what a single FindNode response can carry.
    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            bucket_size: self.bucket_size.max(1),
            alpha: self.alpha.clamp(1, MAX_CLOSER_PEERS),
            refresh_period: self.refresh_period(),
            refresh_query_timeout: self.refresh_query_timeout(),
        }
    }

    /// Parse the mask list into canonical IP addresses.
    pub fn mask_set(&self) -> DiscoveryResult<HashSet<IpAddr>> {
        self.mask
            .iter()
            .map(|raw| {
                raw.trim()
                    .parse::<IpAddr>()
                    .map(|ip| ip.to_canonical())
                    .map_err(|_| DiscoveryError::InvalidMask(raw.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.listen, "0.0.0.0:20338");
        assert_eq!(config.bucket_size, 20);
        assert_eq!(config.alpha, 3);
        assert_eq!(config.refresh_period(), Duration::from_secs(10));
        assert_eq!(config.search_sweep_interval(), Duration::from_secs(300));
        assert_eq!(config.search_stale_after(), Duration::from_secs(180));
        assert!(config.mask_set().expect("empty mask").is_empty());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = DiscoveryConfig::from_toml_str("").expect("parses");
        assert_eq!(config, DiscoveryConfig::default());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = DiscoveryConfig::from_toml_str(
            r#"
            seeds = ["10.0.0.1:20338"]
            alpha = 5
            refresh_period_ms = 250
            mask = ["10.0.0.1", "::ffff:10.0.0.2"]
            "#,
        )
        .expect("parses");
        assert_eq!(config.seeds, vec!["10.0.0.1:20338".to_string()]);
        assert_eq!(config.alpha, 5);
        assert_eq!(config.bucket_size, 20);
        assert_eq!(config.dht_config().refresh_period, Duration::from_millis(250));

        let mask = config.mask_set().expect("valid mask");
        assert!(mask.contains(&"10.0.0.1".parse::<IpAddr>().expect("ip")));
        assert!(mask.contains(&"10.0.0.2".parse::<IpAddr>().expect("ip")));
    }

    #[test]
    fn invalid_mask_entry_is_reported() {
        let config = DiscoveryConfig {
            mask: vec!["not-an-ip".into()],
            ..DiscoveryConfig::default()
        };
        assert!(matches!(
            config.mask_set(),
            Err(DiscoveryError::InvalidMask(entry)) if entry == "not-an-ip"
        ));
    }

    #[test]
    fn zero_parameters_are_clamped() {
        let config = DiscoveryConfig {
            bucket_size: 0,
            alpha: 0,
            ..DiscoveryConfig::default()
        };
        let dht = config.dht_config();
        assert_eq!(dht.bucket_size, 1);
        assert_eq!(dht.alpha, 1);
    }

    #[test]
    fn alpha_is_capped_to_response_limit() {
        let config = DiscoveryConfig {
            alpha: MAX_CLOSER_PEERS + 1,
            ..DiscoveryConfig::default()
        };
        assert_eq!(config.dht_config().alpha, MAX_CLOSER_PEERS);
    }
}
