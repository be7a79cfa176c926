//! Cache coordination configuration.
//!
//! Controls polling, leasing, and key derivation through the `[cache]` section.

use std::time::Duration;

use serde::Deserialize;

use crate::domain::request::ResponseFormat;

use super::keys::MetricOrdering;

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_MAX_WAIT_CYCLES: u32 = 29;
const DEFAULT_LEASE_SECS: u64 = 15;

/// Cache configuration from `ondata.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When disabled every request is computed directly.
    pub enabled: bool,
    /// Delay between two inspections of an in-progress entry.
    pub poll_interval_secs: u64,
    /// Inspections (and reclaims) allowed before falling back to direct computation.
    pub max_wait_cycles: u32,
    /// Lease duration held by the producer; renewed after every chunk.
    pub lease_secs: u64,
    /// Metric ordering used when hashing cache keys.
    pub key_metric_order: MetricOrdering,
    /// Formats answered with a redirect once cached; others are served inline.
    pub redirect_formats: Vec<ResponseFormat>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_wait_cycles: DEFAULT_MAX_WAIT_CYCLES,
            lease_secs: DEFAULT_LEASE_SECS,
            key_metric_order: MetricOrdering::default(),
            redirect_formats: vec![
                ResponseFormat::Csv,
                ResponseFormat::Json,
                ResponseFormat::Jsonl,
                ResponseFormat::Xml,
            ],
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            enabled: settings.enabled,
            poll_interval_secs: settings.poll_interval.as_secs(),
            max_wait_cycles: settings.max_wait_cycles,
            lease_secs: settings.lease.as_secs(),
            key_metric_order: settings.key_metric_order,
            redirect_formats: settings.redirect_formats.clone(),
        }
    }
}

impl CacheConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn redirects(&self, format: ResponseFormat) -> bool {
        self.redirect_formats.contains(&format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.max_wait_cycles, 29);
        assert_eq!(config.lease_duration(), Duration::from_secs(15));
        assert_eq!(config.key_metric_order, MetricOrdering::Sorted);
    }

    #[test]
    fn redirects_only_listed_formats() {
        let config = CacheConfig {
            redirect_formats: vec![ResponseFormat::Csv],
            ..Default::default()
        };
        assert!(config.redirects(ResponseFormat::Csv));
        assert!(!config.redirects(ResponseFormat::Json));
    }
}
