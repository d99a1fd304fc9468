use std::time::Duration;

use serde::Deserialize;

use crate::app::error::DiscoveryError;

const DEFAULT_URI_TEMPLATE: &str = "https://qos.multiplay.com/v1/fleets/{fleet}/servers";

/// Tunables for the discovery client (§4.D, §6 configuration surface).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub request_timeout_sec: u64,
    pub request_retries: u32,
    pub failure_cache_time_ms: u64,
    pub success_cache_time_ms: u64,
    pub discovery_service_uri: String,
    pub fleet_id: String,
    pub use_gzip: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            request_timeout_sec: 10,
            request_retries: 2,
            failure_cache_time_ms: 1_000,
            success_cache_time_ms: 30_000,
            discovery_service_uri: DEFAULT_URI_TEMPLATE.to_string(),
            fleet_id: String::new(),
            use_gzip: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.fleet_id.is_empty() {
            return Err(DiscoveryError::ConfigInvalid(
                "fleet_id must not be empty".into(),
            ));
        }
        if !self.discovery_service_uri.contains("{fleet}") {
            return Err(DiscoveryError::ConfigInvalid(
                "discovery_service_uri must contain a {fleet} placeholder".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_sec)
    }

    pub fn failure_cache_time(&self) -> Duration {
        Duration::from_millis(self.failure_cache_time_ms)
    }

    pub fn success_cache_time(&self) -> Duration {
        Duration::from_millis(self.success_cache_time_ms)
    }

    /// The fleet-id is percent-encoded before substitution: it arrives from
    /// configuration, not validated input, and may contain characters that
    /// would otherwise split the path.
    pub fn resolved_url(&self) -> String {
        use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
        let encoded = utf8_percent_encode(&self.fleet_id, NON_ALPHANUMERIC).to_string();
        self.discovery_service_uri.replace("{fleet}", &encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg = DiscoveryConfig {
            fleet_id: "x".into(),
            ..Default::default()
        };
        assert_eq!(cfg.request_timeout_sec, 10);
        assert_eq!(cfg.request_retries, 2);
        assert_eq!(cfg.failure_cache_time_ms, 1_000);
        assert_eq!(cfg.success_cache_time_ms, 30_000);
        assert!(cfg.use_gzip);
        assert_eq!(cfg.discovery_service_uri, DEFAULT_URI_TEMPLATE);
    }

    #[test]
    fn validate_rejects_empty_fleet_id() {
        let cfg = DiscoveryConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn resolved_url_substitutes_and_encodes_fleet_id() {
        let cfg = DiscoveryConfig {
            fleet_id: "my fleet/1".into(),
            ..Default::default()
        };
        let url = cfg.resolved_url();
        assert!(url.starts_with("https://qos.multiplay.com/v1/fleets/"));
        assert!(url.ends_with("/servers"));
        assert!(!url.contains("{fleet}"));
        assert!(url.contains("my%20fleet%2F1"));
    }
}
