use std::time::Duration;

use serde::Deserialize;

use crate::app::error::ProbeError;

/// Tunables for one probe run (§4.C config table).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub requests_per_endpoint: u32,
    pub timeout_ms: u64,
    pub max_wait_ms: u64,
    pub requests_between_pause: u32,
    pub request_pause_ms: u64,
    pub receive_wait_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            requests_per_endpoint: 5,
            timeout_ms: 10_000,
            max_wait_ms: 500,
            requests_between_pause: 10,
            request_pause_ms: 1,
            receive_wait_ms: 10,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.requests_per_endpoint == 0 {
            return Err(ProbeError::ConfigInvalid(
                "requests_per_endpoint must be > 0".into(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ProbeError::ConfigInvalid("timeout_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn request_pause(&self) -> Duration {
        Duration::from_millis(self.request_pause_ms)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    /// Highest sequence number this run could ever send, used by
    /// `decode_response`'s bounds check.
    pub fn max_sequence(&self) -> u8 {
        (self.requests_per_endpoint.saturating_sub(1)).min(u8::MAX as u32) as u8
    }
}
