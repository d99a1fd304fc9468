//! Thread-safe per-endpoint statistics store (§4.E).

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::trace;

use crate::app::error::StatsError;
use crate::app::probe::{ProbeResult, INVALID_LATENCY, INVALID_PACKET_LOSS};

use super::config::StatsConfig;
use super::history::{Sample, StatHistory};

pub struct StatsStore {
    cfg: StatsConfig,
    histories: RwLock<HashMap<String, StatHistory>>,
}

impl StatsStore {
    pub fn new(cfg: StatsConfig) -> Result<Self, StatsError> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            histories: RwLock::new(HashMap::new()),
        })
    }

    /// Feed one endpoint's latest `ProbeResult` in. An unreachable result
    /// (either sentinel set) evicts the whole history for `key` rather than
    /// being recorded, so a dead endpoint can't keep winning on stale good
    /// samples (§4.E auto-eviction rule, §8 property 7).
    pub fn process(&self, key: &str, result: &ProbeResult) {
        let latency = result.average_latency_ms();
        let loss = result.packet_loss();
        if latency == INVALID_LATENCY || loss == INVALID_PACKET_LOSS {
            if self.histories.write().remove(key).is_some() {
                trace!("evicted stats history for {key} (unreachable result)");
            }
            return;
        }

        let sample = Sample {
            latency_ms: latency,
            packet_loss: loss,
        };
        self.histories
            .write()
            .entry(key.to_string())
            .or_default()
            .push(sample, self.cfg.max_results);
    }

    pub fn weighted_average(&self, key: &str) -> Option<Sample> {
        self.histories
            .read()
            .get(key)
            .and_then(|h| h.weighted_average(self.cfg.weight_of_current_result))
    }

    pub fn all_samples(&self, key: &str) -> Option<Vec<Sample>> {
        self.histories.read().get(key).map(StatHistory::all_samples)
    }
}

#[cfg(test)]
mod tests {
    use crate::app::codec::FlowControl;

    use super::*;

    fn reachable_result(latency_ms: u32, requests_sent: u32, responses_received: u32) -> ProbeResult {
        ProbeResult {
            requests_sent,
            responses_received,
            aggregate_latency_ms: latency_ms * responses_received,
            flow_control: FlowControl::None,
            ..Default::default()
        }
    }

    #[test]
    fn process_then_weighted_average_round_trips() {
        let store = StatsStore::new(StatsConfig::default()).unwrap();
        store.process("10.0.0.1:7777", &reachable_result(100, 5, 5));
        let avg = store.weighted_average("10.0.0.1:7777").unwrap();
        assert_eq!(avg.latency_ms, 100);
    }

    #[test]
    fn unreachable_result_evicts_history() {
        let store = StatsStore::new(StatsConfig::default()).unwrap();
        store.process("10.0.0.1:7777", &reachable_result(100, 5, 5));
        assert!(store.weighted_average("10.0.0.1:7777").is_some());

        let unreachable = ProbeResult {
            requests_sent: 5,
            responses_received: 0,
            ..Default::default()
        };
        store.process("10.0.0.1:7777", &unreachable);
        assert!(store.weighted_average("10.0.0.1:7777").is_none());
        assert!(store.all_samples("10.0.0.1:7777").is_none());
    }

    #[test]
    fn unknown_key_returns_none() {
        let store = StatsStore::new(StatsConfig::default()).unwrap();
        assert!(store.weighted_average("nope").is_none());
        assert!(store.all_samples("nope").is_none());
    }
}
