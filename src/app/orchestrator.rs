//! The Orchestrator (§4.F): drives the periodic Discovery → Probe → Stats
//! cycle and applies server-issued flow control as probe backoff.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use super::discovery::DiscoveryClient;
use super::endpoint::{Endpoint, NormalizedAddr};
use super::error::QosError;
use super::probe::{ProbeConfig, ProbeEngine};
use super::stats::StatsStore;

/// Orchestrator-level tunables not owned by any one component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub qos_check_interval_ms: u64,
    pub title: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            qos_check_interval_ms: 60_000,
            title: "qos-probe".to_string(),
        }
    }
}

pub struct Orchestrator {
    discovery: DiscoveryClient,
    probe: ProbeEngine,
    stats: StatsStore,
    cfg: OrchestratorConfig,
    endpoints: RwLock<Vec<Endpoint>>,
}

impl Orchestrator {
    pub fn new(
        discovery: DiscoveryClient,
        probe_cfg: ProbeConfig,
        stats: StatsStore,
        cfg: OrchestratorConfig,
        discovery_request_timeout_sec: u64,
        discovery_request_retries: u32,
    ) -> Self {
        warn_if_budget_exceeded(
            &probe_cfg,
            discovery_request_timeout_sec,
            discovery_request_retries,
            cfg.qos_check_interval_ms,
        );
        Self {
            discovery,
            probe: ProbeEngine::new(probe_cfg),
            stats,
            cfg,
            endpoints: RwLock::new(Vec::new()),
        }
    }

    pub fn stats(&self) -> &StatsStore {
        &self.stats
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }

    /// Run the Discovery → Probe → Stats cycle forever, sleeping
    /// `qos_check_interval_ms` between iterations.
    pub async fn run_forever(&self) -> ! {
        loop {
            if let Err(err) = self.run_cycle().await {
                warn!("probe cycle failed: {err}");
            }
            sleep(StdDuration::from_millis(self.cfg.qos_check_interval_ms)).await;
        }
    }

    /// One Discovery → Probe → Stats cycle (§4.F). Discovery failures are
    /// logged and swallowed: the cycle falls back to the previous endpoint
    /// list rather than aborting, since a stale list beats an empty one.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<(), QosError> {
        let endpoints = match self.discovery.discover().await {
            Ok(discovered) => self.merge_with_previous(discovered),
            Err(err) => {
                warn!("discovery failed, probing last known endpoint list: {err}");
                self.endpoints.read().clone()
            }
        };

        if endpoints.is_empty() {
            info!("no endpoints to probe this cycle");
            *self.endpoints.write() = endpoints;
            return Ok(());
        }

        let results = self.probe.run(&endpoints, &self.cfg.title).await?;
        let now = Utc::now();
        let mut updated = endpoints;
        for (endpoint, result) in updated.iter_mut().zip(results.iter()) {
            self.stats.process(&endpoint.stats_key(), result);
            if result.responses_received > 0 && !result.flow_control.is_none() {
                endpoint.backoff_until_utc = now + backoff_duration(result.flow_control.units());
            }
        }
        *self.endpoints.write() = updated;
        Ok(())
    }

    /// Carry `backoff_until_utc` forward for endpoints discovery still
    /// reports at the same address, so a fresh server list doesn't erase a
    /// ban that hasn't expired yet.
    fn merge_with_previous(&self, discovered: Vec<Endpoint>) -> Vec<Endpoint> {
        let backoffs: HashMap<NormalizedAddr, DateTime<Utc>> = self
            .endpoints
            .read()
            .iter()
            .filter_map(|ep| Some((NormalizedAddr::from(ep.socket_addr().ok()?), ep.backoff_until_utc)))
            .collect();

        discovered
            .into_iter()
            .map(|mut ep| {
                if let Ok(addr) = ep.socket_addr() {
                    if let Some(&backoff) = backoffs.get(&NormalizedAddr::from(addr)) {
                        ep.backoff_until_utc = backoff;
                    }
                }
                ep
            })
            .collect()
    }
}

/// `backoff_duration = 2*fc_units minutes + 30 seconds` (§6).
fn backoff_duration(units: u8) -> Duration {
    Duration::minutes(2 * units as i64) + Duration::seconds(30)
}

fn warn_if_budget_exceeded(
    probe_cfg: &ProbeConfig,
    discovery_request_timeout_sec: u64,
    discovery_request_retries: u32,
    interval_ms: u64,
) {
    let probe_timeout_ms = probe_cfg.timeout_ms;
    let discovery_worst_case_ms =
        discovery_request_timeout_sec * 1000 * (discovery_request_retries as u64 + 1);
    let budget = probe_timeout_ms + discovery_worst_case_ms;
    if budget > interval_ms {
        warn!(
            "probe_timeout ({probe_timeout_ms}ms) + discovery_worst_case ({discovery_worst_case_ms}ms) \
             = {budget}ms exceeds qos_check_interval_ms ({interval_ms}ms); cycles may overlap"
        );
    }
}
