use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    time::Duration,
};

use clap::Parser;
use serde::Deserialize;
use tracing::metadata::LevelFilter;

use crate::app::discovery::DiscoveryConfig;
use crate::app::orchestrator::OrchestratorConfig;
use crate::app::probe::ProbeConfig;
use crate::app::stats::StatsConfig;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub(crate) struct CliArgs {
    /// Fleet identifier substituted into the discovery service URL
    #[clap(short = 'f', long)]
    pub(crate) fleet_id: String,

    /// TOML config file with probe/discovery/stats tuning overrides
    #[clap(short = 'c', long)]
    pub(crate) config: Option<PathBuf>,

    /// Override the discovery service URL template (must contain {fleet})
    #[clap(long)]
    pub(crate) discovery_url: Option<String>,

    /// Period between Discovery → Probe → Stats cycles
    #[clap(long, default_value = "60s")]
    #[clap(parse(try_from_str = parse_duration::parse))]
    pub(crate) check_interval: Duration,

    /// Title string embedded in every probe request packet
    #[clap(long, default_value = "qos-probe")]
    pub(crate) title: String,

    /// Level of logging verbosity [possible values: off, error, warn, info,
    /// debug, trace]
    #[clap(long)]
    #[clap(default_value = "info")]
    pub(crate) log_level: LevelFilter,
}

/// TOML-sourced overrides for the three component configs plus the
/// orchestrator's own tunables. Every section defaults independently so a
/// config file only needs to mention what it overrides.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub(crate) struct ConfigFile {
    pub(crate) probe: ProbeConfig,
    pub(crate) discovery: DiscoveryConfig,
    pub(crate) stats: StatsConfig,
    pub(crate) orchestrator: OrchestratorConfig,
}

impl ConfigFile {
    pub(crate) fn from_path<T: AsRef<Path>>(path: T) -> io::Result<Self> {
        let mut buf = String::new();
        File::open(path)?.read_to_string(&mut buf)?;
        toml::de::from_str(&buf).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}

impl CliArgs {
    /// Fold CLI flags on top of the (optional) config file into the three
    /// component configs and the orchestrator config.
    pub(crate) fn resolve(&self) -> io::Result<ConfigFile> {
        let mut file = match &self.config {
            Some(path) => ConfigFile::from_path(path)?,
            None => ConfigFile::default(),
        };
        file.discovery.fleet_id = self.fleet_id.clone();
        if let Some(url) = &self.discovery_url {
            file.discovery.discovery_service_uri = url.clone();
        }
        file.orchestrator.qos_check_interval_ms = self.check_interval.as_millis() as u64;
        file.orchestrator.title = self.title.clone();
        Ok(file)
    }
}
