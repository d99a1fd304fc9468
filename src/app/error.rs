use thiserror::Error;

/// Errors that abort a whole probe run before any packet could be sent.
/// Socket acquisition failures are *not* represented here: per §4.C step 6
/// they are logged and the run still returns zero-initialized results, the
/// same shape as a run that sent packets but got no replies. Per-endpoint
/// and per-packet failures are counted into `ProbeResult` fields instead
/// (spec §7).
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe config invalid: {0}")]
    ConfigInvalid(String),
}

/// Errors surfaced by the discovery client's public `discover()` entry
/// point. Retries are exhausted internally; this is the terminal state.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery config invalid: {0}")]
    ConfigInvalid(String),
    #[error("discovery request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("discovery server returned HTTP {0}")]
    Status(u16),
    #[error("failed to parse discovery response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("discovery request cancelled")]
    Cancelled,
    #[error("discovery failure cached from a prior attempt: {0}")]
    Cached(String),
    #[error("discovery retries exhausted: {0}")]
    RetriesExhausted(String),
}

/// Errors surfaced by the weighted rolling statistics store.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats config invalid: {0}")]
    ConfigInvalid(String),
}

/// Crate-level error composed from each component's error surface, used by
/// the orchestrator where a single `Result` return type is convenient.
///
/// `CodecError` and `EndpointError` have no variant here: both are
/// per-packet/per-endpoint conditions the spec requires be counted into
/// `ProbeResult` fields or logged and skipped, never surfaced as a `Result`
/// (§7 "probe errors surface as absent counts ... never as exceptions").
#[derive(Debug, Error)]
pub enum QosError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Stats(#[from] StatsError),
}
