//! The QoS Probe Engine (§4.C): fires UDP probes at a set of endpoints and
//! reports per-endpoint latency, packet loss, and flow control.

mod config;
mod engine;
mod result;
mod socket;

pub use config::ProbeConfig;
pub use engine::ProbeEngine;
pub use result::{ProbeResult, INVALID_LATENCY, INVALID_PACKET_LOSS};
