//! HTTP Discovery Client (§4.D): fetches the regional endpoint list with
//! conditional caching, retry, and gzip handling.

mod cache;
mod client;
mod config;

pub use client::{DiscoveryClient, DiscoveryState};
pub use config::DiscoveryConfig;
