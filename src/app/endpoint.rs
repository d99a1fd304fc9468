//! Endpoint records and the address utilities used to coalesce duplicate
//! endpoints during a probe run (§3, §4.B, §9 "duplicate coalescing").

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid IPv4 address {0:?}")]
    BadIpv4(String),
    #[error("port {0} out of range (must be 1..=65535)")]
    BadPort(u16),
    #[error("regionid must not be empty")]
    EmptyRegionId,
}

/// An entry in the regional discovery service's server list. The discovery
/// client authors every field except `backoff_until_utc`, which only the
/// client mutates in response to server-issued flow control (§3).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Endpoint {
    pub ipv4: String,
    pub port: u16,
    pub regionid: String,
    pub locationid: i64,
    #[serde(default)]
    pub ipv6: Option<String>,
    #[serde(skip, default = "no_backoff")]
    pub backoff_until_utc: DateTime<Utc>,
}

fn no_backoff() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

impl Endpoint {
    pub fn new(ipv4: String, port: u16, regionid: String, locationid: i64) -> Self {
        Self {
            ipv4,
            port,
            regionid,
            locationid,
            ipv6: None,
            backoff_until_utc: no_backoff(),
        }
    }

    pub fn parse_ipv4(&self) -> Result<Ipv4Addr, EndpointError> {
        self.ipv4
            .parse()
            .map_err(|_| EndpointError::BadIpv4(self.ipv4.clone()))
    }

    pub fn socket_addr(&self) -> Result<SocketAddrV4, EndpointError> {
        Ok(SocketAddrV4::new(self.parse_ipv4()?, self.port))
    }

    /// The three invariants from §3; servers failing any of these are
    /// dropped by the discovery client after fetching the list.
    pub fn validate(&self) -> Result<(), EndpointError> {
        self.parse_ipv4()?;
        if self.port == 0 {
            return Err(EndpointError::BadPort(self.port));
        }
        if self.regionid.is_empty() {
            return Err(EndpointError::EmptyRegionId);
        }
        Ok(())
    }

    pub fn is_backed_off(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until_utc > now
    }

    /// Stats-store key: `ipv6:port` if an IPv6 address was published,
    /// otherwise `ipv4:port` (§4.E, orchestrator convention).
    pub fn stats_key(&self) -> String {
        match &self.ipv6 {
            Some(ipv6) if !ipv6.is_empty() => format!("{ipv6}:{}", self.port),
            _ => format!("{}:{}", self.ipv4, self.port),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.regionid, self.ipv4, self.port)
    }
}

/// Normalized binary address used as the `address_index` key for duplicate
/// coalescing (§4.C step 2, §9). Two endpoints sharing the same IPv4+port
/// hash and compare equal here even if other fields differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NormalizedAddr(pub Ipv4Addr, pub u16);

impl From<SocketAddrV4> for NormalizedAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self(*addr.ip(), addr.port())
    }
}

impl fmt::Display for NormalizedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}
