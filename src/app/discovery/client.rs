//! HTTP discovery client (§4.D): fetches the regional server list with
//! conditional caching, gzip, retry, and single-flight cancellation.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::app::endpoint::Endpoint;
use crate::app::error::DiscoveryError;

use super::cache::{parse_etag, parse_max_age, CacheEntry};
use super::config::DiscoveryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    NotStarted,
    Running,
    Done,
    Failed,
}

#[derive(Deserialize)]
struct ServerListBody {
    servers: Vec<RawServer>,
}

#[derive(Deserialize)]
struct RawServer {
    locationid: i64,
    regionid: String,
    ipv4: String,
    #[serde(default)]
    ipv6: Option<String>,
    port: u16,
}

impl From<RawServer> for Endpoint {
    fn from(raw: RawServer) -> Self {
        let mut ep = Endpoint::new(raw.ipv4, raw.port, raw.regionid, raw.locationid);
        ep.ipv6 = raw.ipv6;
        ep
    }
}

/// Drop servers failing the §3 invariants, logging each rejection.
fn filter_valid_endpoints(raw: Vec<RawServer>) -> Vec<Endpoint> {
    raw.into_iter()
        .map(Endpoint::from)
        .filter(|ep| match ep.validate() {
            Ok(()) => true,
            Err(err) => {
                warn!("dropping invalid discovery server {ep}: {err}");
                false
            }
        })
        .collect()
}

enum Attempt {
    Success {
        endpoints: Vec<Endpoint>,
        etag: Option<String>,
        max_age: Option<u64>,
    },
    NotModified {
        max_age: Option<u64>,
    },
    Retryable(String),
    Terminal(DiscoveryError),
}

pub struct DiscoveryClient {
    http: reqwest::Client,
    cfg: RwLock<DiscoveryConfig>,
    cache: RwLock<Option<CacheEntry>>,
    state: RwLock<DiscoveryState>,
    generation: AtomicU64,
}

impl DiscoveryClient {
    pub fn new(cfg: DiscoveryConfig) -> Result<Self, DiscoveryError> {
        cfg.validate()?;
        let http = build_http_client(&cfg)?;
        Ok(Self {
            http,
            cfg: RwLock::new(cfg),
            cache: RwLock::new(None),
            state: RwLock::new(DiscoveryState::NotStarted),
            generation: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.read()
    }

    /// Replace the config; per §4.D, changing `fleet_id` or the URL
    /// template purges any cached list or failure.
    pub fn set_config(&self, cfg: DiscoveryConfig) -> Result<(), DiscoveryError> {
        cfg.validate()?;
        {
            let current = self.cfg.read();
            if current.fleet_id != cfg.fleet_id
                || current.discovery_service_uri != cfg.discovery_service_uri
            {
                *self.cache.write() = None;
            }
        }
        *self.cfg.write() = cfg;
        Ok(())
    }

    /// `Cancel()`: return to `NotStarted`, discarding any in-flight
    /// request's eventual result, but keep the cache intact.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.state.write() = DiscoveryState::NotStarted;
    }

    /// `Reset()`: like `cancel()` but also clears the cache and ETag.
    pub fn reset(&self) {
        self.cancel();
        *self.cache.write() = None;
    }

    /// `discover(fleet_id)`: serve from cache if fresh, otherwise issue
    /// (and retry) an HTTP GET. Starting a new call supersedes any prior
    /// in-flight one; a superseded call's result is discarded silently.
    #[instrument(skip(self))]
    pub async fn discover(&self) -> Result<Vec<Endpoint>, DiscoveryError> {
        let now = Utc::now();
        if let Some(cached) = self.cached_result(now) {
            return cached;
        }

        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.write() = DiscoveryState::Running;

        let result = self.request_with_retries(now).await;

        if self.generation.load(Ordering::SeqCst) != my_generation {
            debug!("discovery superseded by a newer call; discarding result");
            return Err(DiscoveryError::Cancelled);
        }

        *self.state.write() = match &result {
            Ok(_) => DiscoveryState::Done,
            Err(_) => DiscoveryState::Failed,
        };
        result
    }

    fn cached_result(&self, now: DateTime<Utc>) -> Option<Result<Vec<Endpoint>, DiscoveryError>> {
        let cache = self.cache.read();
        let entry = cache.as_ref()?;
        if !entry.is_fresh(now) {
            return None;
        }
        Some(match entry {
            CacheEntry::Success { endpoints, .. } => Ok(endpoints.clone()),
            CacheEntry::Failure { .. } => Err(DiscoveryError::Cached(
                "discovery failed recently; serving cached failure".into(),
            )),
        })
    }

    async fn request_with_retries(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Endpoint>, DiscoveryError> {
        let cfg = self.cfg.read().clone();
        let url = cfg.resolved_url();
        let etag = {
            let cache = self.cache.read();
            cache.as_ref().and_then(|e| match e {
                CacheEntry::Success { etag, .. } => etag.clone(),
                CacheEntry::Failure { .. } => None,
            })
        };

        let mut attempts = 0u32;
        loop {
            match self.try_once(&cfg, &url, etag.as_deref()).await {
                Attempt::NotModified { max_age } => {
                    return self.reuse_cached_on_not_modified(now, max_age);
                }
                Attempt::Success {
                    endpoints,
                    etag,
                    max_age,
                } => {
                    let expire = now + cache_ttl(max_age, cfg.success_cache_time());
                    *self.cache.write() = Some(CacheEntry::Success {
                        endpoints: endpoints.clone(),
                        etag,
                        expire_utc: expire,
                    });
                    return Ok(endpoints);
                }
                Attempt::Terminal(err) => {
                    self.cache_failure(now, &cfg);
                    return Err(err);
                }
                Attempt::Retryable(reason) => {
                    if attempts >= cfg.request_retries {
                        self.cache_failure(now, &cfg);
                        return Err(DiscoveryError::RetriesExhausted(reason));
                    }
                    attempts += 1;
                    debug!("discovery attempt {attempts} retrying: {reason}");
                }
            }
        }
    }

    fn reuse_cached_on_not_modified(
        &self,
        now: DateTime<Utc>,
        max_age: Option<u64>,
    ) -> Result<Vec<Endpoint>, DiscoveryError> {
        let success_cache_time = self.cfg.read().success_cache_time();
        let mut cache = self.cache.write();
        match cache.as_mut() {
            Some(CacheEntry::Success {
                endpoints,
                expire_utc,
                ..
            }) => {
                *expire_utc = now + cache_ttl(max_age, success_cache_time);
                Ok(endpoints.clone())
            }
            _ => Err(DiscoveryError::ConfigInvalid(
                "received 304 Not Modified with no cached list to reuse".into(),
            )),
        }
    }

    fn cache_failure(&self, now: DateTime<Utc>, cfg: &DiscoveryConfig) {
        *self.cache.write() = Some(CacheEntry::Failure {
            expire_utc: now + cfg.failure_cache_time(),
        });
    }

    async fn try_once(&self, cfg: &DiscoveryConfig, url: &str, etag: Option<&str>) -> Attempt {
        let mut req = self.http.get(url).header("Accept", "application/json");
        if let Some(etag) = etag {
            req = req.header("If-None-Match", format!("\"{etag}\""));
        }

        let response = match req.timeout(cfg.request_timeout()).send().await {
            Ok(resp) => resp,
            Err(err) => return Attempt::Retryable(err.to_string()),
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                let max_age = response
                    .headers()
                    .get("cache-control")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_max_age);
                Attempt::NotModified { max_age }
            }
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get("etag")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_etag);
                let max_age = response
                    .headers()
                    .get("cache-control")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_max_age);

                let bytes = match response.bytes().await {
                    Ok(bytes) => bytes,
                    Err(err) => return Attempt::Retryable(err.to_string()),
                };
                let body: ServerListBody = match serde_json::from_slice(&bytes) {
                    Ok(body) => body,
                    Err(err) => return Attempt::Terminal(DiscoveryError::Parse(err)),
                };
                Attempt::Success {
                    endpoints: filter_valid_endpoints(body.servers),
                    etag,
                    max_age,
                }
            }
            status if status.is_server_error() => {
                Attempt::Retryable(format!("HTTP {}", status.as_u16()))
            }
            status => Attempt::Terminal(DiscoveryError::Status(status.as_u16())),
        }
    }
}

fn cache_ttl(max_age_sec: Option<u64>, fallback: std::time::Duration) -> chrono::Duration {
    match max_age_sec {
        Some(s) => chrono::Duration::seconds(s as i64),
        None => chrono::Duration::from_std(fallback).unwrap_or(chrono::Duration::zero()),
    }
}

fn build_http_client(cfg: &DiscoveryConfig) -> Result<reqwest::Client, DiscoveryError> {
    reqwest::Client::builder()
        .gzip(cfg.use_gzip)
        .build()
        .map_err(DiscoveryError::Http)
}

#[cfg(test)]
impl DiscoveryClient {
    /// Seed a fresh success cache entry so `discover()` returns `endpoints`
    /// without a network call. Used by integration tests elsewhere in the
    /// crate that need a `DiscoveryClient` wired to a fixed endpoint list.
    pub(crate) fn seed_success_cache_for_test(&self, endpoints: Vec<Endpoint>) {
        *self.cache.write() = Some(CacheEntry::Success {
            endpoints,
            etag: None,
            expire_utc: Utc::now() + chrono::Duration::hours(1),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_raw(ipv4: &str, port: u16, region: &str) -> RawServer {
        RawServer {
            locationid: 1,
            regionid: region.into(),
            ipv4: ipv4.into(),
            ipv6: None,
            port,
        }
    }

    #[test]
    fn filter_valid_endpoints_drops_bad_servers() {
        let raw = vec![
            sample_raw("203.0.113.1", 7777, "us-east"),
            sample_raw("not-an-ip", 7777, "us-west"),
            sample_raw("203.0.113.2", 0, "eu-west"),
        ];
        let filtered = filter_valid_endpoints(raw);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].regionid, "us-east");
    }

    #[test]
    fn cache_ttl_prefers_max_age_over_fallback() {
        let ttl = cache_ttl(Some(60), std::time::Duration::from_millis(30_000));
        assert_eq!(ttl, chrono::Duration::seconds(60));
        let ttl = cache_ttl(None, std::time::Duration::from_millis(30_000));
        assert_eq!(ttl, chrono::Duration::milliseconds(30_000));
    }

    #[test]
    fn set_config_purges_cache_on_fleet_id_change() {
        let client = DiscoveryClient::new(DiscoveryConfig {
            fleet_id: "fleet-a".into(),
            ..Default::default()
        })
        .unwrap();
        *client.cache.write() = Some(CacheEntry::Failure {
            expire_utc: Utc::now() + chrono::Duration::seconds(60),
        });

        client
            .set_config(DiscoveryConfig {
                fleet_id: "fleet-b".into(),
                ..Default::default()
            })
            .unwrap();

        assert!(client.cache.read().is_none());
    }

    #[test]
    fn set_config_keeps_cache_when_fleet_id_unchanged() {
        let client = DiscoveryClient::new(DiscoveryConfig {
            fleet_id: "fleet-a".into(),
            ..Default::default()
        })
        .unwrap();
        *client.cache.write() = Some(CacheEntry::Failure {
            expire_utc: Utc::now() + chrono::Duration::seconds(60),
        });

        client
            .set_config(DiscoveryConfig {
                fleet_id: "fleet-a".into(),
                use_gzip: false,
                ..Default::default()
            })
            .unwrap();

        assert!(client.cache.read().is_some());
    }

    #[test]
    fn reset_clears_cache_cancel_does_not() {
        let client = DiscoveryClient::new(DiscoveryConfig {
            fleet_id: "fleet-a".into(),
            ..Default::default()
        })
        .unwrap();
        *client.cache.write() = Some(CacheEntry::Failure {
            expire_utc: Utc::now() + chrono::Duration::seconds(60),
        });

        client.cancel();
        assert!(client.cache.read().is_some());
        assert_eq!(client.state(), DiscoveryState::NotStarted);

        client.reset();
        assert!(client.cache.read().is_none());
    }

    #[tokio::test]
    async fn fresh_success_cache_short_circuits_without_network() {
        let client = DiscoveryClient::new(DiscoveryConfig {
            fleet_id: "fleet-a".into(),
            ..Default::default()
        })
        .unwrap();
        let cached = vec![Endpoint::new(
            "203.0.113.1".into(),
            7777,
            "us-east".into(),
            1,
        )];
        *client.cache.write() = Some(CacheEntry::Success {
            endpoints: cached.clone(),
            etag: None,
            expire_utc: Utc::now() + chrono::Duration::seconds(60),
        });

        let result = client.discover().await.unwrap();
        assert_eq!(result, cached);
    }

    /// E5 (§8) end-to-end: a real HTTP responder answering 200 then 304
    /// drives `discover()` through the actual request/cache pipeline, not
    /// just the cache struct directly. The 304's `Cache-Control: max-age=60`
    /// must keep a third call from touching the (by-then-closed) server.
    #[tokio::test]
    async fn e5_http_200_then_304_reuses_cache_until_max_age_elapses() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let body = r#"{"servers":[{"locationid":1,"regionid":"us-east","ipv4":"203.0.113.9","ipv6":null,"port":7777}]}"#;
        let resp_200 = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nETag: \"abc123\"\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body,
        );
        let resp_304 =
            "HTTP/1.1 304 Not Modified\r\nCache-Control: max-age=60\r\nConnection: close\r\n\r\n"
                .to_string();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for resp in [resp_200, resp_304] {
                let (mut stream, _) = match listener.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") => break,
                        Ok(_) => continue,
                    }
                }
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        let client = DiscoveryClient::new(DiscoveryConfig {
            fleet_id: "test-fleet".into(),
            discovery_service_uri: format!(
                "http://127.0.0.1:{}/v1/fleets/{{fleet}}/servers",
                addr.port()
            ),
            // Forces the second call to hit the server instead of serving a
            // still-fresh cache, so the 304 branch actually gets exercised.
            success_cache_time_ms: 0,
            ..Default::default()
        })
        .unwrap();

        let first = client.discover().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].regionid, "us-east");

        let second = client.discover().await.unwrap();
        assert_eq!(second, first);

        let third = client.discover().await.unwrap();
        assert_eq!(third, first);
    }
}
