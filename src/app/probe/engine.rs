//! The QoS Probe Engine (§4.C): a single-pass, non-blocking UDP send/receive
//! pipeline firing N probes per endpoint to M endpoints in parallel, with
//! pacing, deadlines, duplicate-endpoint coalescing, and server-issued
//! flow-control handling.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, instrument, trace, warn};

use crate::app::codec::{decode_response, encode_request, peek_identifier, MAX_PACKET_LEN};
use crate::app::endpoint::{Endpoint, NormalizedAddr};
use crate::app::error::ProbeError;

use super::config::ProbeConfig;
use super::result::ProbeResult;
use super::socket::bind_probe_socket;

pub struct ProbeEngine {
    cfg: ProbeConfig,
}

impl ProbeEngine {
    pub fn new(cfg: ProbeConfig) -> Self {
        Self { cfg }
    }

    /// Run one probe pass against `endpoints`. `results[i]` always
    /// corresponds to `endpoints[i]`, even for endpoints that never sent a
    /// single packet (backoff, duplicate, deadline already passed).
    #[instrument(skip_all, fields(endpoints = endpoints.len(), title))]
    pub async fn run(
        &self,
        endpoints: &[Endpoint],
        title: &str,
    ) -> Result<Vec<ProbeResult>, ProbeError> {
        self.cfg.validate()?;
        if title.is_empty() {
            return Err(ProbeError::ConfigInvalid("title must not be empty".into()));
        }

        let socket = match bind_probe_socket() {
            Ok(sock) => sock,
            Err(err) => {
                error!("failed to acquire probe socket: {err}; run aborted with zero results");
                return Ok(vec![ProbeResult::default(); endpoints.len()]);
            }
        };

        let mut run = RunState::new(endpoints);
        let deadline = Instant::now() + self.cfg.timeout();

        self.dispatch(&socket, endpoints, title, &mut run, deadline)
            .await;
        self.drain(&socket, &mut run, deadline).await;
        run.finalize();

        Ok(run.results)
    }

    #[instrument(skip_all)]
    async fn dispatch(
        &self,
        socket: &UdpSocket,
        endpoints: &[Endpoint],
        title: &str,
        run: &mut RunState,
        deadline: Instant,
    ) {
        let now_utc = chrono::Utc::now();
        let mut successful_sends: u64 = 0;

        for i in 0..endpoints.len() {
            if run.duplicate_of[i].is_some() {
                continue;
            }
            if Instant::now() >= deadline {
                warn!("deadline exceeded before dispatching endpoint {i}; abandoning remaining sends");
                break;
            }
            let ep = &endpoints[i];
            if ep.is_backed_off(now_utc) {
                debug!("{ep} backed off until {}; skipping", ep.backoff_until_utc);
                continue;
            }
            let addr = match ep.socket_addr() {
                Ok(addr) => SocketAddr::V4(addr),
                Err(err) => {
                    warn!("{ep} has an unusable address: {err}");
                    continue;
                }
            };

            let identifier: u16 = rand::random();
            run.identifiers[i] = Some(identifier);

            for seq in 0..self.cfg.requests_per_endpoint {
                if Instant::now() >= deadline {
                    warn!("deadline exceeded mid-burst for {ep}; abandoning remaining sends");
                    break;
                }
                let packet = match encode_request(title, seq as u8, identifier, now_ms()) {
                    Ok(p) => p,
                    Err(err) => {
                        warn!("failed to encode request #{seq} for {ep}: {err}");
                        break;
                    }
                };

                match send_with_retry(socket, &packet, addr, deadline).await {
                    Ok(n) if n == packet.len() => {
                        run.results[i].requests_sent += 1;
                        run.outstanding += 1;
                        successful_sends += 1;
                        if self.cfg.requests_between_pause > 0
                            && successful_sends % self.cfg.requests_between_pause as u64 == 0
                        {
                            sleep(self.cfg.request_pause()).await;
                        }
                    }
                    Ok(_) => {
                        run.results[i].invalid_requests += 1;
                    }
                    Err(err) => {
                        warn!("send to {ep} failed, aborting its remaining sends: {err}");
                        break;
                    }
                }
            }

            // Non-blocking drain after each endpoint's burst to keep the
            // receive buffer from overflowing (§4.C step 3).
            drain_non_blocking(socket, run, self.cfg.max_sequence());
        }
    }

    #[instrument(skip_all, fields(outstanding = run.outstanding))]
    async fn drain(&self, socket: &UdpSocket, run: &mut RunState, deadline: Instant) {
        let drain_deadline = deadline.min(Instant::now() + self.cfg.max_wait());
        let max_sequence = self.cfg.max_sequence();
        let mut buf = [0u8; MAX_PACKET_LEN];

        while run.outstanding > 0 {
            let now = Instant::now();
            if now >= drain_deadline {
                break;
            }
            let wait = self.cfg.receive_wait().min(drain_deadline - now);
            match timeout(wait, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, addr))) => {
                    process_datagram(addr, &buf[..n], run, max_sequence);
                }
                Ok(Err(err)) => {
                    warn!("socket error during drain, stopping: {err}");
                    break;
                }
                Err(_) => {
                    trace!("recv timed out, {} still outstanding", run.outstanding);
                }
            }
        }
    }
}

struct RunState {
    duplicate_of: Vec<Option<usize>>,
    address_index: HashMap<NormalizedAddr, usize>,
    identifiers: Vec<Option<u16>>,
    results: Vec<ProbeResult>,
    outstanding: u32,
}

impl RunState {
    fn new(endpoints: &[Endpoint]) -> Self {
        let mut address_index = HashMap::with_capacity(endpoints.len());
        let mut duplicate_of = vec![None; endpoints.len()];

        for (i, ep) in endpoints.iter().enumerate() {
            let addr = match ep.socket_addr() {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            let key = NormalizedAddr::from(addr);
            match address_index.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(i);
                }
                Entry::Occupied(slot) => {
                    duplicate_of[i] = Some(*slot.get());
                }
            }
        }

        Self {
            duplicate_of,
            address_index,
            identifiers: vec![None; endpoints.len()],
            results: vec![ProbeResult::default(); endpoints.len()],
            outstanding: 0,
        }
    }

    /// §4.C step 6: duplicates inherit the original's whole result,
    /// including flow control.
    fn finalize(&mut self) {
        for i in 0..self.results.len() {
            if let Some(first_idx) = self.duplicate_of[i] {
                self.results[i] = self.results[first_idx].clone();
            }
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

async fn send_with_retry(
    socket: &UdpSocket,
    packet: &[u8],
    addr: SocketAddr,
    deadline: Instant,
) -> io::Result<usize> {
    loop {
        match socket.send_to(packet, addr).await {
            Ok(n) => return Ok(n),
            Err(err) if is_transient(&err) && Instant::now() < deadline => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Non-blocking drain: pull whatever is already queued without waiting.
fn drain_non_blocking(socket: &UdpSocket, run: &mut RunState, max_sequence: u8) {
    let mut buf = [0u8; MAX_PACKET_LEN];
    loop {
        match socket.try_recv_from(&mut buf) {
            Ok((n, addr)) => process_datagram(addr, &buf[..n], run, max_sequence),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

/// §4.C step 5 MATCHING, in the exact order the spec prescribes: address
/// lookup, then identifier match, then full `Verify()`.
fn process_datagram(addr: SocketAddr, buf: &[u8], run: &mut RunState, max_sequence: u8) {
    let addr_v4 = match addr {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(addr) => {
            debug!("unexpected response from IPv6 address {addr}");
            return;
        }
    };
    let idx = match run.address_index.get(&NormalizedAddr::from(addr_v4)) {
        Some(&idx) => idx,
        None => {
            debug!("unexpected response from {addr_v4}");
            return;
        }
    };
    let expected_id = match run.identifiers[idx] {
        Some(id) => id,
        None => {
            debug!("response from {addr_v4} but no probe was ever sent to it");
            return;
        }
    };

    let got_id = match peek_identifier(buf) {
        Some(id) => id,
        None => {
            run.results[idx].invalid_responses += 1;
            return;
        }
    };
    if got_id != expected_id {
        run.results[idx].invalid_responses += 1;
        return;
    }

    match decode_response(buf, max_sequence) {
        Ok(resp) => {
            let latency = now_ms().saturating_sub(resp.timestamp_ms) as u32;
            run.results[idx].record_response(latency, resp.flow_control);
            run.outstanding = run.outstanding.saturating_sub(1);
        }
        Err(err) => {
            trace!("response from {addr_v4} failed verification: {err}");
            run.results[idx].invalid_responses += 1;
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
