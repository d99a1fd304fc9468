//! Per-endpoint probe result and its derived metrics (§3 `ProbeResult`).

use crate::app::codec::FlowControl;

/// Sentinel returned by `average_latency_ms()` when no response was ever
/// matched for the endpoint (§3).
pub const INVALID_LATENCY: u32 = u32::MAX;

/// Sentinel returned by `packet_loss()` when the result is meaningless —
/// nothing was sent, or more was received than sent (§3).
pub const INVALID_PACKET_LOSS: f32 = f32::MAX;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub requests_sent: u32,
    pub responses_received: u32,
    pub invalid_requests: u32,
    pub invalid_responses: u32,
    /// Reserved: the source tracks this field but never increments it
    /// during a run (spec §9 open question). Kept for shape parity with
    /// the data model; always 0 unless a future revision defines when it
    /// should be counted.
    pub duplicate_responses: u32,
    pub aggregate_latency_ms: u32,
    pub flow_control: FlowControl,
}

impl ProbeResult {
    pub fn average_latency_ms(&self) -> u32 {
        if self.responses_received > 0 {
            self.aggregate_latency_ms / self.responses_received
        } else {
            INVALID_LATENCY
        }
    }

    pub fn packet_loss(&self) -> f32 {
        if self.requests_sent > 0 && self.responses_received <= self.requests_sent {
            1.0 - (self.responses_received as f32 / self.requests_sent as f32)
        } else {
            INVALID_PACKET_LOSS
        }
    }

    /// §3 invariant: responses + duplicates + invalid must not meaningfully
    /// exceed what was sent. `tolerance` absorbs late duplicates that arrive
    /// after the run nominally closed its books.
    pub fn within_response_bound(&self, tolerance: u32) -> bool {
        self.responses_received + self.duplicate_responses + self.invalid_responses
            <= self.requests_sent + tolerance
    }

    pub(crate) fn record_response(&mut self, latency_ms: u32, flow_control: FlowControl) {
        self.responses_received += 1;
        self.aggregate_latency_ms = self.aggregate_latency_ms.saturating_add(latency_ms);
        self.flow_control = self.flow_control.max_by_units(flow_control);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_latency_invalid_when_nothing_received() {
        let r = ProbeResult {
            requests_sent: 5,
            ..Default::default()
        };
        assert_eq!(r.average_latency_ms(), INVALID_LATENCY);
    }

    #[test]
    fn average_latency_computed_from_aggregate() {
        let r = ProbeResult {
            requests_sent: 5,
            responses_received: 5,
            aggregate_latency_ms: 100,
            ..Default::default()
        };
        assert_eq!(r.average_latency_ms(), 20);
    }

    #[test]
    fn packet_loss_invalid_when_nothing_sent() {
        let r = ProbeResult::default();
        assert_eq!(r.packet_loss(), INVALID_PACKET_LOSS);
    }

    #[test]
    fn packet_loss_invalid_when_received_exceeds_sent() {
        let r = ProbeResult {
            requests_sent: 2,
            responses_received: 3,
            ..Default::default()
        };
        assert_eq!(r.packet_loss(), INVALID_PACKET_LOSS);
    }

    #[test]
    fn packet_loss_computed_normally() {
        let r = ProbeResult {
            requests_sent: 4,
            responses_received: 3,
            ..Default::default()
        };
        assert_eq!(r.packet_loss(), 0.25);
    }
}
