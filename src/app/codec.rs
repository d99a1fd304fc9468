//! On-wire QoS probe packet format (§4.A). Bit-exact: request/response
//! fields are written in host byte order since the server reflects them
//! back verbatim and neither side ever interprets them as network integers.

use thiserror::Error;

pub(crate) const REQUEST_MAGIC: u8 = 0x59;
pub(crate) const RESPONSE_MAGIC: u8 = 0x95;

pub(crate) const MIN_PACKET_LEN: usize = 15;
pub(crate) const MAX_PACKET_LEN: usize = 1500;
pub(crate) const MIN_RESPONSE_LEN: usize = 13;

/// Largest title that still keeps a request within `MAX_PACKET_LEN` and
/// whose encoded `TitleLen` byte (`title.len() + 1`) fits in a `u8`.
const MAX_TITLE_LEN: usize = 254;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("title must not be empty")]
    EmptyTitle,
    #[error("title too long ({0} bytes, max {MAX_TITLE_LEN})")]
    TitleTooLong(usize),
    #[error("encoded request would be {0} bytes, outside [{MIN_PACKET_LEN}, {MAX_PACKET_LEN}]")]
    RequestLenOutOfRange(usize),
    #[error("response too short ({0} bytes, need at least {MIN_RESPONSE_LEN})")]
    ResponseTooShort(usize),
    #[error("bad response magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("unsupported response version {0}")]
    BadVersion(u8),
    #[error("response sequence {got} exceeds max sequence {max}")]
    SequenceOutOfRange { got: u8, max: u8 },
}

/// Server-applied flow control, decoded from the low nibble of `VerAndFlow`.
///
/// Severity is compared purely on `units`; Ban and Throttle are equally
/// severe for the purpose of the "keep the worst" tie-break (§4.A, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    #[default]
    None,
    Throttle(u8),
    Ban(u8),
}

impl FlowControl {
    pub fn units(&self) -> u8 {
        match *self {
            FlowControl::None => 0,
            FlowControl::Throttle(u) | FlowControl::Ban(u) => u,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, FlowControl::None)
    }

    /// Parse the low nibble of `VerAndFlow` (§4.A `ParseFlowControl`).
    pub fn from_nibble(nibble: u8) -> Self {
        let nibble = nibble & 0x0f;
        if nibble == 0 {
            return FlowControl::None;
        }
        if nibble & 0x8 != 0 {
            let raw = nibble & 0x7;
            FlowControl::Ban(raw + 1)
        } else {
            FlowControl::Throttle(nibble)
        }
    }

    /// Inverse of `from_nibble`, used by tests and by loopback fixtures.
    pub fn to_nibble(self) -> u8 {
        match self {
            FlowControl::None => 0,
            FlowControl::Throttle(units) => units & 0x7,
            FlowControl::Ban(units) => 0x8 | ((units - 1) & 0x7),
        }
    }

    /// Keep whichever of `self`/`other` carries the greater `units`,
    /// treating Ban and Throttle as equivalent severity (§4.A tie-break).
    pub fn max_by_units(self, other: Self) -> Self {
        if other.units() > self.units() {
            other
        } else {
            self
        }
    }
}

/// A decoded response packet (§4.A response table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponsePacket {
    pub sequence: u8,
    pub identifier: u16,
    pub timestamp_ms: u64,
    pub flow_control: FlowControl,
}

/// Encode a request packet (§4.A request table).
///
/// `timestamp_ms` and `identifier` are written in host byte order: both are
/// opaque to the server, which reflects them back verbatim.
pub fn encode_request(
    title: &str,
    sequence: u8,
    identifier: u16,
    timestamp_ms: u64,
) -> Result<Vec<u8>, CodecError> {
    let title_bytes = title.as_bytes();
    if title_bytes.is_empty() {
        return Err(CodecError::EmptyTitle);
    }
    if title_bytes.len() > MAX_TITLE_LEN {
        return Err(CodecError::TitleTooLong(title_bytes.len()));
    }

    let total_len = 3 + title_bytes.len() + 1 + 2 + 8;
    if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&total_len) {
        return Err(CodecError::RequestLenOutOfRange(total_len));
    }

    let mut buf = Vec::with_capacity(total_len);
    buf.push(REQUEST_MAGIC);
    buf.push(0x00); // version 0, flow-ctl 0 from client
    buf.push((title_bytes.len() + 1) as u8);
    buf.extend_from_slice(title_bytes);
    buf.push(sequence);
    buf.extend_from_slice(&identifier.to_ne_bytes());
    buf.extend_from_slice(&timestamp_ms.to_ne_bytes());
    debug_assert_eq!(buf.len(), total_len);
    Ok(buf)
}

/// Peek at the identifier field without validating magic/version/sequence.
/// The matching step (§4.C step 5) compares identifiers *before* running
/// full `Verify()`, so a packet with a bad magic byte still needs its
/// identifier read to decide whether it's worth verifying at all.
pub(crate) fn peek_identifier(buf: &[u8]) -> Option<u16> {
    (buf.len() >= 5).then(|| u16::from_ne_bytes([buf[3], buf[4]]))
}

/// Decode and structurally validate a response packet (§4.A `Verify`).
///
/// `max_sequence` is the highest sequence number this run could have sent
/// (`requests_per_endpoint - 1`); anything higher is rejected as bogus.
pub fn decode_response(buf: &[u8], max_sequence: u8) -> Result<ResponsePacket, CodecError> {
    if buf.len() < MIN_RESPONSE_LEN {
        return Err(CodecError::ResponseTooShort(buf.len()));
    }
    if buf[0] != RESPONSE_MAGIC {
        return Err(CodecError::BadMagic(buf[0]));
    }
    let ver_and_flow = buf[1];
    let version = ver_and_flow >> 4;
    if version != 0 {
        return Err(CodecError::BadVersion(version));
    }
    let sequence = buf[2];
    if sequence > max_sequence {
        return Err(CodecError::SequenceOutOfRange {
            got: sequence,
            max: max_sequence,
        });
    }
    let identifier = u16::from_ne_bytes([buf[3], buf[4]]);
    let timestamp_ms = u64::from_ne_bytes(buf[5..13].try_into().expect("checked length above"));
    let flow_control = FlowControl::from_nibble(ver_and_flow);

    Ok(ResponsePacket {
        sequence,
        identifier,
        timestamp_ms,
        flow_control,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_request_matches_wire_layout() {
        let buf = encode_request("game-client", 3, 0xbeef, 1_700_000_000_123).unwrap();
        assert_eq!(buf[0], REQUEST_MAGIC);
        assert_eq!(buf[1], 0x00);
        assert_eq!(buf[2] as usize, "game-client".len() + 1);
        assert_eq!(&buf[3..14], b"game-client");
        assert_eq!(buf[14], 3);
        assert_eq!(buf.len(), 3 + 11 + 1 + 2 + 8);
    }

    #[test]
    fn encode_request_rejects_empty_title() {
        assert_eq!(
            encode_request("", 0, 0, 0).unwrap_err(),
            CodecError::EmptyTitle
        );
    }

    #[test]
    fn encode_request_rejects_oversized_title() {
        let title = "x".repeat(MAX_TITLE_LEN + 1);
        assert!(matches!(
            encode_request(&title, 0, 0, 0).unwrap_err(),
            CodecError::TitleTooLong(_)
        ));
    }

    #[test]
    fn round_trip_preserves_identifier_and_sequence() {
        let title = "my-game-v1";
        let seq = 4u8;
        let id = 0xabcd;
        let ts = 42u64;
        let req = encode_request(title, seq, id, ts).unwrap();

        // Build a synthetic echo response the way a loopback server would:
        // same sequence/identifier/timestamp, no flow control.
        let mut resp = vec![RESPONSE_MAGIC, 0x00, req[3 + title.len()]];
        resp.extend_from_slice(&req[4 + title.len()..6 + title.len()]);
        resp.extend_from_slice(&req[6 + title.len()..14 + title.len()]);

        let decoded = decode_response(&resp, 4).unwrap();
        assert_eq!(decoded.sequence, seq);
        assert_eq!(decoded.identifier, id);
        assert_eq!(decoded.timestamp_ms, ts);
        assert!(decoded.flow_control.is_none());
    }

    #[test]
    fn verify_rejects_short_responses() {
        let buf = vec![0u8; 12];
        assert_eq!(
            decode_response(&buf, 10).unwrap_err(),
            CodecError::ResponseTooShort(12)
        );
    }

    #[test]
    fn verify_rejects_bad_magic() {
        let mut buf = vec![0u8; 13];
        buf[0] = 0x00;
        assert_eq!(
            decode_response(&buf, 10).unwrap_err(),
            CodecError::BadMagic(0x00)
        );
    }

    #[test]
    fn verify_rejects_sequence_above_max() {
        let mut buf = vec![0u8; 13];
        buf[0] = RESPONSE_MAGIC;
        buf[2] = 9;
        assert_eq!(
            decode_response(&buf, 4).unwrap_err(),
            CodecError::SequenceOutOfRange { got: 9, max: 4 }
        );
    }

    #[test]
    fn flow_control_round_trips_over_valid_domain() {
        for units in 1..=7u8 {
            let fc = FlowControl::Throttle(units);
            assert_eq!(FlowControl::from_nibble(fc.to_nibble()), fc);
        }
        for units in 1..=8u8 {
            let fc = FlowControl::Ban(units);
            assert_eq!(FlowControl::from_nibble(fc.to_nibble()), fc);
        }
        assert_eq!(FlowControl::from_nibble(0), FlowControl::None);
    }

    #[test]
    fn flow_control_tie_break_keeps_greatest_units_regardless_of_kind() {
        let a = FlowControl::Throttle(5);
        let b = FlowControl::Ban(3); // units=3 < 5, stays Throttle(5)
        assert_eq!(a.max_by_units(b), FlowControl::Throttle(5));

        let c = FlowControl::Ban(6);
        assert_eq!(a.max_by_units(c), FlowControl::Ban(6));
    }
}
