//! Discovery response cache: a successful list or a cached failure, each
//! with its own expiry (§4.D "Cache lookup").

use chrono::{DateTime, Utc};

use crate::app::endpoint::Endpoint;

#[derive(Debug, Clone)]
pub(super) enum CacheEntry {
    Success {
        endpoints: Vec<Endpoint>,
        etag: Option<String>,
        expire_utc: DateTime<Utc>,
    },
    Failure {
        expire_utc: DateTime<Utc>,
    },
}

impl CacheEntry {
    pub(super) fn expire_utc(&self) -> DateTime<Utc> {
        match self {
            CacheEntry::Success { expire_utc, .. } => *expire_utc,
            CacheEntry::Failure { expire_utc } => *expire_utc,
        }
    }

    pub(super) fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now <= self.expire_utc()
    }
}

/// Strip a weak validator wrapper (`W/"abc"` → `abc`). A value that isn't
/// quoted, or uses some other wrapper, is rejected rather than guessed at
/// (§7 property 9).
pub(super) fn parse_etag(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let quoted = raw.strip_prefix("W/").unwrap_or(raw);
    if quoted.len() >= 2 && quoted.starts_with('"') && quoted.ends_with('"') {
        Some(quoted[1..quoted.len() - 1].to_string())
    } else {
        None
    }
}

/// Parse `max-age=<seconds>` out of a `Cache-Control` header value. Other
/// directives (`no-cache`, `must-revalidate`, ...) are ignored per §6.
pub(super) fn parse_max_age(raw: &str) -> Option<u64> {
    raw.split(',').find_map(|directive| {
        let directive = directive.trim();
        let value = directive.strip_prefix("max-age=")?;
        value.parse::<u64>().ok()
    })
}
