//! Opaque id generation and timestamp formatting shared across the crate.
//!
//! Grounded on the teacher's `process_pool::unique_token` / `git_events::new_id`
//! (nanosecond-since-epoch tokens) and `persistence::now_rfc3339`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A short, process-unique, lexicographically-roughly-sortable id: nanoseconds
/// since the epoch plus a monotonic counter to disambiguate same-tick calls.
pub fn new_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{nanos}-{seq}")
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
