//! Identifier generation for requests and sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Process-wide sequence behind request ids.
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a short request ID based on a counter.
///
/// Only unique within a single process, which is all log correlation needs.
/// Format: `req-{counter}` where counter is zero-padded to 16 hex digits.
pub fn generate_short_request_id() -> String {
    let count = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("req-{:016x}", count)
}

/// Generate a new session identifier for the affinity cookie.
pub fn generate_session_id() -> String {
    Uuid::new_v4().simple().to_string()
}
