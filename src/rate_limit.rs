//! Per-identifier sliding-window rate limiting.
//!
//! Each `(identifier, endpoint class)` key keeps the timestamps of its
//! accepted events inside the rolling window. The identifier is the
//! session id when one is present, otherwise a hash of the peer
//! address — raw IPs never appear in a key or an audit record.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditRecord, AuditSeverity, AuditSink};

/// Endpoint classes carry separate caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    General,
    Medical,
}

impl EndpointClass {
    fn as_str(self) -> &'static str {
        match self {
            EndpointClass::General => "general",
            EndpointClass::Medical => "medical",
        }
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Epoch milliseconds at which the oldest in-window event ages out.
    pub reset_at_ms: i64,
}

/// Build the rate-limit identifier for a request.
pub fn identifier_for(session_id: Option<&Uuid>, peer_addr: &str) -> String {
    match session_id {
        Some(id) => format!("session:{id}"),
        None => {
            let mut hasher = Sha256::new();
            hasher.update(peer_addr.as_bytes());
            let digest = hasher.finalize();
            let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
            format!("peer:{hex}")
        }
    }
}

/// Map size past which `check_at` prunes idle windows inline, so the
/// key set cannot grow without bound between periodic sweeps.
const PRUNE_THRESHOLD: usize = 1024;

pub struct RateLimiter {
    windows: Mutex<HashMap<(String, EndpointClass), VecDeque<i64>>>,
    window_ms: i64,
    max_general: u32,
    max_medical: u32,
    audit: AuditSink,
}

impl RateLimiter {
    pub fn new(window_ms: u64, max_general: u32, max_medical: u32, audit: AuditSink) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            window_ms: window_ms as i64,
            max_general,
            max_medical,
            audit,
        }
    }

    fn cap(&self, class: EndpointClass) -> u32 {
        match class {
            EndpointClass::General => self.max_general,
            EndpointClass::Medical => self.max_medical,
        }
    }

    /// Check and record one request attempt.
    pub fn check(&self, identifier: &str, class: EndpointClass) -> RateDecision {
        self.check_at(identifier, class, chrono::Utc::now().timestamp_millis())
    }

    /// Deterministic core, also used by tests.
    pub fn check_at(&self, identifier: &str, class: EndpointClass, now_ms: i64) -> RateDecision {
        let cap = self.cap(class);
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        if windows.len() > PRUNE_THRESHOLD {
            Self::prune_map(&mut windows, now_ms, self.window_ms);
        }
        let window = windows
            .entry((identifier.to_string(), class))
            .or_default();

        while window.front().is_some_and(|ts| now_ms - ts >= self.window_ms) {
            window.pop_front();
        }

        if (window.len() as u32) < cap {
            window.push_back(now_ms);
            let reset_at_ms = window.front().copied().unwrap_or(now_ms) + self.window_ms;
            RateDecision {
                allowed: true,
                remaining: cap - window.len() as u32,
                reset_at_ms,
            }
        } else {
            let reset_at_ms = window.front().copied().unwrap_or(now_ms) + self.window_ms;
            drop(windows);
            self.audit.emit(
                AuditRecord::new(
                    AuditKind::SecurityEvent,
                    AuditSeverity::Security,
                    "rate-limit",
                    class.as_str(),
                    "exceeded",
                )
                .with_fields(serde_json::json!({ "identifier": identifier })),
            );
            RateDecision {
                allowed: false,
                remaining: 0,
                reset_at_ms,
            }
        }
    }

    /// Drop windows with no in-window entries. Runs inline once the
    /// map grows past the threshold, and from the periodic
    /// maintenance sweep.
    pub fn prune(&self, now_ms: i64) {
        let mut windows = self.windows.lock().expect("rate limiter lock poisoned");
        Self::prune_map(&mut windows, now_ms, self.window_ms);
    }

    fn prune_map(
        windows: &mut HashMap<(String, EndpointClass), VecDeque<i64>>,
        now_ms: i64,
        window_ms: i64,
    ) {
        windows.retain(|_, w| w.back().is_some_and(|ts| now_ms - ts < window_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::PhiScrubber;

    const T0: i64 = 1_750_000_000_000;

    fn limiter(max_general: u32, max_medical: u32) -> (RateLimiter, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let audit =
            AuditSink::start(dir.path(), 1024 * 1024, 3, PhiScrubber::new()).unwrap();
        (
            RateLimiter::new(60_000, max_general, max_medical, audit),
            dir,
        )
    }

    #[test]
    fn allows_up_to_cap_then_denies() {
        let (limiter, _dir) = limiter(3, 3);
        for i in 0..3 {
            let d = limiter.check_at("session:a", EndpointClass::General, T0 + i);
            assert!(d.allowed, "request {i} should pass");
        }
        let denied = limiter.check_at("session:a", EndpointClass::General, T0 + 10);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
    }

    #[test]
    fn exactly_nth_allowed_nth_plus_one_denied() {
        let (limiter, _dir) = limiter(5, 5);
        for i in 0..5 {
            assert!(
                limiter
                    .check_at("session:x", EndpointClass::Medical, T0 + i)
                    .allowed
            );
        }
        assert!(
            !limiter
                .check_at("session:x", EndpointClass::Medical, T0 + 6)
                .allowed
        );
    }

    #[test]
    fn window_slides() {
        let (limiter, _dir) = limiter(2, 2);
        assert!(limiter.check_at("k", EndpointClass::General, T0).allowed);
        assert!(limiter.check_at("k", EndpointClass::General, T0 + 1).allowed);
        assert!(!limiter.check_at("k", EndpointClass::General, T0 + 2).allowed);

        // First event ages out after the window passes.
        assert!(
            limiter
                .check_at("k", EndpointClass::General, T0 + 60_000)
                .allowed
        );
    }

    #[test]
    fn remaining_counts_down() {
        let (limiter, _dir) = limiter(3, 3);
        assert_eq!(
            limiter.check_at("k", EndpointClass::General, T0).remaining,
            2
        );
        assert_eq!(
            limiter.check_at("k", EndpointClass::General, T0 + 1).remaining,
            1
        );
        assert_eq!(
            limiter.check_at("k", EndpointClass::General, T0 + 2).remaining,
            0
        );
    }

    #[test]
    fn reset_at_is_oldest_plus_window() {
        let (limiter, _dir) = limiter(2, 2);
        limiter.check_at("k", EndpointClass::General, T0);
        let d = limiter.check_at("k", EndpointClass::General, T0 + 500);
        assert_eq!(d.reset_at_ms, T0 + 60_000);
    }

    #[test]
    fn classes_have_independent_windows() {
        let (limiter, _dir) = limiter(100, 1);
        assert!(limiter.check_at("k", EndpointClass::Medical, T0).allowed);
        assert!(!limiter.check_at("k", EndpointClass::Medical, T0 + 1).allowed);
        // General class for the same identifier is unaffected.
        assert!(limiter.check_at("k", EndpointClass::General, T0 + 2).allowed);
    }

    #[test]
    fn identifiers_are_isolated() {
        let (limiter, _dir) = limiter(1, 1);
        assert!(limiter.check_at("session:a", EndpointClass::General, T0).allowed);
        assert!(limiter.check_at("session:b", EndpointClass::General, T0).allowed);
        assert!(!limiter.check_at("session:a", EndpointClass::General, T0 + 1).allowed);
    }

    #[test]
    fn identifier_prefers_session_and_never_embeds_raw_ip() {
        let sid = Uuid::new_v4();
        let with_session = identifier_for(Some(&sid), "203.0.113.7:4242");
        assert!(with_session.contains(&sid.to_string()));

        let anonymous = identifier_for(None, "203.0.113.7:4242");
        assert!(anonymous.starts_with("peer:"));
        assert!(!anonymous.contains("203.0.113.7"));
    }

    #[test]
    fn peer_hash_is_stable() {
        assert_eq!(
            identifier_for(None, "203.0.113.7:4242"),
            identifier_for(None, "203.0.113.7:4242")
        );
        assert_ne!(
            identifier_for(None, "203.0.113.7:4242"),
            identifier_for(None, "203.0.113.8:4242")
        );
    }

    #[test]
    fn check_self_prunes_once_map_grows_large() {
        let (limiter, _dir) = limiter(2, 2);
        for i in 0..(PRUNE_THRESHOLD + 100) {
            limiter.check_at(&format!("peer:{i}"), EndpointClass::General, T0);
        }
        assert!(limiter.windows.lock().unwrap().len() > PRUNE_THRESHOLD);

        // One check after the window has passed sheds every idle key.
        limiter.check_at("peer:fresh", EndpointClass::General, T0 + 60_001);
        assert_eq!(limiter.windows.lock().unwrap().len(), 1);
    }

    #[test]
    fn prune_drops_stale_windows() {
        let (limiter, _dir) = limiter(2, 2);
        limiter.check_at("old", EndpointClass::General, T0);
        limiter.check_at("fresh", EndpointClass::General, T0 + 59_999);
        limiter.prune(T0 + 60_001);
        let windows = limiter.windows.lock().unwrap();
        assert!(!windows.contains_key(&("old".to_string(), EndpointClass::General)));
        assert!(windows.contains_key(&("fresh".to_string(), EndpointClass::General)));
    }
}
