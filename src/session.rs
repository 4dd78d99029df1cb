//! In-memory session store.
//!
//! Sessions are created by the session endpoint, validated on every
//! protected request, and deactivated either explicitly or by the
//! sweeper once their absolute TTL passes. Activity extends
//! `last_activity` but never `expires_at`.
//!
//! Locking: an outer map lock guards membership; each session carries
//! its own lock so `validate` can advance `last_activity` without
//! holding the map. `validate` is the only operation that advances
//! `last_activity`, and the advance is monotone. Once `active` is
//! false a session never reactivates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditRecord, AuditSeverity, AuditSink};
use crate::crypto::token::{TokenClock, TokenError, TokenService};

/// How long a deactivated session lingers (so its final audit record
/// is emitted) before the sweeper purges the entry.
const PURGE_GRACE_SECS: i64 = 60;

/// Per-cycle sweep budget; keeps lock-hold time bounded.
const SWEEP_BATCH: usize = 256;

// ═══════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════

/// Per-session medical interaction context.
#[derive(Debug, Clone, Default)]
pub struct MedicalContext {
    pub interactions: u64,
    /// Sorted multiset of tool names used across the session.
    pub tools_used: Vec<String>,
    pub resources_accessed: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: Uuid,
    pub created_at: i64,
    pub last_activity: i64,
    pub expires_at: i64,
    pub user_agent_hash: String,
    pub peer_hash: String,
    pub active: bool,
    pub medical_context: MedicalContext,
    /// Set on deactivation; the sweeper purges after this passes.
    purge_after: Option<i64>,
}

/// What a client connection looks like, pre-hashing.
#[derive(Debug, Clone)]
pub struct ClientFingerprint {
    pub user_agent: String,
    pub peer_addr: String,
}

fn hash_str(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Issued session handed back to the HTTP layer.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub session_id: Uuid,
    pub expires_at: i64,
}

/// Snapshot returned by a successful validate.
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub session_id: Uuid,
    pub expires_at: i64,
}

/// Typed validation failures (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No session token supplied")]
    NoToken,
    #[error("Session token signature is invalid")]
    BadSignature,
    #[error("Session is not known to this server")]
    UnknownSession,
    #[error("Session has been deactivated")]
    Inactive,
    #[error("Session has expired")]
    Expired,
}

// ═══════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════

pub struct SessionStore {
    sessions: Mutex<HashMap<Uuid, Arc<Mutex<SessionState>>>>,
    tokens: TokenService,
    clock: Arc<dyn TokenClock>,
    ttl_secs: i64,
    audit: AuditSink,
}

impl SessionStore {
    pub fn new(
        tokens: TokenService,
        clock: Arc<dyn TokenClock>,
        ttl_secs: u64,
        audit: AuditSink,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            tokens,
            clock,
            ttl_secs: ttl_secs as i64,
            audit,
        }
    }

    /// Create a fresh session bound to a client fingerprint.
    pub fn create(&self, fingerprint: &ClientFingerprint) -> Result<IssuedSession, TokenError> {
        let now = self.clock.now_epoch_secs();
        let id = Uuid::new_v4();
        let expires_at = now + self.ttl_secs;

        let state = SessionState {
            id,
            created_at: now,
            last_activity: now,
            expires_at,
            user_agent_hash: hash_str(&fingerprint.user_agent),
            peer_hash: hash_str(&fingerprint.peer_addr),
            active: true,
            medical_context: MedicalContext::default(),
            purge_after: None,
        };

        let token = self.tokens.issue(id, expires_at)?;

        self.sessions
            .lock()
            .expect("session map lock poisoned")
            .insert(id, Arc::new(Mutex::new(state)));

        self.audit.emit(
            AuditRecord::new(AuditKind::Access, AuditSeverity::Info, "session", "create", "ok")
                .with_session(&id),
        );

        Ok(IssuedSession {
            token,
            session_id: id,
            expires_at,
        })
    }

    /// Validate a bearer token and touch the session.
    ///
    /// The only call that advances `last_activity`; the advance is
    /// monotone and never exceeds the caller's `now`.
    pub fn validate(&self, raw_token: Option<&str>) -> Result<ValidatedSession, SessionError> {
        let token = match raw_token {
            Some(t) if !t.trim().is_empty() => t,
            _ => return Err(SessionError::NoToken),
        };

        let claims = self.tokens.validate(token).map_err(|e| match e {
            TokenError::Expired => SessionError::Expired,
            TokenError::BadSignature | TokenError::Malformed => SessionError::BadSignature,
        })?;

        let entry = {
            let map = self.sessions.lock().expect("session map lock poisoned");
            map.get(&claims.session_id).cloned()
        };
        let entry = entry.ok_or(SessionError::UnknownSession)?;

        let now = self.clock.now_epoch_secs();
        let mut session = entry.lock().expect("session lock poisoned");

        if !session.active {
            return Err(SessionError::Inactive);
        }
        if now > session.expires_at {
            // Server-side expiry wins even when the token's own exp
            // has not passed (e.g. clock drift between issue paths).
            session.active = false;
            session.purge_after = Some(now + PURGE_GRACE_SECS);
            return Err(SessionError::Expired);
        }

        session.last_activity = session.last_activity.max(now);

        Ok(ValidatedSession {
            session_id: session.id,
            expires_at: session.expires_at,
        })
    }

    /// Record a completed medical interaction against the session.
    pub fn record_usage(&self, id: &Uuid, tools: &[String], resource: &str) {
        let entry = {
            let map = self.sessions.lock().expect("session map lock poisoned");
            map.get(id).cloned()
        };
        if let Some(entry) = entry {
            let mut session = entry.lock().expect("session lock poisoned");
            session.medical_context.interactions += 1;
            for tool in tools {
                let ctx = &mut session.medical_context.tools_used;
                let pos = ctx.binary_search(tool).unwrap_or_else(|p| p);
                ctx.insert(pos, tool.clone());
            }
            if !resource.is_empty() {
                session
                    .medical_context
                    .resources_accessed
                    .push(resource.to_string());
            }
        }
    }

    /// Deactivate a session. Monotone: once inactive, always inactive.
    pub fn deactivate(&self, id: &Uuid) {
        let entry = {
            let map = self.sessions.lock().expect("session map lock poisoned");
            map.get(id).cloned()
        };
        if let Some(entry) = entry {
            let mut session = entry.lock().expect("session lock poisoned");
            if session.active {
                session.active = false;
                session.purge_after =
                    Some(self.clock.now_epoch_secs() + PURGE_GRACE_SECS);
                self.audit.emit(
                    AuditRecord::new(
                        AuditKind::Access,
                        AuditSeverity::Info,
                        "session",
                        "deactivate",
                        "ok",
                    )
                    .with_session(id),
                );
            }
        }
    }

    /// One sweep cycle: deactivate expired sessions, purge those past
    /// their grace window. Bounded per-cycle progress.
    pub fn sweep(&self) -> SweepOutcome {
        let now = self.clock.now_epoch_secs();

        // Read snapshot first; candidates are re-checked under their
        // own lock before any transition.
        let candidates: Vec<(Uuid, Arc<Mutex<SessionState>>)> = {
            let map = self.sessions.lock().expect("session map lock poisoned");
            map.iter()
                .take(SWEEP_BATCH)
                .map(|(id, entry)| (*id, entry.clone()))
                .collect()
        };

        let mut deactivated = 0usize;
        let mut purge_ids = Vec::new();

        for (id, entry) in candidates {
            let mut session = entry.lock().expect("session lock poisoned");
            if session.active && now > session.expires_at {
                session.active = false;
                session.purge_after = Some(now + PURGE_GRACE_SECS);
                deactivated += 1;
                self.audit.emit(
                    AuditRecord::new(
                        AuditKind::Access,
                        AuditSeverity::Info,
                        "session",
                        "expire",
                        "swept",
                    )
                    .with_session(&id),
                );
            }
            if !session.active && session.purge_after.is_some_and(|p| now > p) {
                purge_ids.push(id);
            }
        }

        if !purge_ids.is_empty() {
            let mut map = self.sessions.lock().expect("session map lock poisoned");
            for id in &purge_ids {
                map.remove(id);
            }
        }

        SweepOutcome {
            deactivated,
            purged: purge_ids.len(),
        }
    }

    /// Number of live (active) sessions, for the health surface.
    pub fn active_count(&self) -> usize {
        let map = self.sessions.lock().expect("session map lock poisoned");
        map.values()
            .filter(|e| e.lock().map(|s| s.active).unwrap_or(false))
            .count()
    }

    /// Read a session snapshot (tests and the health surface).
    pub fn snapshot(&self, id: &Uuid) -> Option<SessionState> {
        let map = self.sessions.lock().expect("session map lock poisoned");
        map.get(id)
            .and_then(|e| e.lock().ok().map(|s| s.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub deactivated: usize,
    pub purged: usize,
}

/// Spawn the background sweeper at a fixed cadence (default 5 min).
pub fn spawn_sweeper(
    store: Arc<SessionStore>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick consumed
        loop {
            ticker.tick().await;
            let outcome = store.sweep();
            if outcome.deactivated > 0 || outcome.purged > 0 {
                tracing::debug!(
                    deactivated = outcome.deactivated,
                    purged = outcome.purged,
                    "session sweep"
                );
            }
        }
    })
}
