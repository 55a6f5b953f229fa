//! Session store (C3): an in-memory, TTL-bounded map of authentication flow
//! states, keyed both by opaque session id and by OAuth `state`.
//!
//! Grounded in the same two-index `DashMap` + shutdown-aware reaper shape
//! used elsewhere in this lineage for short-lived, high-churn records: one
//! map owns the records, a second map is a secondary index, and a background
//! task sweeps expired entries instead of relying on read-time eviction alone.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use rand::RngExt;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::error::{BrokerError, Result};

/// Status of an in-flight authentication session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Waiting for the `IdP` to redirect back with `code`/`state`.
    PendingCallback,
    /// Callback succeeded; user belongs to more than one team.
    AwaitingTeamSelection,
    /// Exactly one team is selected; ready for `/exchange`.
    ReadyForExchange,
    /// An `/exchange` call has claimed this session and is minting its Vault
    /// child token; a concurrent second call must not also proceed.
    Exchanging,
    /// `/exchange` succeeded. Terminal.
    Exchanged,
    /// Any step failed irrecoverably. Terminal.
    Failed,
    /// TTL passed before reaching `Exchanged`/`Failed`. Terminal.
    Expired,
}

/// Identity populated on the session after a successful `IdP` callback.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    /// Preferred email, from userinfo or falling back to ID token claims.
    pub email: String,
    /// Display name, when the `IdP` provides one.
    pub display_name: Option<String>,
    /// ID token `sub` claim.
    pub subject: String,
    /// Resolved group membership used for team candidate resolution.
    pub groups: Vec<String>,
}

/// One record per in-flight (or recently terminal) authentication.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Opaque id used by `/exchange` and the browser polling flow.
    pub session_id: String,
    /// OAuth `state` parameter, also used for the CSRF cookie cross-check.
    pub state: String,
    /// PKCE code verifier, sent to the `IdP` token endpoint.
    pub pkce_verifier: String,
    /// PKCE code challenge, sent in the authorization URL.
    pub pkce_challenge: String,
    /// OIDC nonce, checked against the ID token.
    pub nonce: String,
    /// Current state machine status.
    pub status: SessionStatus,
    /// Unix timestamp the session was created.
    pub created_at: u64,
    /// Unix timestamp after which the reaper marks this session `Expired`.
    pub expires_at: u64,
    /// Resolved identity, populated after a successful callback.
    pub user: Option<UserIdentity>,
    /// Teams the user's groups resolved to.
    pub candidate_teams: Vec<String>,
    /// Team chosen automatically (single candidate) or via `/auth/select-team`.
    pub selected_team: Option<String>,
    /// Kept on the type for wire-shape forward compatibility; never written
    /// by `/exchange` in this implementation (strict single-use semantics).
    pub vault_token_cache: Option<String>,
}

impl SessionState {
    fn new(ttl_secs: u64) -> Self {
        let now = now_secs();
        Self {
            session_id: generate_token("sess"),
            state: generate_token("st"),
            pkce_verifier: generate_pkce_verifier(),
            pkce_challenge: String::new(), // filled in below once verifier is known
            nonce: generate_token("nonce"),
            status: SessionStatus::PendingCallback,
            created_at: now,
            expires_at: now + ttl_secs,
            user: None,
            candidate_teams: Vec::new(),
            selected_team: None,
            vault_token_cache: None,
        }
    }

    /// Whether `now` is past `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Generate a PKCE `(verifier, S256 challenge)` pair.
#[must_use]
pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Derive the S256 `code_challenge` for a PKCE `verifier`.
#[must_use]
pub fn pkce_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

fn generate_token(prefix: &str) -> String {
    let mut bytes = [0u8; 16]; // 128 bits of entropy
    rand::rng().fill(&mut bytes);
    format!("{prefix}_{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Grace period a terminal `Expired` record is kept after sweeping, so late
/// pollers see a clean `SESSION_EXPIRED` instead of `SESSION_NOT_FOUND`.
const EXPIRY_GRACE_SECS: u64 = 60;

/// In-memory, concurrent session store with two indices over the same record.
pub struct SessionStore {
    by_session_id: DashMap<String, SessionState>,
    by_state: DashMap<String, String>,
    max_sessions: usize,
}

impl SessionStore {
    /// Create an empty store bounded to `max_sessions` live records.
    #[must_use]
    pub fn new(max_sessions: usize) -> Self {
        Self {
            by_session_id: DashMap::new(),
            by_state: DashMap::new(),
            max_sessions,
        }
    }

    /// Create a new session in `PendingCallback`, rejecting with
    /// [`BrokerError::Backpressure`] when the store is at capacity.
    pub fn create(&self, ttl_secs: u64) -> Result<SessionState> {
        if self.by_session_id.len() >= self.max_sessions {
            return Err(BrokerError::Backpressure);
        }
        let mut session = SessionState::new(ttl_secs);
        session.pkce_challenge = pkce_challenge(&session.pkce_verifier);

        self.by_state
            .insert(session.state.clone(), session.session_id.clone());
        self.by_session_id
            .insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Look up a session by its opaque id, evicting it lazily if its TTL has
    /// passed.
    pub fn find_by_session(&self, session_id: &str) -> Option<SessionState> {
        self.evict_if_expired(session_id);
        self.by_session_id.get(session_id).map(|r| r.clone())
    }

    /// Look up a session by its OAuth `state` parameter.
    pub fn find_by_state(&self, state: &str) -> Option<SessionState> {
        let session_id = self.by_state.get(state)?.clone();
        self.find_by_session(&session_id)
    }

    /// Atomically move a session from `from` to the state produced by
    /// `mutate`, rejecting with [`BrokerError::InvalidState`] if the current
    /// status does not equal `from`. `mutate` also sets `status` on the
    /// passed record.
    pub fn transition(
        &self,
        session_id: &str,
        from: SessionStatus,
        mutate: impl FnOnce(&mut SessionState),
    ) -> Result<SessionState> {
        self.evict_if_expired(session_id);
        let mut entry = self
            .by_session_id
            .get_mut(session_id)
            .ok_or(BrokerError::SessionNotFound)?;

        if entry.status != from {
            return Err(BrokerError::InvalidState);
        }
        mutate(&mut entry);
        Ok(entry.clone())
    }

    /// Sweep sessions past `expires_at`: mark them `Expired`, then drop them
    /// after [`EXPIRY_GRACE_SECS`] so late pollers get a clean error.
    pub fn sweep(&self) {
        let now = now_secs();
        let mut to_drop = Vec::new();

        for mut entry in self.by_session_id.iter_mut() {
            if entry.status == SessionStatus::Expired {
                if now >= entry.expires_at + EXPIRY_GRACE_SECS {
                    to_drop.push(entry.session_id.clone());
                }
            } else if entry.is_expired(now) {
                entry.status = SessionStatus::Expired;
                crate::audit::emit(&crate::audit::AuditEvent::expired(&entry.session_id));
            }
        }

        for session_id in to_drop {
            if let Some((_, session)) = self.by_session_id.remove(&session_id) {
                self.by_state.remove(&session.state);
            }
        }
    }

    /// Mark a session `Failed` unconditionally, unless it has already reached
    /// a terminal state. Used when an orchestration step fails outside the
    /// normal `transition` CAS (the exact current status is not known to the
    /// caller at the failure site).
    pub fn mark_failed(&self, session_id: &str) {
        if let Some(mut entry) = self.by_session_id.get_mut(session_id)
            && !matches!(
                entry.status,
                SessionStatus::Exchanged | SessionStatus::Failed | SessionStatus::Expired
            )
        {
            entry.status = SessionStatus::Failed;
        }
    }

    fn evict_if_expired(&self, session_id: &str) {
        let now = now_secs();
        if let Some(mut entry) = self.by_session_id.get_mut(session_id)
            && entry.status != SessionStatus::Expired
            && entry.is_expired(now)
        {
            entry.status = SessionStatus::Expired;
        }
    }

    /// Number of live session records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_session_id.len()
    }

    /// Whether the store currently holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_session_id.is_empty()
    }
}

/// Spawn the background sweep task: fires every `interval`, selecting against
/// the process-wide shutdown broadcast so it exits cleanly on graceful
/// shutdown rather than being aborted.
pub fn spawn_reaper(
    store: Arc<SessionStore>,
    interval: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    store.sweep();
                }
                _ = shutdown.recv() => {
                    tracing::debug!("session reaper shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_populates_both_indices() {
        let store = SessionStore::new(10);
        let session = store.create(600).unwrap();
        assert!(store.find_by_session(&session.session_id).is_some());
        assert!(store.find_by_state(&session.state).is_some());
    }

    #[test]
    fn pkce_challenge_is_deterministic_sha256_of_verifier() {
        let verifier = "test-verifier-value";
        let challenge_a = pkce_challenge(verifier);
        let challenge_b = pkce_challenge(verifier);
        assert_eq!(challenge_a, challenge_b);
        assert_ne!(challenge_a, verifier);
    }

    #[test]
    fn create_rejects_with_backpressure_at_capacity() {
        let store = SessionStore::new(1);
        store.create(600).unwrap();
        let result = store.create(600);
        assert!(matches!(result, Err(BrokerError::Backpressure)));
    }

    #[test]
    fn transition_rejects_mismatched_from_state() {
        let store = SessionStore::new(10);
        let session = store.create(600).unwrap();
        let result = store.transition(&session.session_id, SessionStatus::ReadyForExchange, |s| {
            s.status = SessionStatus::Exchanged;
        });
        assert!(matches!(result, Err(BrokerError::InvalidState)));
    }

    #[test]
    fn transition_succeeds_and_is_single_use() {
        let store = SessionStore::new(10);
        let session = store.create(600).unwrap();

        store
            .transition(&session.session_id, SessionStatus::PendingCallback, |s| {
                s.status = SessionStatus::ReadyForExchange;
                s.selected_team = Some("mobile-team".to_string());
            })
            .unwrap();

        let first = store.transition(&session.session_id, SessionStatus::ReadyForExchange, |s| {
            s.status = SessionStatus::Exchanged;
        });
        assert!(first.is_ok());

        let second = store.transition(&session.session_id, SessionStatus::ReadyForExchange, |s| {
            s.status = SessionStatus::Exchanged;
        });
        assert!(matches!(second, Err(BrokerError::InvalidState)));
    }

    #[test]
    fn mark_failed_does_not_override_terminal_exchanged() {
        let store = SessionStore::new(10);
        let session = store.create(600).unwrap();
        store
            .transition(&session.session_id, SessionStatus::PendingCallback, |s| {
                s.status = SessionStatus::ReadyForExchange;
            })
            .unwrap();
        store
            .transition(&session.session_id, SessionStatus::ReadyForExchange, |s| {
                s.status = SessionStatus::Exchanged;
            })
            .unwrap();

        store.mark_failed(&session.session_id);
        let found = store.find_by_session(&session.session_id).unwrap();
        assert_eq!(found.status, SessionStatus::Exchanged);
    }

    #[test]
    fn unknown_session_id_is_not_found() {
        let store = SessionStore::new(10);
        let result = store.transition("nonexistent", SessionStatus::PendingCallback, |_| {});
        assert!(matches!(result, Err(BrokerError::SessionNotFound)));
    }

    #[test]
    fn sweep_marks_past_ttl_sessions_expired_then_drops_after_grace() {
        let store = SessionStore::new(10);
        let session = store.create(0).unwrap(); // already expired

        store.sweep();
        let found = store.find_by_session(&session.session_id).unwrap();
        assert_eq!(found.status, SessionStatus::Expired);

        // Force the grace window to have elapsed and sweep again.
        {
            let mut entry = store.by_session_id.get_mut(&session.session_id).unwrap();
            entry.expires_at = 0;
        }
        store.sweep();
        assert!(store.find_by_session(&session.session_id).is_none());
    }
}
