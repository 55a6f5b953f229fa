//! Audit logging for authentication session lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with a structured JSON blob,
//! keyed on `session_id` — never on a broker JWT, Vault token, or ID token.
//!
//! | Event | When |
//! |-------|------|
//! | `session.created` | `/cli/start` or `/auth/login` issues a new session |
//! | `session.callback_ok` | IdP callback verified, identity resolved |
//! | `session.team_selected` | client selects a team via `/auth/select-team` |
//! | `session.exchanged` | `/exchange` minted a Vault child token |
//! | `session.failed` | any step failed irrecoverably |
//! | `session.expired` | the reaper marked a session `Expired` |

use serde::Serialize;

/// Structured audit event emitted for every session lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent<'a> {
    /// Event type, e.g. `session.created`.
    pub event: &'static str,
    /// Session the event is about.
    pub session_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Selected team, for `team_selected`/`exchanged` events.
    pub team: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Resolved identity email, for `callback_ok`.
    pub user_email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Failure reason, for `failed`.
    pub reason: Option<&'a str>,
}

impl<'a> AuditEvent<'a> {
    /// A new session was issued by `/cli/start` or `/auth/login`.
    #[must_use]
    pub fn created(session_id: &'a str) -> Self {
        Self {
            event: "session.created",
            session_id,
            team: None,
            user_email: None,
            reason: None,
        }
    }

    /// The `IdP` callback verified and an identity was resolved.
    #[must_use]
    pub fn callback_ok(session_id: &'a str, user_email: &'a str) -> Self {
        Self {
            event: "session.callback_ok",
            session_id,
            team: None,
            user_email: Some(user_email),
            reason: None,
        }
    }

    /// The client selected a team via `/auth/select-team`.
    #[must_use]
    pub fn team_selected(session_id: &'a str, team: &'a str) -> Self {
        Self {
            event: "session.team_selected",
            session_id,
            team: Some(team),
            user_email: None,
            reason: None,
        }
    }

    /// `/exchange` minted a Vault child token.
    #[must_use]
    pub fn exchanged(session_id: &'a str, team: &'a str) -> Self {
        Self {
            event: "session.exchanged",
            session_id,
            team: Some(team),
            user_email: None,
            reason: None,
        }
    }

    /// A step in the flow failed irrecoverably.
    #[must_use]
    pub fn failed(session_id: &'a str, reason: &'a str) -> Self {
        Self {
            event: "session.failed",
            session_id,
            team: None,
            user_email: None,
            reason: Some(reason),
        }
    }

    /// The reaper marked a session `Expired`.
    #[must_use]
    pub fn expired(session_id: &'a str) -> Self {
        Self {
            event: "session.expired",
            session_id,
            team: None,
            user_email: None,
            reason: None,
        }
    }
}

/// Emit an audit event via `tracing::info!` with the event serialized as a
/// structured JSON blob in the `audit` field.
pub fn emit(event: &AuditEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "auth broker audit"),
        Err(ref e) => tracing::warn!(error = %e, "failed to serialize audit event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_event_has_correct_type() {
        let event = AuditEvent::created("sess_abc");
        assert_eq!(event.event, "session.created");
        assert_eq!(event.session_id, "sess_abc");
    }

    #[test]
    fn failed_event_contains_reason() {
        let event = AuditEvent::failed("sess_abc", "nonce mismatch");
        assert_eq!(event.event, "session.failed");
        assert_eq!(event.reason, Some("nonce mismatch"));
    }

    #[test]
    fn events_serialize_to_json() {
        let events = vec![
            AuditEvent::created("s1"),
            AuditEvent::callback_ok("s1", "a@b.com"),
            AuditEvent::team_selected("s1", "mobile-team"),
            AuditEvent::exchanged("s1", "mobile-team"),
            AuditEvent::failed("s1", "bad state"),
            AuditEvent::expired("s1"),
        ];
        for event in events {
            assert!(serde_json::to_string(&event).is_ok());
        }
    }

    #[test]
    fn emit_does_not_panic() {
        emit(&AuditEvent::created("sess_test"));
    }
}
