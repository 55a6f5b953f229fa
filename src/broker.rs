//! Orchestrator (C8): sequences the `IdP` client, session store, team
//! resolver, JWT issuer, and Vault client into the end-to-end authentication
//! flow. Holds only downward references; returns plain data to the HTTP
//! surface.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::TeamsConfig;
use crate::error::{BrokerError, Result};
use crate::idp::IdpClient;
use crate::issuer::{self, ExchangeMetadata};
use crate::keys::KeyManager;
use crate::session::{SessionState, SessionStatus, SessionStore, UserIdentity};
use crate::teams;
use crate::vault::{ChildToken, VaultClient};

/// Per-call timeout applied to each `IdP` round trip during callback handling.
pub const IDP_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
/// Per-call timeout applied to each Vault round trip during exchange.
pub const VAULT_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Shared state threaded through every HTTP handler.
pub struct AppState {
    /// Broker's signing key and JWKS.
    pub keys: Arc<KeyManager>,
    /// `IdP` client for authorize-URL, token exchange, and userinfo.
    pub idp: Arc<IdpClient>,
    /// Authentication session store.
    pub sessions: Arc<SessionStore>,
    /// Team resolution and Vault role configuration.
    pub teams: Arc<TeamsConfig>,
    /// Vault client for JWT login and child-token minting.
    pub vault: Arc<VaultClient>,
    /// `iss` claim stamped on broker-issued JWTs.
    pub issuer: String,
    /// `aud` claim stamped on broker-issued JWTs.
    pub jwt_audience: String,
    /// TTL applied to freshly created sessions.
    pub session_ttl_secs: u64,
    /// Bounds the number of concurrently in-flight `/exchange` requests so
    /// shutdown can wait for them to drain.
    pub inflight: Arc<tokio::sync::Semaphore>,
}

/// Begin a new authentication session in `PENDING_CALLBACK`.
///
/// # Errors
///
/// Returns [`BrokerError::Backpressure`] if the session store is at capacity.
pub fn start_session(state: &AppState) -> Result<SessionState> {
    state.sessions.create(state.session_ttl_secs)
}

/// Build the `IdP` authorization-redirect URL for a freshly created session.
///
/// # Errors
///
/// Returns [`BrokerError::Config`] if the `IdP` issuer URL does not parse.
pub fn authorize_url(state: &AppState, session: &SessionState) -> Result<String> {
    state
        .idp
        .build_authorize_url(&session.state, &session.pkce_challenge, &session.nonce)
}

/// Handle the `IdP` redirect back to `/auth/callback`: exchange the code,
/// verify the ID token, resolve team candidates, and advance the session to
/// either `AWAITING_TEAM_SELECTION` or directly to `READY_FOR_EXCHANGE`.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidState`] if `oauth_state` does not match a
/// pending session, or any `IdP`/team-resolution failure, which also marks the
/// session `Failed`.
pub async fn handle_callback(state: &AppState, oauth_state: &str, code: &str) -> Result<SessionState> {
    let session = state
        .sessions
        .find_by_state(oauth_state)
        .ok_or(BrokerError::InvalidState)?;

    match run_callback(state, &session, code).await {
        Ok(updated) => Ok(updated),
        Err(e) => {
            state.sessions.mark_failed(&session.session_id);
            crate::audit::emit(&crate::audit::AuditEvent::failed(&session.session_id, &e.to_string()));
            Err(e)
        }
    }
}

async fn run_callback(state: &AppState, session: &SessionState, code: &str) -> Result<SessionState> {
    let exchange = with_timeout(
        IDP_CALL_TIMEOUT,
        state.idp.exchange_code(code, &session.pkce_verifier),
        BrokerError::IdpUnreachable,
    )
    .await?;
    let claims = with_timeout(
        IDP_CALL_TIMEOUT,
        state.idp.verify_id_token(&exchange.id_token, &session.nonce),
        BrokerError::IdpUnreachable,
    )
    .await?;
    let userinfo = with_timeout(
        IDP_CALL_TIMEOUT,
        state.idp.fetch_userinfo(&exchange.access_token),
        BrokerError::IdpUnreachable,
    )
    .await?;

    let groups = if userinfo.groups.is_empty() {
        claims.groups.clone().unwrap_or_default()
    } else {
        userinfo.groups
    };
    let candidates = teams::resolve_candidate_teams(&state.teams, &groups)?;

    let identity = UserIdentity {
        email: if userinfo.email.is_empty() {
            claims.email.unwrap_or_default()
        } else {
            userinfo.email
        },
        display_name: userinfo.name.or(claims.name),
        subject: claims.sub,
        groups,
    };

    state
        .sessions
        .transition(&session.session_id, SessionStatus::PendingCallback, |s| {
            s.user = Some(identity);
            s.candidate_teams.clone_from(&candidates);
            if candidates.len() == 1 {
                s.selected_team = Some(candidates[0].clone());
                s.status = SessionStatus::ReadyForExchange;
            } else {
                s.status = SessionStatus::AwaitingTeamSelection;
            }
        })
}

/// Record the client's team selection, advancing the session to
/// `READY_FOR_EXCHANGE`.
///
/// # Errors
///
/// Returns [`BrokerError::InvalidTeamSelection`] if `team` is not among the
/// session's candidate teams, or [`BrokerError::InvalidState`] if the session
/// is not awaiting a selection.
pub fn select_team(state: &AppState, session_id: &str, team: &str) -> Result<SessionState> {
    let session = state
        .sessions
        .find_by_session(session_id)
        .ok_or(BrokerError::SessionNotFound)?;

    if let Err(e) = teams::validate_selection(&session.candidate_teams, team) {
        state.sessions.mark_failed(session_id);
        crate::audit::emit(&crate::audit::AuditEvent::failed(session_id, &e.to_string()));
        return Err(e);
    }

    state
        .sessions
        .transition(session_id, SessionStatus::AwaitingTeamSelection, |s| {
            s.selected_team = Some(team.to_string());
            s.status = SessionStatus::ReadyForExchange;
        })
}

/// The single Vault-minting point: exchange a `READY_FOR_EXCHANGE` session
/// for a team-scoped Vault child token. Single-use — a second call on the
/// same session fails with [`BrokerError::SessionAlreadyUsed`].
///
/// # Errors
///
/// Returns [`BrokerError::SessionNotFound`], [`BrokerError::SessionExpired`],
/// [`BrokerError::SessionNotReady`]/[`BrokerError::SessionAlreadyUsed`]
/// (depending on the session's current status), or a propagated Vault error.
pub async fn exchange(state: &AppState, session_id: &str, metadata: &ExchangeMetadata) -> Result<ChildToken> {
    let session = state
        .sessions
        .find_by_session(session_id)
        .ok_or(BrokerError::SessionNotFound)?;

    match session.status {
        SessionStatus::Expired => return Err(BrokerError::SessionExpired),
        SessionStatus::Exchanged | SessionStatus::Exchanging => return Err(BrokerError::SessionAlreadyUsed),
        SessionStatus::ReadyForExchange => {}
        _ => return Err(BrokerError::SessionNotReady),
    }

    let team = session
        .selected_team
        .as_deref()
        .ok_or(BrokerError::SessionNotReady)?;
    let user = session.user.as_ref().ok_or(BrokerError::SessionNotReady)?;

    let team_def = state
        .teams
        .teams
        .get(team)
        .ok_or_else(|| BrokerError::VaultRoleMissing(team.to_string()))?;

    // Claim the session before doing any Vault work: this CAS is the single
    // serialization point that makes a concurrent duplicate /exchange fail
    // fast instead of also reaching Vault.
    state
        .sessions
        .transition(session_id, SessionStatus::ReadyForExchange, |s| {
            s.status = SessionStatus::Exchanging;
        })
        .map_err(|_| BrokerError::SessionAlreadyUsed)?;

    let result = match issuer::issue(&state.keys, &state.issuer, &state.jwt_audience, team, user, metadata) {
        Ok(broker_jwt) => {
            mint_child_token(state, team, user, team_def.jwt_role_or(team), &team_def.token_role, &broker_jwt, team_def.ttl_default_secs, team_def.uses, metadata).await
        }
        Err(e) => Err(e),
    };

    match &result {
        Ok(_) => {
            let _ = state
                .sessions
                .transition(session_id, SessionStatus::Exchanging, |s| {
                    s.status = SessionStatus::Exchanged;
                });
        }
        Err(_) => state.sessions.mark_failed(session_id),
    }

    result
}

#[allow(clippy::too_many_arguments)]
async fn mint_child_token(
    state: &AppState,
    team: &str,
    user: &UserIdentity,
    jwt_role: String,
    token_role: &str,
    broker_jwt: &str,
    ttl_secs: u64,
    max_uses: u32,
    metadata: &ExchangeMetadata,
) -> Result<ChildToken> {
    let parent = with_timeout(
        VAULT_CALL_TIMEOUT,
        state.vault.authenticate_as_team(&jwt_role, broker_jwt),
        BrokerError::VaultUnreachable,
    )
    .await?;

    let mut meta = HashMap::new();
    meta.insert("team".to_string(), team.to_string());
    meta.insert("user".to_string(), user.email.clone());
    if let Some(name) = &user.display_name {
        meta.insert("name".to_string(), name.clone());
    }
    if let Some(pipeline) = &metadata.pipeline {
        meta.insert("pipeline".to_string(), pipeline.clone());
    }
    if let Some(repo) = &metadata.repo {
        meta.insert("repo".to_string(), repo.clone());
    }
    if let Some(target) = &metadata.target {
        meta.insert("target".to_string(), target.clone());
    }
    if let Some(run_id) = &metadata.run_id {
        meta.insert("run_id".to_string(), run_id.clone());
    }

    with_timeout(
        VAULT_CALL_TIMEOUT,
        state
            .vault
            .create_child_token(&parent.client_token, token_role, meta, ttl_secs, max_uses),
        BrokerError::VaultUnreachable,
    )
    .await
}

async fn with_timeout<F, T>(duration: std::time::Duration, fut: F, on_timeout: fn(String) -> BrokerError) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout("request timed out".to_string())),
    }
}

