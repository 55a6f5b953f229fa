//! HTTP surface (C7): routes for the browser flow, the CLI flow, health, and
//! JWKS. Owns the state-machine transitions only in the sense of calling into
//! [`crate::broker`] and mapping its `Result<T, BrokerError>` to HTTP — it
//! never touches `IdP` or Vault directly.
//!
//! Router layering (`CatchPanicLayer` → `CompressionLayer` → `TraceLayer`)
//! and the `Arc<Semaphore>` in-flight counter follow the same shape used
//! elsewhere in this lineage for assembling an `axum` router from shared
//! state.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::broker::{self, AppState};
use crate::error::BrokerError;
use crate::issuer::ExchangeMetadata;

const STATE_COOKIE: &str = "broker_state";

/// Build the broker's router over the given shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/cli/start", post(cli_start))
        .route("/", get(index))
        .route("/auth/login", get(auth_login))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/select-team", get(select_team_form).post(select_team_submit))
        .route("/exchange", post(exchange))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorBody {
            error: self.error_kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    auth_method: &'static str,
    vault_reachable: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let vault_reachable = state.vault.is_reachable().await;
    Json(HealthBody {
        status: "healthy",
        auth_method: "okta_oidc",
        vault_reachable,
    })
}

async fn jwks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.keys.jwks())
}

#[derive(Serialize)]
struct CliStartBody {
    session_id: String,
    state: String,
    auth_url: String,
    expires_in: u64,
}

async fn cli_start(State(state): State<Arc<AppState>>) -> Result<Json<CliStartBody>, BrokerError> {
    let session = broker::start_session(&state)?;
    let auth_url = broker::authorize_url(&state, &session)?;
    audit_session_created(&session.session_id);
    Ok(Json(CliStartBody {
        session_id: session.session_id,
        state: session.state,
        auth_url,
        expires_in: session.expires_at.saturating_sub(session.created_at),
    }))
}

async fn index() -> Html<&'static str> {
    Html(
        "<html><body><h1>bazel-auth-broker</h1><p><a href=\"/auth/login\">Sign in</a></p></body></html>",
    )
}

async fn auth_login(State(state): State<Arc<AppState>>) -> Result<Response, BrokerError> {
    let session = broker::start_session(&state)?;
    let auth_url = broker::authorize_url(&state, &session)?;
    audit_session_created(&session.session_id);

    let cookie = format!("{STATE_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", session.state);
    let mut response = Redirect::to(&auth_url).into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, cookie.parse().expect("cookie header value"));
    Ok(response)
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn auth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    headers: axum::http::HeaderMap,
) -> Result<Response, BrokerError> {
    if let Some(err) = query.error {
        return Err(BrokerError::IdTokenInvalid(format!("`IdP` returned error: {err}")));
    }
    let oauth_state = query.state.ok_or(BrokerError::InvalidState)?;
    let code = query.code.ok_or(BrokerError::InvalidState)?;

    if let Some(cookie_state) = state_cookie_value(&headers)
        && cookie_state.as_bytes().ct_eq(oauth_state.as_bytes()).unwrap_u8() != 1
    {
        return Err(BrokerError::InvalidState);
    }

    let session = broker::handle_callback(&state, &oauth_state, &code).await?;

    if session.status == crate::session::SessionStatus::AwaitingTeamSelection {
        return Ok(Redirect::to(&format!("/auth/select-team?session_id={}", session.session_id)).into_response());
    }
    if let Some(user) = &session.user {
        audit_callback_ok(&session.session_id, &user.email);
    }
    Ok(Html(callback_page_html(&session.session_id)).into_response())
}

/// Extract the `broker_state` cookie value from a raw `Cookie` header,
/// without pulling in a cookie-jar crate the rest of the stack never needed.
fn state_cookie_value(headers: &axum::http::HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == STATE_COOKIE).then(|| value.to_string())
    })
}

#[derive(Deserialize)]
struct SelectTeamQuery {
    session_id: String,
}

async fn select_team_form(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SelectTeamQuery>,
) -> Result<Html<String>, BrokerError> {
    let session = state
        .sessions
        .find_by_session(&query.session_id)
        .ok_or(BrokerError::SessionNotFound)?;

    let options = session
        .candidate_teams
        .iter()
        .fold(String::new(), |mut acc, team| {
            let _ = write!(acc, "<option value=\"{team}\">{team}</option>");
            acc
        });

    Ok(Html(format!(
        "<html><body><h1>Select a team</h1>\
         <form method=\"post\" action=\"/auth/select-team\">\
         <input type=\"hidden\" name=\"session_id\" value=\"{}\">\
         <select name=\"team\">{options}</select>\
         <button type=\"submit\">Continue</button></form></body></html>",
        session.session_id
    )))
}

#[derive(Deserialize)]
struct SelectTeamBody {
    session_id: String,
    team: String,
}

async fn select_team_submit(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SelectTeamBody>,
) -> Result<Html<String>, BrokerError> {
    let session = broker::select_team(&state, &body.session_id, &body.team)?;
    audit_team_selected(&session.session_id, &body.team);
    Ok(Html(callback_page_html(&session.session_id)))
}

fn callback_page_html(session_id: &str) -> String {
    format!(
        "<html><body><h1>Signed in</h1>\
         <p>Session: <code id=\"session_id\">{session_id}</code></p>\
         <pre>curl -X POST https://broker.example.com/exchange \\\n  -H 'content-type: application/json' \\\n  -d '{{\"session_id\":\"{session_id}\"}}'</pre>\
         <script>navigator.clipboard && navigator.clipboard.writeText('{session_id}');</script>\
         </body></html>"
    )
}

#[derive(Deserialize)]
struct ExchangeRequest {
    session_id: String,
    #[serde(default)]
    pipeline: Option<String>,
    #[serde(default)]
    repo: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
}

#[derive(Serialize)]
struct ExchangeResponseBody {
    token: String,
    ttl: u64,
    uses_remaining: u32,
    policies: Vec<String>,
    metadata: ExchangeResponseMetadata,
}

#[derive(Serialize)]
struct ExchangeResponseMetadata {
    team: String,
    user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
}

async fn exchange(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExchangeRequest>,
) -> Result<Json<ExchangeResponseBody>, BrokerError> {
    let metadata = ExchangeMetadata {
        pipeline: body.pipeline,
        repo: body.repo,
        target: body.target,
        run_id: body.run_id,
    };
    if !metadata.within_size_bounds() {
        return Err(BrokerError::InvalidMetadata("field exceeds 256 bytes".to_string()));
    }

    let session = state
        .sessions
        .find_by_session(&body.session_id)
        .ok_or(BrokerError::SessionNotFound)?;
    let team = session.selected_team.clone().unwrap_or_default();
    let user_email = session.user.as_ref().map(|u| u.email.clone()).unwrap_or_default();

    let _inflight_permit = state
        .inflight
        .acquire()
        .await
        .map_err(|_| BrokerError::Internal("server is shutting down".to_string()))?;

    let child = broker::exchange(&state, &body.session_id, &metadata).await?;
    audit_exchanged(&body.session_id, &team);

    Ok(Json(ExchangeResponseBody {
        token: child.token,
        ttl: child.ttl_seconds,
        uses_remaining: child.uses_remaining,
        policies: child.policies,
        metadata: ExchangeResponseMetadata {
            team,
            user: user_email,
            pipeline: metadata.pipeline,
            repo: metadata.repo,
            target: metadata.target,
            run_id: metadata.run_id,
        },
    }))
}

fn audit_session_created(session_id: &str) {
    crate::audit::emit(&crate::audit::AuditEvent::created(session_id));
}

fn audit_callback_ok(session_id: &str, user_email: &str) {
    crate::audit::emit(&crate::audit::AuditEvent::callback_ok(session_id, user_email));
}

fn audit_team_selected(session_id: &str, team: &str) {
    crate::audit::emit(&crate::audit::AuditEvent::team_selected(session_id, team));
}

fn audit_exchanged(session_id: &str, team: &str) {
    crate::audit::emit(&crate::audit::AuditEvent::exchanged(session_id, team));
}
