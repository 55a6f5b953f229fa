//! `IdP` client (C2): authorization-URL construction, code/token exchange, ID
//! token verification, and userinfo/group lookup against a single configured
//! OIDC provider.
//!
//! Grounded in the token-exchange shape used elsewhere in this lineage for
//! OAuth code exchange, and in the JWKS-caching/claim-validation shape used
//! for verifying inbound OIDC tokens — generalized here to a single static
//! provider plus explicit nonce verification.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::config::IdpConfig;
use crate::error::{BrokerError, Result};

/// Maximum age, in seconds, an ID token's `iat` may lag behind verification
/// time before it is rejected (replay protection beyond the 60s skew leeway).
const MAX_ID_TOKEN_AGE_SECS: u64 = 300;

const JWKS_CACHE_MAX_TTL: Duration = Duration::from_hours(1);

/// Claims extracted from a verified ID token.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer, checked against the configured `issuer_url`.
    pub iss: String,
    /// Subject identifier.
    pub sub: String,
    #[serde(default)]
    /// Audience; may be a single string or an array per the OIDC spec.
    pub aud: serde_json::Value,
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    #[serde(default)]
    /// Nonce, checked against the session's stored nonce.
    pub nonce: Option<String>,
    #[serde(default)]
    /// Email claim, used as a fallback when userinfo omits it.
    pub email: Option<String>,
    #[serde(default)]
    /// Display name claim.
    pub name: Option<String>,
    #[serde(default)]
    /// Group membership claim, used as a fallback when userinfo omits it.
    pub groups: Option<Vec<String>>,
}

/// Result of a successful code/token exchange.
pub struct TokenExchange {
    /// ID token (JWT) to be verified.
    pub id_token: String,
    /// Access token, used for the userinfo request.
    pub access_token: String,
    /// Access token lifetime in seconds, when the provider reports one.
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
    access_token: String,
    expires_in: Option<u64>,
}

/// User profile fetched from the provider's userinfo endpoint.
#[derive(Debug, Clone)]
pub struct UserInfo {
    /// Preferred email address.
    pub email: String,
    /// Display name, when the provider supplies one.
    pub name: Option<String>,
    /// Group membership, used for team candidate resolution.
    pub groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    groups: Option<Vec<String>>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Client for a single OIDC identity provider: authorization-URL building,
/// code exchange, ID token verification, and userinfo lookup.
pub struct IdpClient {
    config: IdpConfig,
    http: reqwest::Client,
    jwks_cache: DashMap<(), CachedJwks>,
}

impl IdpClient {
    /// Build a client bound to the given provider configuration.
    #[must_use]
    pub fn new(config: IdpConfig) -> Self {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            jwks_cache: DashMap::new(),
        }
    }

    /// Build the `/authorize` redirect URL for a PKCE Authorization Code flow.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if `issuer_url` does not parse as a URL.
    pub fn build_authorize_url(&self, state: &str, pkce_challenge: &str, nonce: &str) -> Result<String> {
        let mut url = url::Url::parse(&authorize_endpoint(&self.config.issuer_url))
            .map_err(|e| BrokerError::Config(format!("invalid issuer_url: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("response_type", "code");
            pairs.append_pair("client_id", &self.config.client_id);
            pairs.append_pair("redirect_uri", &self.config.redirect_uri);
            pairs.append_pair("scope", &self.config.scopes.join(" "));
            pairs.append_pair("state", state);
            pairs.append_pair("nonce", nonce);
            pairs.append_pair("code_challenge", pkce_challenge);
            pairs.append_pair("code_challenge_method", "S256");
        }
        Ok(url.to_string())
    }

    /// Exchange an authorization `code` for tokens using the PKCE `verifier`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::IdpUnreachable`] on transport failure, or
    /// [`BrokerError::IdpBadResponse`] on a non-2xx response or a response
    /// missing `id_token`.
    pub async fn exchange_code(&self, code: &str, pkce_verifier: &str) -> Result<TokenExchange> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.config.redirect_uri),
            ("client_id", &self.config.client_id),
            ("code_verifier", pkce_verifier),
            (
                "client_secret",
                self.config.client_secret.as_deref().unwrap_or_default(),
            ),
        ];

        let response = self
            .http
            .post(token_endpoint(&self.config.issuer_url))
            .form(&params)
            .send()
            .await
            .map_err(|e| BrokerError::IdpUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::IdpBadResponse(format!(
                "token exchange failed: HTTP {status} - {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::IdpBadResponse(format!("malformed token response: {e}")))?;

        let id_token = parsed
            .id_token
            .ok_or_else(|| BrokerError::IdpBadResponse("token response missing id_token".to_string()))?;

        Ok(TokenExchange {
            id_token,
            access_token: parsed.access_token,
            expires_in: parsed.expires_in,
        })
    }

    /// Verify an ID token's signature and standard claims, and confirm
    /// `nonce` matches the value issued for this session.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::IdTokenInvalid`] on signature, claim, or nonce
    /// failure, or [`BrokerError::IdpUnreachable`]/[`BrokerError::IdpBadResponse`]
    /// if JWKS cannot be fetched.
    pub async fn verify_id_token(&self, id_token: &str, expected_nonce: &str) -> Result<IdTokenClaims> {
        let header = jsonwebtoken::decode_header(id_token)
            .map_err(|e| BrokerError::IdTokenInvalid(e.to_string()))?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| BrokerError::IdTokenInvalid("id token missing kid".to_string()))?;

        let decoding_key = self.find_decoding_key(&kid).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = 60;
        validation.set_audience(&[self
            .config
            .audience
            .clone()
            .unwrap_or_else(|| self.config.client_id.clone())]);

        let token_data = jsonwebtoken::decode::<IdTokenClaims>(id_token, &decoding_key, &validation)
            .map_err(|e| BrokerError::IdTokenInvalid(e.to_string()))?;
        let claims = token_data.claims;

        if claims.iss != self.config.issuer_url {
            return Err(BrokerError::IdTokenInvalid(format!(
                "issuer mismatch: expected {}, got {}",
                self.config.issuer_url, claims.iss
            )));
        }

        let now = now_secs();
        let iat_ago = now.saturating_sub(claims.iat);
        if iat_ago > MAX_ID_TOKEN_AGE_SECS {
            return Err(BrokerError::IdTokenInvalid(format!(
                "id token too old: issued {iat_ago}s ago"
            )));
        }

        match &claims.nonce {
            Some(n) if n == expected_nonce => {}
            _ => return Err(BrokerError::IdTokenInvalid("nonce mismatch".to_string())),
        }

        Ok(claims)
    }

    /// Fetch the user's profile from the provider's userinfo endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::IdpUnreachable`] on transport failure, or
    /// [`BrokerError::IdpBadResponse`] on a non-2xx or malformed response.
    pub async fn fetch_userinfo(&self, access_token: &str) -> Result<UserInfo> {
        let response = self
            .http
            .get(userinfo_endpoint(&self.config.issuer_url))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| BrokerError::IdpUnreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(BrokerError::IdpBadResponse(format!("userinfo fetch failed: HTTP {status}")));
        }

        let parsed: UserInfoResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::IdpBadResponse(format!("malformed userinfo response: {e}")))?;

        Ok(UserInfo {
            email: parsed.email.unwrap_or_default(),
            name: parsed.name,
            groups: parsed.groups.unwrap_or_default(),
        })
    }

    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        let jwks = self.get_or_fetch_jwks(false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }
        debug!(kid = %kid, "id token kid not found in cached jwks, refreshing");
        let jwks = self.get_or_fetch_jwks(true).await?;
        find_key_in_jwks(&jwks, kid)
            .ok_or_else(|| BrokerError::IdTokenInvalid(format!("unknown key id: {kid}")))
    }

    async fn get_or_fetch_jwks(&self, force_refresh: bool) -> Result<JwkSet> {
        if !force_refresh
            && let Some(cached) = self.jwks_cache.get(&())
            && cached.fetched_at.elapsed() < JWKS_CACHE_MAX_TTL
        {
            return Ok(cached.keys.clone());
        }

        let response = self
            .http
            .get(jwks_endpoint(&self.config.issuer_url))
            .send()
            .await
            .map_err(|e| BrokerError::IdpUnreachable(e.to_string()))?;
        let jwks: JwkSet = response
            .json()
            .await
            .map_err(|e| BrokerError::IdpBadResponse(format!("malformed jwks: {e}")))?;

        self.jwks_cache.insert(
            (),
            CachedJwks {
                keys: jwks.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(jwks)
    }
}

fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        if jwk.common.key_id.as_deref() != Some(kid) {
            continue;
        }
        if let AlgorithmParameters::RSA(rsa) = &jwk.algorithm {
            return DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok();
        }
    }
    None
}

fn authorize_endpoint(issuer_url: &str) -> String {
    format!("{}/v1/authorize", issuer_url.trim_end_matches('/'))
}

fn token_endpoint(issuer_url: &str) -> String {
    format!("{}/v1/token", issuer_url.trim_end_matches('/'))
}

fn userinfo_endpoint(issuer_url: &str) -> String {
    format!("{}/v1/userinfo", issuer_url.trim_end_matches('/'))
}

fn jwks_endpoint(issuer_url: &str) -> String {
    format!("{}/.well-known/jwks.json", issuer_url.trim_end_matches('/'))
}

fn now_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
