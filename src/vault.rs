//! Vault client (C6): authenticates the broker's minted JWT against Vault's
//! JWT auth mount, then mints a team-scoped child token.
//!
//! Grounded in the `vault_request` shape used by `HashiCorp Vault` HTTP API
//! clients in this lineage — URL built by joining `v1/` onto the configured
//! address, `X-Vault-Token`/`X-Vault-Request` headers, 200/204 as the only
//! success statuses. Retries are limited to transport failures and 5xx and
//! never touch 4xx, since those indicate a rejected login or a missing role,
//! not a transient condition.

use std::collections::HashMap;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::VaultConfig;
use crate::error::{BrokerError, Result};

/// Result of `auth/jwt/login`: the parent token used once to mint a child
/// token, then discarded.
#[derive(Debug, Clone)]
pub struct ParentAuth {
    /// Token used once to mint the child token, then discarded.
    pub client_token: String,
    /// Policies Vault attached to the parent token.
    pub policies: Vec<String>,
    /// Vault identity entity id, for audit correlation.
    pub entity_id: String,
    /// Remaining lease duration in seconds.
    pub lease_duration: u64,
}

/// A minted, team-scoped Vault child token.
#[derive(Debug, Clone, Serialize)]
pub struct ChildToken {
    /// The child token itself, handed back to the client.
    pub token: String,
    /// Token TTL in seconds.
    pub ttl_seconds: u64,
    /// Remaining use count before Vault revokes the token.
    pub uses_remaining: u32,
    /// Policies attached to the child token.
    pub policies: Vec<String>,
}

#[derive(Serialize)]
struct JwtLoginRequest<'a> {
    jwt: &'a str,
    role: &'a str,
}

#[derive(Deserialize)]
struct VaultAuthResponse {
    auth: VaultAuthBlock,
}

#[derive(Deserialize)]
struct VaultAuthBlock {
    client_token: String,
    #[serde(default)]
    policies: Vec<String>,
    #[serde(default)]
    entity_id: String,
    lease_duration: u64,
    #[serde(default)]
    num_uses: u32,
}

#[derive(Serialize)]
struct TokenCreateRequest {
    ttl: String,
    num_uses: u32,
    meta: HashMap<String, String>,
}

/// HTTP client for the Vault operations the broker needs: JWT login and
/// bounded child-token minting.
pub struct VaultClient {
    addr: String,
    http: reqwest::Client,
}

impl VaultClient {
    /// Build a client bound to the configured Vault address and timeout.
    #[must_use]
    pub fn new(config: &VaultConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            addr: config.addr.clone(),
            http,
        }
    }

    /// Log in to Vault's JWT auth mount as `jwt_role` using the broker's
    /// minted `broker_jwt`. Retries transport failures and 5xx up to 3 times
    /// with exponential backoff (250ms, 1s, 4s); never retries 4xx.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::VaultUnreachable`] on persistent transport/5xx
    /// failure, or [`BrokerError::VaultAuthRejected`]/[`BrokerError::VaultRoleMissing`]
    /// on a rejected login.
    pub async fn authenticate_as_team(&self, jwt_role: &str, broker_jwt: &str) -> Result<ParentAuth> {
        let body = JwtLoginRequest {
            jwt: broker_jwt,
            role: jwt_role,
        };

        let response = (|| self.post("auth/jwt/login", None, &body))
            .retry(retry_policy())
            .when(|e: &BrokerError| e.retryable())
            .await?;

        let parsed: VaultAuthResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Internal(format!("malformed vault login response: {e}")))?;

        Ok(ParentAuth {
            client_token: parsed.auth.client_token,
            policies: parsed.auth.policies,
            entity_id: parsed.auth.entity_id,
            lease_duration: parsed.auth.lease_duration,
        })
    }

    /// Mint a bounded child token under `token_role` using `parent_token`,
    /// which is used exactly once here and then discarded by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::VaultUnreachable`] on persistent transport/5xx
    /// failure, [`BrokerError::VaultRoleMissing`] if the role does not exist,
    /// or [`BrokerError::VaultPolicyDenied`] if the role forbids the request.
    pub async fn create_child_token(
        &self,
        parent_token: &str,
        token_role: &str,
        metadata: HashMap<String, String>,
        ttl_secs: u64,
        uses: u32,
    ) -> Result<ChildToken> {
        let path = format!("auth/token/create/{token_role}");
        let body = TokenCreateRequest {
            ttl: format!("{ttl_secs}s"),
            num_uses: uses,
            meta: metadata,
        };

        let response = (|| self.post(&path, Some(parent_token), &body))
            .retry(retry_policy())
            .when(|e: &BrokerError| e.retryable())
            .await?;

        let parsed: VaultAuthResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Internal(format!("malformed vault token response: {e}")))?;

        Ok(ChildToken {
            token: parsed.auth.client_token,
            ttl_seconds: parsed.auth.lease_duration,
            uses_remaining: if parsed.auth.num_uses == 0 {
                uses
            } else {
                parsed.auth.num_uses
            },
            policies: parsed.auth.policies,
        })
    }

    /// Best-effort reachability probe against Vault's unauthenticated health
    /// endpoint, used by `/health`. Never returns an error — an unreachable
    /// Vault is reported as `false`, not propagated.
    pub async fn is_reachable(&self) -> bool {
        let Ok(url) = Url::parse(&self.addr).and_then(|u| u.join("v1/sys/health")) else {
            return false;
        };
        self.http
            .get(url)
            .send()
            .await
            .is_ok_and(|r| r.status().as_u16() < 500)
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        token: Option<&str>,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = Url::parse(&self.addr)
            .and_then(|u| u.join("v1/"))
            .and_then(|u| u.join(path))
            .map_err(|e| BrokerError::Internal(format!("invalid vault address: {e}")))?;

        let mut request = self.http.post(url).header("X-Vault-Request", "true").json(body);
        if let Some(t) = token {
            request = request.header("X-Vault-Token", t);
        }

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::VaultUnreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status.is_server_error() {
            return Err(BrokerError::VaultUnreachable(format!("HTTP {status}")));
        }

        let body_text = response.text().await.unwrap_or_default();
        if status.as_u16() == 404 || body_text.contains("unsupported path") || body_text.contains("role") && body_text.contains("not found") {
            return Err(BrokerError::VaultRoleMissing(body_text));
        }
        if body_text.to_lowercase().contains("polic") {
            return Err(BrokerError::VaultPolicyDenied(body_text));
        }
        Err(BrokerError::VaultAuthRejected(format!("HTTP {status}: {body_text}")))
    }
}

fn retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(250))
        .with_factor(4.0)
        .with_max_times(3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_caps_attempts_at_three() {
        use backon::BackoffBuilder;
        let policy = retry_policy();
        let delays: Vec<_> = policy.build().collect();
        assert_eq!(delays.len(), 3);
    }

    #[test]
    fn child_token_carries_policies_and_ttl() {
        let token = ChildToken {
            token: "s.xyz".to_string(),
            ttl_seconds: 3600,
            uses_remaining: 10,
            policies: vec!["base".to_string(), "mobile-team-policy".to_string()],
        };
        assert_eq!(token.ttl_seconds, 3600);
        assert_eq!(token.policies.len(), 2);
    }
}
