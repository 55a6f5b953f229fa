//! Broker JWT issuer (C5): mints the short-lived RS256 JWT the broker
//! presents to Vault's JWT auth mount.
//!
//! The subject is always the *selected* team — never a raw group or the
//! candidate list — so there is no code path that can substitute the first
//! group a user happens to belong to (see the audience/subject mapping
//! design note in the project's open-questions record).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::keys::KeyManager;
use crate::session::UserIdentity;

/// `exp - iat` for every broker-issued JWT.
pub const TOKEN_LIFETIME_SECS: u64 = 300;

/// Untrusted metadata supplied to `/exchange`, woven into the broker JWT and
/// thence into Vault child-token metadata. Each field is size-bounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeMetadata {
    #[serde(default)]
    /// CI pipeline identifier, when `/exchange` is called from CI.
    pub pipeline: Option<String>,
    #[serde(default)]
    /// Source repository, when `/exchange` is called from CI.
    pub repo: Option<String>,
    #[serde(default)]
    /// Build target, when `/exchange` is called from CI.
    pub target: Option<String>,
    #[serde(default)]
    /// CI run id, for correlating the minted token with a specific run.
    pub run_id: Option<String>,
}

/// Maximum size, in bytes, of any single `ExchangeMetadata` field.
pub const MAX_METADATA_FIELD_BYTES: usize = 256;

impl ExchangeMetadata {
    /// Whether every populated field is within [`MAX_METADATA_FIELD_BYTES`].
    #[must_use]
    pub fn within_size_bounds(&self) -> bool {
        [&self.pipeline, &self.repo, &self.target, &self.run_id]
            .into_iter()
            .flatten()
            .all(|f| f.len() <= MAX_METADATA_FIELD_BYTES)
    }
}

/// Claims of the broker-signed JWT presented to Vault's JWT auth mount.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerJwtClaims {
    /// Always the broker's own issuer identifier.
    pub iss: String,
    /// Always the configured Vault JWT auth audience.
    pub aud: String,
    /// Always the selected team — never a raw group or the candidate list.
    pub sub: String,
    /// Issued-at, Unix seconds.
    pub iat: u64,
    /// Expiry, Unix seconds ([`TOKEN_LIFETIME_SECS`] after `iat`).
    pub exp: u64,
    /// Resolved user email.
    pub user_email: String,
    /// Resolved display name, when the `IdP` provided one.
    pub user_name: Option<String>,
    /// ID token `sub` claim of the authenticated user.
    pub user_sub: String,
    /// Resolved group membership at the time of exchange.
    pub groups: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CI pipeline identifier, carried through from `ExchangeMetadata`.
    pub pipeline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Source repository, carried through from `ExchangeMetadata`.
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Build target, carried through from `ExchangeMetadata`.
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CI run id, carried through from `ExchangeMetadata`.
    pub run_id: Option<String>,
}

/// Construct and sign a broker JWT for `selected_team`. The JWT is ephemeral
/// and is never persisted by the broker.
///
/// # Errors
///
/// Returns an error if signing fails.
pub fn issue(
    keys: &KeyManager,
    issuer: &str,
    audience: &str,
    selected_team: &str,
    user: &UserIdentity,
    metadata: &ExchangeMetadata,
) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let claims = BrokerJwtClaims {
        iss: issuer.to_string(),
        aud: audience.to_string(),
        sub: selected_team.to_string(),
        iat: now,
        exp: now + TOKEN_LIFETIME_SECS,
        user_email: user.email.clone(),
        user_name: user.display_name.clone(),
        user_sub: user.subject.clone(),
        groups: user.groups.clone(),
        pipeline: metadata.pipeline.clone(),
        repo: metadata.repo.clone(),
        target: metadata.target.clone(),
        run_id: metadata.run_id.clone(),
    };

    keys.sign(&claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeysConfig;
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    fn test_key_manager(dir: &std::path::Path) -> (KeyManager, String) {
        let mut rng = rand08::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = rsa::RsaPublicKey::from(&private_key);
        let private_path = dir.join("k.pem");
        let public_path = dir.join("k.pub.pem");
        std::fs::write(&private_path, private_key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();
        let public_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();
        std::fs::write(&public_path, &public_pem).unwrap();
        let manager = KeyManager::load(&KeysConfig {
            private_key_path: private_path.to_string_lossy().to_string(),
            public_key_path: public_path.to_string_lossy().to_string(),
        })
        .unwrap();
        (manager, public_pem)
    }

    #[test]
    fn sub_claim_is_exactly_selected_team() {
        let dir = tempfile::tempdir().unwrap();
        let (keys, public_pem) = test_key_manager(dir.path());
        let user = UserIdentity {
            email: "alice@example.com".to_string(),
            display_name: Some("Alice".to_string()),
            subject: "u1".to_string(),
            groups: vec!["mobile-developers".to_string(), "backend-developers".to_string()],
        };

        let token = issue(
            &keys,
            "bazel-auth-broker",
            "bazel-vault",
            "backend-team",
            &user,
            &ExchangeMetadata::default(),
        )
        .unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.set_audience(&["bazel-vault"]);
        let decoding_key = jsonwebtoken::DecodingKey::from_rsa_pem(public_pem.as_bytes()).unwrap();
        let decoded =
            jsonwebtoken::decode::<BrokerJwtClaims>(&token, &decoding_key, &validation).unwrap();

        // The team explicitly selected by the user, never the first group.
        assert_eq!(decoded.claims.sub, "backend-team");
        assert_ne!(decoded.claims.sub, user.groups[0]);
        assert_eq!(decoded.claims.iss, "bazel-auth-broker");
        assert_eq!(decoded.claims.aud, "bazel-vault");
    }

    #[test]
    fn token_lifetime_is_five_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let (keys, public_pem) = test_key_manager(dir.path());
        let user = UserIdentity {
            email: "a@b.com".to_string(),
            display_name: None,
            subject: "u1".to_string(),
            groups: vec![],
        };
        let token = issue(&keys, "iss", "aud", "team", &user, &ExchangeMetadata::default()).unwrap();

        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::RS256);
        validation.validate_aud = false;
        let decoding_key = jsonwebtoken::DecodingKey::from_rsa_pem(public_pem.as_bytes()).unwrap();
        let decoded =
            jsonwebtoken::decode::<BrokerJwtClaims>(&token, &decoding_key, &validation).unwrap();
        assert_eq!(decoded.claims.exp - decoded.claims.iat, TOKEN_LIFETIME_SECS);
    }

    #[test]
    fn oversized_metadata_field_fails_size_bound_check() {
        let metadata = ExchangeMetadata {
            pipeline: Some("x".repeat(MAX_METADATA_FIELD_BYTES + 1)),
            ..Default::default()
        };
        assert!(!metadata.within_size_bounds());
    }

    #[test]
    fn metadata_within_bounds_passes() {
        let metadata = ExchangeMetadata {
            pipeline: Some("ci".to_string()),
            repo: Some("monorepo".to_string()),
            ..Default::default()
        };
        assert!(metadata.within_size_bounds());
    }
}
