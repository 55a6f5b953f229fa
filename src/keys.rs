//! Key manager (C1): holds the broker's RSA signing keypair and publishes JWKS.
//!
//! The keypair is loaded once at startup from PEM files on disk — key
//! generation is explicitly out of band, so a missing file is a fatal
//! configuration error rather than something this module papers over.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{EncodingKey, Header};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::KeysConfig;
use crate::error::{BrokerError, Result};

/// A single entry in the published JWKS document.
#[derive(Debug, Clone, Serialize)]
pub struct Jwk {
    kty: &'static str,
    #[serde(rename = "use")]
    use_: &'static str,
    alg: &'static str,
    kid: String,
    n: String,
    e: String,
}

/// JWKS document served at `/.well-known/jwks.json`.
#[derive(Debug, Clone, Serialize)]
pub struct JwkSet {
    /// Every published JWK; currently always a single entry.
    pub keys: Vec<Jwk>,
}

/// Holds the broker's active RSA signing keypair.
///
/// Read-only after construction — no lock is needed since the broker does
/// not rotate keys at runtime.
pub struct KeyManager {
    encoding_key: EncodingKey,
    kid: String,
    jwk: Jwk,
}

impl KeyManager {
    /// Load the signing keypair from the configured PEM file paths.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Config`] if either file is missing or does not
    /// parse as a PKCS#1/PKCS#8 RSA key.
    pub fn load(config: &KeysConfig) -> Result<Self> {
        let private_pem = std::fs::read_to_string(&config.private_key_path).map_err(|e| {
            BrokerError::Config(format!(
                "reading signing key {}: {e}",
                config.private_key_path
            ))
        })?;

        let private_key = parse_rsa_private_key(&private_pem).map_err(|e| {
            BrokerError::Config(format!(
                "parsing signing key {}: {e}",
                config.private_key_path
            ))
        })?;

        let public_key = match std::fs::read_to_string(&config.public_key_path) {
            Ok(pem) => parse_rsa_public_key(&pem).map_err(|e| {
                BrokerError::Config(format!(
                    "parsing public key {}: {e}",
                    config.public_key_path
                ))
            })?,
            Err(_) => private_key.to_public_key(),
        };

        let encoding_key = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| BrokerError::Config(format!("loading signing key for JWS: {e}")))?;

        let kid = derive_kid(&public_key)?;
        let jwk = build_jwk(&public_key, &kid);

        Ok(Self {
            encoding_key,
            kid,
            jwk,
        })
    }

    /// Stable key id for the active signer, derived from SHA-256 of the
    /// DER-encoded public key.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Sign a JWT header+claims pair with the broker's private key, returning
    /// the compact JWS.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Internal`] if signing fails.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(jsonwebtoken::Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, claims, &self.encoding_key)
            .map_err(|e| BrokerError::Internal(format!("signing JWT: {e}")))
    }

    /// The JWKS document exposing the public half of the active signer.
    #[must_use]
    pub fn jwks(&self) -> JwkSet {
        JwkSet {
            keys: vec![self.jwk.clone()],
        }
    }
}

fn parse_rsa_private_key(pem: &str) -> std::result::Result<RsaPrivateKey, String> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| e.to_string())
}

fn parse_rsa_public_key(pem: &str) -> std::result::Result<RsaPublicKey, String> {
    RsaPublicKey::from_public_key_pem(pem).map_err(|e| e.to_string())
}

fn derive_kid(public_key: &RsaPublicKey) -> Result<String> {
    let der = public_key
        .to_public_key_der()
        .map_err(|e| BrokerError::Config(format!("encoding public key DER: {e}")))?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(digest))
}

fn build_jwk(public_key: &RsaPublicKey, kid: &str) -> Jwk {
    Jwk {
        kty: "RSA",
        use_: "sig",
        alg: "RS256",
        kid: kid.to_string(),
        n: URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};
    use serde::Deserialize;

    fn write_test_keypair(dir: &std::path::Path) -> KeysConfig {
        let mut rng = rand08::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = private_key.to_public_key();

        let private_path = dir.join("broker.key.pem");
        let public_path = dir.join("broker.pub.pem");
        std::fs::write(
            &private_path,
            private_key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();
        std::fs::write(
            &public_path,
            public_key.to_public_key_pem(LineEnding::LF).unwrap(),
        )
        .unwrap();

        KeysConfig {
            private_key_path: private_path.to_string_lossy().to_string(),
            public_key_path: public_path.to_string_lossy().to_string(),
        }
    }

    #[derive(Serialize, Deserialize)]
    struct TestClaims {
        sub: String,
        exp: u64,
    }

    #[test]
    fn loads_keypair_and_signs() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_test_keypair(dir.path());
        let manager = KeyManager::load(&config).unwrap();

        let token = manager
            .sign(&TestClaims {
                sub: "mobile-team".to_string(),
                exp: 9_999_999_999,
            })
            .unwrap();
        assert!(token.split('.').count() == 3);
    }

    #[test]
    fn jwks_round_trips_against_signed_kid() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_test_keypair(dir.path());
        let manager = KeyManager::load(&config).unwrap();

        let token = manager
            .sign(&TestClaims {
                sub: "backend-team".to_string(),
                exp: 9_999_999_999,
            })
            .unwrap();
        let header = jsonwebtoken::decode_header(&token).unwrap();
        let jwks = manager.jwks();

        assert_eq!(header.kid.as_deref(), Some(manager.kid()));
        assert!(jwks.keys.iter().any(|k| Some(k.kid.as_str()) == header.kid.as_deref()));
    }

    #[test]
    fn missing_key_file_is_a_config_error() {
        let config = KeysConfig {
            private_key_path: "/nonexistent/broker.key.pem".to_string(),
            public_key_path: "/nonexistent/broker.pub.pem".to_string(),
        };
        let result = KeyManager::load(&config);
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }

    #[test]
    fn derives_public_key_from_private_when_public_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_test_keypair(dir.path());
        config.public_key_path = "/nonexistent/broker.pub.pem".to_string();
        let manager = KeyManager::load(&config);
        assert!(manager.is_ok());
    }
}
