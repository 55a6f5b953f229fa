//! Bazel Auth Broker
//!
//! An OAuth 2.0 Authorization Code + PKCE broker between developer/CI
//! clients, an external OIDC identity provider, and `HashiCorp Vault`. Turns a
//! successful interactive login into a short-lived, team-scoped Vault child
//! token.
//!
//! # Components
//!
//! - [`keys`] — RSA signing keypair and JWKS publishing.
//! - [`idp`] — OIDC authorization, code exchange, ID token verification.
//! - [`session`] — in-memory, TTL-bounded authentication session store.
//! - [`teams`] — group-to-team resolution.
//! - [`issuer`] — broker JWT minting.
//! - [`vault`] — Vault JWT login and child-token creation.
//! - [`broker`] — orchestrates the above into the end-to-end flow.
//! - [`http`] — the `axum` router and request/response wire shapes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod idp;
pub mod issuer;
pub mod keys;
pub mod session;
pub mod teams;
pub mod vault;

pub use error::{BrokerError, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Set up the global `tracing` subscriber, human-readable or JSON depending
/// on `format`.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
