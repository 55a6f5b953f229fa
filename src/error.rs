//! Error taxonomy for the auth broker.
//!
//! `BrokerError` is the single closed enum every component returns. Only the
//! HTTP layer ([`crate::http`]) ever calls [`BrokerError::status_code`] or
//! [`BrokerError::error_kind`] — the session store, `IdP` client, and Vault
//! client propagate `BrokerError` and never construct an HTTP status
//! themselves.

use thiserror::Error;

/// Result type alias for the broker.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Closed error taxonomy, one variant per wire-visible kind plus `Config`
/// and `Internal` catch-alls.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Configuration could not be loaded or was invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Session store is at capacity.
    #[error("session store is at capacity")]
    Backpressure,

    /// `state` parameter missing or did not match the session.
    #[error("invalid state parameter")]
    InvalidState,

    /// ID token failed signature/issuer/audience/nonce/expiry validation.
    #[error("ID token invalid: {0}")]
    IdTokenInvalid(String),

    /// User's groups resolved to zero recognized teams.
    #[error("no team assignment for this user")]
    NoTeamAssignment,

    /// Team selection named a team outside `candidate_teams`.
    #[error("invalid team selection")]
    InvalidTeamSelection,

    /// An `/exchange` metadata field exceeded its 256-byte size bound.
    #[error("invalid exchange metadata: {0}")]
    InvalidMetadata(String),

    /// Unknown `session_id`.
    #[error("session not found")]
    SessionNotFound,

    /// Session exists but is not in `READY_FOR_EXCHANGE`.
    #[error("session not ready for exchange")]
    SessionNotReady,

    /// Session TTL has passed.
    #[error("session expired")]
    SessionExpired,

    /// Session was already exchanged once.
    #[error("session already used")]
    SessionAlreadyUsed,

    /// Transport-level failure reaching the `IdP`.
    #[error("`IdP` unreachable: {0}")]
    IdpUnreachable(String),

    /// `IdP` token endpoint responded with a non-2xx status or malformed body.
    #[error("`IdP` returned a bad response: {0}")]
    IdpBadResponse(String),

    /// Transport-level failure reaching Vault.
    #[error("Vault unreachable: {0}")]
    VaultUnreachable(String),

    /// Vault rejected the broker's JWT login.
    #[error("Vault rejected broker authentication: {0}")]
    VaultAuthRejected(String),

    /// The configured Vault role does not exist.
    #[error("Vault role missing: {0}")]
    VaultRoleMissing(String),

    /// The Vault token role forbids the requested policies.
    #[error("Vault denied requested policies: {0}")]
    VaultPolicyDenied(String),

    /// Unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// HTTP status code for this error kind, per the error taxonomy.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Backpressure => 503,
            Self::InvalidState | Self::IdTokenInvalid(_) | Self::InvalidTeamSelection | Self::InvalidMetadata(_) => 400,
            Self::NoTeamAssignment => 403,
            Self::SessionNotFound => 404,
            Self::SessionNotReady | Self::SessionAlreadyUsed => 409,
            Self::SessionExpired => 410,
            Self::IdpUnreachable(_)
            | Self::IdpBadResponse(_)
            | Self::VaultUnreachable(_)
            | Self::VaultAuthRejected(_)
            | Self::VaultRoleMissing(_)
            | Self::VaultPolicyDenied(_) => 502,
            Self::Config(_) | Self::Internal(_) => 500,
        }
    }

    /// Wire-visible `error` field value, matching the taxonomy table.
    #[must_use]
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Backpressure => "BACKPRESSURE",
            Self::InvalidState => "INVALID_STATE",
            Self::IdTokenInvalid(_) => "ID_TOKEN_INVALID",
            Self::NoTeamAssignment => "NO_TEAM_ASSIGNMENT",
            Self::InvalidTeamSelection => "INVALID_TEAM_SELECTION",
            Self::InvalidMetadata(_) => "INVALID_METADATA",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionNotReady => "SESSION_NOT_READY",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::SessionAlreadyUsed => "SESSION_ALREADY_USED",
            Self::IdpUnreachable(_) => "IDP_UNREACHABLE",
            Self::IdpBadResponse(_) => "IDP_BAD_RESPONSE",
            Self::VaultUnreachable(_) => "VAULT_UNREACHABLE",
            Self::VaultAuthRejected(_) => "VAULT_AUTH_REJECTED",
            Self::VaultRoleMissing(_) => "VAULT_ROLE_MISSING",
            Self::VaultPolicyDenied(_) => "VAULT_POLICY_DENIED",
            Self::Config(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    /// Whether a client may reasonably retry after this error.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Backpressure | Self::IdpUnreachable(_) | Self::VaultUnreachable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(BrokerError::Backpressure.status_code(), 503);
        assert_eq!(BrokerError::InvalidState.status_code(), 400);
        assert_eq!(BrokerError::InvalidMetadata(String::new()).status_code(), 400);
        assert_eq!(BrokerError::NoTeamAssignment.status_code(), 403);
        assert_eq!(BrokerError::SessionNotFound.status_code(), 404);
        assert_eq!(BrokerError::SessionNotReady.status_code(), 409);
        assert_eq!(BrokerError::SessionExpired.status_code(), 410);
        assert_eq!(BrokerError::SessionAlreadyUsed.status_code(), 409);
        assert_eq!(BrokerError::IdpUnreachable(String::new()).status_code(), 502);
        assert_eq!(BrokerError::VaultAuthRejected(String::new()).status_code(), 502);
        assert_eq!(BrokerError::Internal(String::new()).status_code(), 500);
    }

    #[test]
    fn error_kinds_are_screaming_snake_case() {
        assert_eq!(BrokerError::InvalidState.error_kind(), "INVALID_STATE");
        assert_eq!(
            BrokerError::SessionAlreadyUsed.error_kind(),
            "SESSION_ALREADY_USED"
        );
    }

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(BrokerError::Backpressure.retryable());
        assert!(BrokerError::VaultUnreachable(String::new()).retryable());
        assert!(!BrokerError::InvalidState.retryable());
        assert!(!BrokerError::SessionAlreadyUsed.retryable());
    }
}
