//! Layered configuration for the auth broker.

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Top-level broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct BrokerConfig {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// `IdP` (OIDC) configuration.
    pub idp: IdpConfig,
    /// Vault configuration.
    pub vault: VaultConfig,
    /// Team resolution and Vault role configuration.
    pub teams: TeamsConfig,
    /// Session store configuration.
    pub session: SessionConfig,
    /// Broker signing key configuration.
    pub keys: KeysConfig,
    /// Logging configuration.
    pub log: LogConfig,
    /// `iss` claim stamped on broker-issued JWTs.
    pub issuer: String,
    /// `aud` claim stamped on broker-issued JWTs.
    pub jwt_audience: String,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to, e.g. `0.0.0.0:8081`.
    pub bind_addr: String,
    /// Time allowed to drain in-flight requests during graceful shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8081".to_string(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

/// `IdP` (OIDC) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// OIDC issuer URL, e.g. `https://example.okta.com/oauth2/default`.
    pub issuer_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret. Optional — a public client with PKCE is allowed.
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Redirect URI registered with the `IdP`.
    pub redirect_uri: String,
    /// Scopes requested in the authorization URL.
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    /// Expected audience, when the `IdP` emits custom authorization-server tokens.
    #[serde(default)]
    pub audience: Option<String>,
    /// Per-call timeout for `IdP` HTTP calls.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

fn default_scopes() -> Vec<String> {
    vec![
        "openid".to_string(),
        "profile".to_string(),
        "email".to_string(),
        "groups".to_string(),
    ]
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            issuer_url: String::new(),
            client_id: String::new(),
            client_secret: None,
            redirect_uri: String::new(),
            scopes: default_scopes(),
            audience: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Vault configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Vault base URL, e.g. `https://vault.example.com:8200`.
    pub addr: String,
    /// Parent authentication token used for the broker's own Vault identity
    /// in demo/dev deployments. A production deployment authenticates this
    /// leg via `AppRole` instead; the contract with [`crate::vault`] is the same.
    pub parent_token: String,
    /// Per-call timeout for Vault HTTP calls.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            addr: String::new(),
            parent_token: String::new(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Per-team Vault role and child-token bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamDefinition {
    /// Vault JWT auth role name (usually equal to the team name).
    #[serde(default)]
    pub jwt_role: Option<String>,
    /// Vault token role name, e.g. `mobile-team-token`.
    pub token_role: String,
    /// Default child-token TTL in seconds.
    #[serde(default = "default_team_ttl")]
    pub ttl_default_secs: u64,
    /// Maximum child-token TTL in seconds.
    #[serde(default = "default_team_ttl_max")]
    pub ttl_max_secs: u64,
    /// Number of uses granted to each child token.
    #[serde(default = "default_team_uses")]
    pub uses: u32,
}

fn default_team_ttl() -> u64 {
    3600
}
fn default_team_ttl_max() -> u64 {
    7200
}
fn default_team_uses() -> u32 {
    10
}

impl TeamDefinition {
    /// The JWT auth role name, defaulting to the team name when unset.
    #[must_use]
    pub fn jwt_role_or(&self, team_name: &str) -> String {
        self.jwt_role.clone().unwrap_or_else(|| team_name.to_string())
    }
}

/// Team resolution and Vault role configuration (`TeamConfig` in the data model).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TeamsConfig {
    /// `IdP` group name → team name.
    pub group_to_team: HashMap<String, String>,
    /// Team name → team definition (roles, TTLs, uses).
    pub teams: HashMap<String, TeamDefinition>,
    /// Designated team whose token role may mint tokens for any team.
    #[serde(default)]
    pub devops_team: Option<String>,
}

impl TeamsConfig {
    /// Resolve `groups` into the ordered, deduplicated list of candidate
    /// teams, keeping only teams with a configured definition.
    #[must_use]
    pub fn candidate_teams(&self, groups: &[String]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for group in groups {
            let Some(team) = self.group_to_team.get(group) else {
                continue;
            };
            if !self.teams.contains_key(team) {
                continue;
            }
            if seen.insert(team.clone()) {
                out.push(team.clone());
            }
        }
        out
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// TTL for a session before team selection/exchange, in seconds.
    pub ttl_secs: u64,
    /// TTL once a session reaches `READY_FOR_EXCHANGE`, in seconds.
    pub exchange_ttl_secs: u64,
    /// Maximum number of live sessions before `/cli/start` and `/auth/login`
    /// return `BACKPRESSURE`.
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            exchange_ttl_secs: 300,
            max_sessions: 10_000,
        }
    }
}

/// Broker RSA signing key configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Path to the PEM-encoded RSA private key.
    pub private_key_path: String,
    /// Path to the PEM-encoded RSA public key.
    pub public_key_path: String,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            private_key_path: "keys/broker.key.pem".to_string(),
            public_key_path: "keys/broker.pub.pem".to_string(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` level filter, e.g. `info`.
    pub level: String,
    /// `text` (default) or `json`.
    #[serde(default)]
    pub format: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
        }
    }
}

impl BrokerConfig {
    /// Load configuration: built-in defaults → YAML file (if given) →
    /// `BROKER_`-prefixed environment variables (`__` nesting) → legacy flat
    /// env var overrides (`OKTA_*`, `VAULT_*`, `BROKER_BIND`, …) → `${VAR}`
    /// expansion of secret-bearing string fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(BrokerError::Config(format!(
                    "config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("BROKER_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        config.apply_legacy_env_overrides();
        config.expand_env_vars();

        Ok(config)
    }

    /// Apply the flat legacy environment variable names documented in the
    /// external interfaces (§6): `OKTA_*`, `VAULT_*`, `BROKER_BIND`, etc.
    /// These take precedence over the YAML/`BROKER__`-nested layers.
    fn apply_legacy_env_overrides(&mut self) {
        if let Ok(domain) = env::var("OKTA_DOMAIN") {
            let auth_server = env::var("OKTA_AUTH_SERVER_ID").unwrap_or_else(|_| "default".to_string());
            self.idp.issuer_url = format!("https://{domain}/oauth2/{auth_server}");
        }
        if let Ok(client_id) = env::var("OKTA_CLIENT_ID") {
            self.idp.client_id = client_id;
        }
        if let Ok(secret) = env::var("OKTA_CLIENT_SECRET") {
            self.idp.client_secret = Some(secret);
        }
        if let Ok(redirect) = env::var("OKTA_REDIRECT_URI") {
            self.idp.redirect_uri = redirect;
        }
        if let Ok(addr) = env::var("VAULT_ADDR") {
            self.vault.addr = addr;
        }
        if let Ok(token) = env::var("VAULT_ROOT_TOKEN") {
            self.vault.parent_token = token;
        }
        if let Ok(bind) = env::var("BROKER_BIND") {
            self.server.bind_addr = bind;
        }
        if let Ok(issuer) = env::var("BROKER_ISSUER") {
            self.issuer = issuer;
        }
        if let Ok(aud) = env::var("BROKER_JWT_AUDIENCE") {
            self.jwt_audience = aud;
        }
        if let Ok(Ok(v)) = env::var("BROKER_SESSION_TTL_SECS").map(|ttl| ttl.parse()) {
            self.session.ttl_secs = v;
        }
        if let Ok(Ok(v)) = env::var("BROKER_EXCHANGE_TTL_SECS").map(|ttl| ttl.parse()) {
            self.session.exchange_ttl_secs = v;
        }
        if let Ok(Ok(v)) = env::var("BROKER_SESSION_MAX").map(|max| max.parse()) {
            self.session.max_sessions = v;
        }
        if let Ok(path) = env::var("BROKER_SIGNING_KEY_PATH") {
            self.keys.private_key_path = path;
        }
        if let Ok(path) = env::var("BROKER_SIGNING_KEY_PUBLIC_PATH") {
            self.keys.public_key_path = path;
        }
        if let Ok(level) = env::var("BROKER_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(format) = env::var("BROKER_LOG_FORMAT") {
            self.log.format = Some(format);
        }
    }

    /// Expand `${VAR}` / `${VAR:-default}` patterns in secret-bearing string
    /// fields against the process environment.
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        self.vault.parent_token = Self::expand_string(&re, &self.vault.parent_token);
        self.vault.addr = Self::expand_string(&re, &self.vault.addr);
        if let Some(secret) = &self.idp.client_secret {
            self.idp.client_secret = Some(Self::expand_string(&re, secret));
        }
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Load `.env` files into the process environment before [`BrokerConfig::load`]
/// reads it, mirroring the teacher's `load_env_files` step. Missing files are
/// silently skipped.
pub fn load_dotenv(paths: &[String]) {
    for path_str in paths {
        let path = Path::new(path_str);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => tracing::info!("loaded env file: {path_str}"),
                Err(e) => tracing::warn!("failed to load env file {path_str}: {e}"),
            }
        } else {
            tracing::debug!("env file not found (skipped): {path_str}");
        }
    }
}

/// Custom humantime-style serde module for `Duration`, matching the
/// `30s`/`5m`/`100ms` suffix conventions used throughout the config.
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize `Duration` as `"<secs>s"`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", duration.as_secs()))
    }

    /// Deserialize a human-readable duration string (`30s`, `5m`, `100ms`).
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else {
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let config = BrokerConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8081");
        assert_eq!(config.session.ttl_secs, 600);
        assert_eq!(config.session.exchange_ttl_secs, 300);
    }

    #[test]
    #[allow(unsafe_code)]
    fn env_overrides_yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.yaml");
        std::fs::write(&path, "session:\n  ttl_secs: 900\n").unwrap();

        // SAFETY (test-only): env vars are process-global but this test does
        // not run concurrently with others that touch BROKER_SESSION__TTL_SECS.
        unsafe {
            env::set_var("BROKER_SESSION__TTL_SECS", "120");
        }
        let config = BrokerConfig::load(Some(&path)).unwrap();
        unsafe {
            env::remove_var("BROKER_SESSION__TTL_SECS");
        }

        assert_eq!(config.session.ttl_secs, 120, "env var should win over YAML");
    }

    #[test]
    fn yaml_overrides_defaults_when_no_env_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.yaml");
        std::fs::write(&path, "session:\n  ttl_secs: 900\n").unwrap();

        let config = BrokerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.session.ttl_secs, 900);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let result = BrokerConfig::load(Some(Path::new("/nonexistent/broker.yaml")));
        assert!(result.is_err());
    }

    #[test]
    #[allow(unsafe_code)]
    fn expand_vars_substitutes_from_environment() {
        unsafe {
            env::set_var("BROKER_TEST_VAULT_TOKEN", "s.abc123");
        }
        let mut config = BrokerConfig {
            vault: VaultConfig {
                parent_token: "${BROKER_TEST_VAULT_TOKEN}".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.expand_env_vars();
        unsafe {
            env::remove_var("BROKER_TEST_VAULT_TOKEN");
        }
        assert_eq!(config.vault.parent_token, "s.abc123");
    }

    #[test]
    fn expand_vars_falls_back_to_default() {
        let mut config = BrokerConfig {
            vault: VaultConfig {
                parent_token: "${BROKER_TEST_UNSET_TOKEN:-fallback}".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.expand_env_vars();
        assert_eq!(config.vault.parent_token, "fallback");
    }

    #[test]
    fn candidate_teams_are_ordered_and_deduplicated() {
        let mut teams = TeamsConfig::default();
        teams.group_to_team.insert("mobile-developers".to_string(), "mobile-team".to_string());
        teams.group_to_team.insert("mobile-admins".to_string(), "mobile-team".to_string());
        teams.group_to_team.insert("backend-developers".to_string(), "backend-team".to_string());
        teams.teams.insert(
            "mobile-team".to_string(),
            TeamDefinition {
                jwt_role: None,
                token_role: "mobile-team-token".to_string(),
                ttl_default_secs: 3600,
                ttl_max_secs: 7200,
                uses: 10,
            },
        );
        teams.teams.insert(
            "backend-team".to_string(),
            TeamDefinition {
                jwt_role: None,
                token_role: "backend-team-token".to_string(),
                ttl_default_secs: 3600,
                ttl_max_secs: 7200,
                uses: 10,
            },
        );

        let groups = vec![
            "mobile-developers".to_string(),
            "backend-developers".to_string(),
            "mobile-admins".to_string(),
        ];
        let candidates = teams.candidate_teams(&groups);
        assert_eq!(candidates, vec!["mobile-team", "backend-team"]);
    }

    #[test]
    fn candidate_teams_drops_unmapped_groups() {
        let teams = TeamsConfig::default();
        let candidates = teams.candidate_teams(&["nobody-knows-this-group".to_string()]);
        assert!(candidates.is_empty());
    }

    #[test]
    fn env_file_is_loaded_into_process_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "BROKER_GW_TEST_KEY=hello_from_env_file").unwrap();
        drop(f);

        load_dotenv(&[env_path.to_string_lossy().to_string()]);
        assert_eq!(env::var("BROKER_GW_TEST_KEY").unwrap(), "hello_from_env_file");
    }
}
