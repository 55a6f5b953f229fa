//! Command-line interface

use std::path::PathBuf;

use clap::Parser;

/// OAuth2/OIDC-to-Vault authentication broker
#[derive(Parser, Debug)]
#[command(name = "bazel-auth-broker")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "BROKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// `.env` files to load before configuration is read, in order
    #[arg(long = "env-file")]
    pub env_files: Vec<PathBuf>,

    /// Address to bind to, e.g. `0.0.0.0:8081`
    #[arg(long, env = "BROKER_BIND")]
    pub bind: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "BROKER_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "BROKER_LOG_FORMAT")]
    pub log_format: Option<String>,
}
