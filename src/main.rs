//! Bazel Auth Broker — OAuth2/OIDC-to-Vault authentication broker.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info};

use bazel_auth_broker::broker::AppState;
use bazel_auth_broker::config::{BrokerConfig, load_dotenv};
use bazel_auth_broker::http::create_router;
use bazel_auth_broker::idp::IdpClient;
use bazel_auth_broker::keys::KeyManager;
use bazel_auth_broker::session::{SessionStore, spawn_reaper};
use bazel_auth_broker::vault::VaultClient;
use bazel_auth_broker::{cli::Cli, setup_tracing};

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);
const SHUTDOWN_DRAIN_PERMITS: u32 = 10_000;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let env_file_paths: Vec<String> = cli.env_files.iter().map(|p| p.to_string_lossy().to_string()).collect();
    load_dotenv(&env_file_paths);

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("failed to set up tracing: {e}");
        return ExitCode::FAILURE;
    }

    let mut config = match BrokerConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };
    if let Some(bind) = &cli.bind {
        config.server.bind_addr = bind.clone();
    }

    let keys = match KeyManager::load(&config.keys) {
        Ok(k) => k,
        Err(e) => {
            error!("failed to load signing key: {e}");
            return ExitCode::from(1);
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.server.bind_addr,
        "starting bazel-auth-broker"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let sessions = Arc::new(SessionStore::new(config.session.max_sessions));
    let reaper = spawn_reaper(sessions.clone(), SWEEP_INTERVAL, shutdown_tx.subscribe());

    let state = Arc::new(AppState {
        keys: Arc::new(keys),
        idp: Arc::new(IdpClient::new(config.idp.clone())),
        sessions,
        teams: Arc::new(config.teams.clone()),
        vault: Arc::new(VaultClient::new(&config.vault)),
        issuer: config.issuer.clone(),
        jwt_audience: config.jwt_audience.clone(),
        session_ttl_secs: config.session.ttl_secs,
        inflight: Arc::new(tokio::sync::Semaphore::new(SHUTDOWN_DRAIN_PERMITS as usize)),
    });

    let app = create_router(state.clone());

    let listener = match TcpListener::bind(&config.server.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {e}", config.server.bind_addr);
            return ExitCode::from(2);
        }
    };

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await;

    if let Err(e) = serve_result {
        error!("server error: {e}");
        return ExitCode::from(2);
    }

    if tokio::time::timeout(
        config.server.shutdown_grace,
        state.inflight.acquire_many(SHUTDOWN_DRAIN_PERMITS),
    )
    .await
    .is_err()
    {
        tracing::warn!("shutdown grace period elapsed with requests still in flight");
    }

    reaper.abort();
    info!("shutdown complete");
    ExitCode::SUCCESS
}

async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    let _ = shutdown_tx.send(());
}
