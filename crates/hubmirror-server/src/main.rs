use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use hubmirror_server::{app, AppState, Args, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hubmirror_server=debug".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args).context("loading configuration")?;
    if config.ssl_key.is_some() || config.ssl_cert.is_some() {
        warn!("ssl-key/ssl-cert are recorded but TLS is expected to terminate at a fronting proxy");
    }
    std::fs::create_dir_all(&config.repos_path).context("creating repos path")?;

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config).context("building http clients")?;
    state.reaper().spawn();

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, repos_path = %state.config.repos_path.display(), "hubmirror listening");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install ctrl-c handler");
    }
}
