mod config;
mod connection;
mod handlers;
mod protocol;
mod state;

use std::sync::Arc;

use clap::Parser;
use ghostline_core::{AgentLoop, OpenAiOracle, PtySpawner, SessionManager};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::{Args, FileConfig};
use state::DaemonState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let token = if args.require_auth() {
        match &args.token {
            Some(t) => Some(t.clone()),
            None => {
                error!("Token required. Use --token or set GHOSTLINE_DAEMON_TOKEN");
                std::process::exit(1);
            }
        }
    } else {
        warn!("Auth disabled (--insecure-no-auth). Do not use in production!");
        None
    };

    let config_path = args.config_path();
    info!(path = %config_path.display(), "config file");
    let file_config = FileConfig::load(&config_path)?;

    let oracle_config = file_config.resolved_oracle();
    let has_api_key = !oracle_config.api_key.is_empty();
    if !has_api_key {
        warn!("No oracle API key configured; suggestions will fail and the agent is unavailable");
    }
    let oracle = Arc::new(OpenAiOracle::new(oracle_config)?);

    let (gates_tx, gates_rx) = watch::channel(file_config.settings);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = SessionManager::new(
        file_config.session.clone(),
        Arc::new(PtySpawner),
        oracle.clone(),
        gates_rx,
        events_tx,
    );
    let agent = has_api_key.then(|| Arc::new(AgentLoop::new(oracle, file_config.agent.clone())));

    let state = Arc::new(DaemonState::new(
        token,
        manager,
        agent,
        gates_tx,
        file_config,
        config_path,
    ));
    tokio::spawn(state.clone().forward_events(events_rx));

    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        connection::handle_client(stream, state).await;
                    });
                }
                Err(e) => error!(error = %e, "accept error"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    state.shutdown().await;
    Ok(())
}
