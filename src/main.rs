use anyhow::Error;
use clap::Parser;
use std::env;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use scribeq::api::AppState;
use scribeq::client::WorkerClient;
use scribeq::config::ConfigContext;
use scribeq::db::DbHandle;
use scribeq::memory::MemoryStore;
use scribeq::{server, telemetry};

#[instrument(skip_all)]
async fn setup(cancel_token: CancellationToken, config: ConfigContext) -> Result<(), Error> {
    let transcriber = Arc::new(WorkerClient::new(
        &config.worker_url,
        &config.worker_secret,
        config.transcribe_timeout,
        config.health_timeout,
        cancel_token.clone(),
    )?);

    let state = match &config.connect_url {
        Some(connect_url) => {
            info!("Using PostgreSQL store");
            let handle = DbHandle::new(connect_url, config.db_connections).await?;
            AppState::new(
                Arc::new(handle),
                transcriber,
                config.auth_boundary(),
                config.retry_policy(),
                config.batch_ceiling(),
            )
        }
        None => {
            info!("No connect URL given, using in-memory store");
            AppState::new(
                Arc::new(MemoryStore::new()),
                transcriber,
                config.auth_boundary(),
                config.retry_policy(),
                config.batch_ceiling(),
            )
        }
    };

    server::serve(cancel_token, &config.listen, config.poll_settings(), state).await
}

async fn wait_for_signal(token: CancellationToken) -> Result<(), Error> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
        _ = token.cancelled() => {},
    }
    token.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "scribeq=debug");
    }

    let config = ConfigContext::parse();
    telemetry::init(config.jaeger_endpoint.as_deref())?;

    let token = CancellationToken::new();

    let signals = tokio::spawn(wait_for_signal(token.clone()));
    let app = tokio::spawn(setup(token.clone(), config));

    let result = app.await?;
    token.cancel();
    if let Err(err) = signals.await? {
        error!("Signal handling failed: {}", err);
    }

    info!("Shutting down.");
    telemetry::shutdown();

    result.map_err(Into::into)
}
