use anyhow::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::api::{self, AppState};
use crate::scheduler::{ClaimFilter, Scheduler};

/// Optional in-process trigger; without it batches only run when the
/// process endpoints are hit.
#[derive(Debug, Clone, Copy, Default)]
pub struct PollSettings {
    pub interval: Option<Duration>,
    pub stale_after: Option<Duration>,
}

pub async fn serve(
    cancel_token: CancellationToken,
    listen: &str,
    poll: PollSettings,
    state: AppState,
) -> Result<(), Error> {
    let listener = TcpListener::bind(listen).await?;
    info!(address = %listener.local_addr()?, "Listening");

    let mut tasks = vec![];
    if let Some(interval) = poll.interval {
        let cancel_token = cancel_token.clone();
        let scheduler = state.scheduler.clone();
        tasks.push(tokio::spawn(
            poll_loop(cancel_token, scheduler, interval, poll.stale_after).instrument(info_span!("poller")),
        ));
    }

    let shutdown = cancel_token.clone();
    let result = axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;

    // The poller must stop even when the listener died on its own.
    cancel_token.cancel();
    futures::future::join_all(tasks)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    result?;
    info!("Server stopped.");
    Ok(())
}

async fn poll_loop(
    cancel_token: CancellationToken,
    scheduler: Arc<Scheduler>,
    interval: Duration,
    stale_after: Option<Duration>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Poller Cancelled");
                break;
            },
            _ = ticker.tick() => {
                if let Some(stale_after) = stale_after {
                    if let Err(err) = scheduler.release_stale(stale_after).await {
                        error!(message = "Failed to release stale items", error = %err);
                    }
                }
                match scheduler.run_batch(ClaimFilter::default()).await {
                    Ok(summary) if summary.processed > 0 => {
                        debug!(processed = summary.processed, completed = summary.completed, "Poll batch done");
                    },
                    Ok(_) => trace!("Nothing to process"),
                    Err(err) => error!(message = "Poll batch failed", error = %err),
                }
            },
        }
    }
}
