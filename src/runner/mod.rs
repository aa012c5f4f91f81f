//! The job runner: a polling loop that claims queued jobs and hands each
//! one to its own executor task.

pub mod executor;

use tokio_util::sync::CancellationToken;

use crate::api::AppState;
use crate::job::Status;

pub use executor::Executor;

/// Poll the queue until shutdown. Each claimed job executes on a detached
/// task; the loop never awaits executors and never exits on a claim error.
pub async fn run(state: AppState, shutdown: CancellationToken) {
    let interval = state.settings.poll_interval();
    tracing::info!(interval_ms = interval.as_millis() as u64, "job runner started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("job runner stopped");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        claim(&state).await;
    }
}

/// Claim the oldest queued job, if any, and dispatch it.
async fn claim(state: &AppState) {
    let job = match state.storage.claim_job().await {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            tracing::error!(error = %e, "unable to claim a job");
            return;
        }
    };

    // A bad job should have been rejected at submission; if one slipped
    // through, terminate it rather than crash an executor.
    if let Err(e) = job.job.verify() {
        tracing::error!(
            jid = job.jid,
            account = %job.account,
            error = %e,
            "invalid job in queue"
        );

        let mut job = job;
        job.transition(Status::Error);
        if let Err(e) = state.storage.update_job(&job).await {
            tracing::error!(jid = job.jid, error = %e, "unable to record invalid job");
        }
        return;
    }

    let executor = Executor::from_state(state);
    tokio::spawn(executor.execute(job));
}
