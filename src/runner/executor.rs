//! Per-job execution: container lifecycle, output capture, result
//! extraction, kill coordination, and usage accounting.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use futures_util::StreamExt;

use crate::api::AppState;
use crate::docker::{ContainerDriver, OutputStream, StreamKind};
use crate::job::{ResultSource, Status, SubmittedJob, Timestamp};
use crate::storage::Storage;

/// Runs one claimed job to completion. Every job gets a fresh executor on
/// its own task; nothing is shared between executors except storage.
pub struct Executor {
    storage: Arc<dyn Storage>,
    docker: Arc<dyn ContainerDriver>,
    image: String,
}

impl Executor {
    pub fn new(storage: Arc<dyn Storage>, docker: Arc<dyn ContainerDriver>, image: String) -> Self {
        Executor {
            storage,
            docker,
            image,
        }
    }

    pub fn from_state(state: &AppState) -> Self {
        Executor::new(
            state.storage.clone(),
            state.docker.clone(),
            state.settings.default_image.clone(),
        )
    }

    /// Drive the job through its container from claim to terminal status.
    /// Errors never propagate out of here; the job always ends terminal.
    pub async fn execute(self, mut job: SubmittedJob) {
        let jid = job.jid;
        let account = job.account.clone();
        tracing::info!(jid, account = %account, "launching a job");

        let started_at = Timestamp::now();
        job.started_at = Some(started_at);
        job.queue_delay = started_at.as_nanos() - job.created_at.as_nanos();

        let container_id = match self
            .docker
            .create(&job.container_name(), &self.image, &job.job.command)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(jid, error = %e, "unable to create the job's container");
                job.transition(Status::Error);
                self.persist(&job, "status").await;
                return;
            }
        };

        // The container id must be on record before the kill flag is
        // checked: a kill that lands after this write can reach the
        // container itself.
        job.container_id = Some(container_id.clone());
        if !self.persist(&job, "container id and start timestamp").await {
            return;
        }

        let killed_before_start = match self.storage.job_kill_requested(jid).await {
            Ok(flag) => flag,
            Err(e) => {
                tracing::warn!(jid, error = %e, "unable to read kill flag; proceeding");
                false
            }
        };

        if killed_before_start {
            job.kill_requested = true;
            job.transition(Status::Killed);
        } else {
            job = self.run_container(job, &container_id, started_at).await;
        }

        if let Err(e) = self.docker.remove(&container_id).await {
            tracing::error!(jid, container_id = %container_id, error = %e, "unable to remove the container");
        }

        if let Err(e) = self.storage.update_account_usage(&account, job.runtime).await {
            tracing::error!(jid, account = %account, error = %e, "unable to update account usage");
        }

        self.persist(&job, "status and final result").await;

        tracing::info!(
            jid,
            account = %account,
            status = %job.status,
            runtime = job.runtime,
            overhead = job.overhead_delay,
            queue = job.queue_delay,
            "job complete"
        );
    }

    /// Start the container, drain its output, wait for exit, and extract the
    /// result. Returns the job carrying its decided (still unpersisted)
    /// final status.
    async fn run_container(
        &self,
        job: SubmittedJob,
        container_id: &str,
        started_at: Timestamp,
    ) -> SubmittedJob {
        let jid = job.jid;
        let stdin = job.job.stdin.clone();
        let result_source = job.job.result_source.clone();
        let shared = Arc::new(Mutex::new(job));

        let pump = match self.docker.attach(container_id, stdin).await {
            Ok(output) => Some(tokio::spawn(pump_output(
                output,
                shared.clone(),
                self.storage.clone(),
                jid,
            ))),
            Err(e) => {
                tracing::error!(jid, error = %e, "unable to attach to the container");
                None
            }
        };

        if let Err(e) = self.docker.start(container_id).await {
            tracing::error!(jid, error = %e, "unable to start the container");
            return finish_with_status(shared, pump, Status::Error).await;
        }

        // Everything between claim and a running container counts as
        // launch overhead; runtime starts here.
        let overhead_mark = Timestamp::now();
        {
            let mut job = shared.lock().await;
            job.overhead_delay = overhead_mark.as_nanos() - started_at.as_nanos();
            if let Err(e) = self.storage.update_job(&job).await {
                tracing::error!(jid, error = %e, "unable to persist overhead delay");
            }
        }

        let exit_code = match self.docker.wait(container_id).await {
            Ok(code) => code,
            Err(e) => {
                tracing::error!(jid, error = %e, "unable to wait for the container");
                return finish_with_status(shared, pump, Status::Error).await;
            }
        };

        // The attach stream closes when the container exits; wait for the
        // collector to finish appending before reading the streams.
        if let Some(handle) = pump {
            let _ = handle.await;
        }
        let mut job = reclaim(shared).await;

        let finished_at = Timestamp::now();
        job.finished_at = Some(finished_at);
        job.runtime = finished_at.as_nanos() - overhead_mark.as_nanos();
        job.return_code = exit_code.to_string();

        let mut decided = if exit_code == 0 {
            Status::Done
        } else {
            // A non-zero exit is an error unless the user asked for it.
            match self.storage.job_kill_requested(jid).await {
                Ok(true) => Status::Killed,
                Ok(false) => Status::Error,
                Err(e) => {
                    tracing::error!(jid, error = %e, "unable to check the job kill status");
                    Status::Error
                }
            }
        };

        match &result_source {
            ResultSource::Stdout => {
                job.result = job.stdout.clone().into_bytes();
                tracing::debug!(jid, "acquired job result from stdout");
            }
            ResultSource::File(path) => {
                match self.docker.copy_out(container_id, path).await {
                    Ok(archive) => match unwrap_archive(&archive) {
                        Ok(contents) => {
                            tracing::debug!(jid, path = %path, "acquired job result from file");
                            job.result = contents;
                        }
                        Err(e) => {
                            tracing::error!(jid, path = %path, error = %e, "unable to read tar-encoded result");
                            decided = Status::Error;
                        }
                    },
                    Err(e) => {
                        tracing::error!(jid, path = %path, error = %e, "unable to copy the result from the container");
                        decided = Status::Error;
                    }
                }
            }
        }

        if !job.transition(decided) {
            tracing::warn!(jid, from = %job.status, to = %decided, "refused an invalid status transition");
        }
        job
    }

    async fn persist(&self, job: &SubmittedJob, what: &str) -> bool {
        if let Err(e) = self.storage.update_job(job).await {
            tracing::error!(jid = job.jid, error = %e, "unable to update the job's {}", what);
            return false;
        }
        true
    }
}

/// Append container output to the job's stream fields, persisting after
/// every write so polling clients observe streaming output. A persistence
/// failure stops the collector; the accumulated buffer is re-persisted with
/// the final update.
async fn pump_output(
    mut output: OutputStream,
    job: Arc<Mutex<SubmittedJob>>,
    storage: Arc<dyn Storage>,
    jid: u64,
) {
    while let Some(chunk) = output.next().await {
        match chunk {
            Ok(chunk) => {
                let text = String::from_utf8_lossy(&chunk.bytes);
                tracing::debug!(
                    jid,
                    stream = chunk.kind.as_str(),
                    length = chunk.bytes.len(),
                    "received output from a job"
                );

                let mut job = job.lock().await;
                match chunk.kind {
                    StreamKind::Stdout => job.stdout.push_str(&text),
                    StreamKind::Stderr => job.stderr.push_str(&text),
                }
                if let Err(e) = storage.update_job(&job).await {
                    tracing::error!(jid, error = %e, "unable to persist streamed output");
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(jid, error = %e, "attach stream ended");
                return;
            }
        }
    }
}

/// Stop the collector, take back sole ownership of the job, and apply a
/// terminal status.
async fn finish_with_status(
    shared: Arc<Mutex<SubmittedJob>>,
    pump: Option<JoinHandle<()>>,
    status: Status,
) -> SubmittedJob {
    if let Some(handle) = pump {
        handle.abort();
        let _ = handle.await;
    }
    let mut job = reclaim(shared).await;
    if !job.transition(status) {
        tracing::warn!(jid = job.jid, from = %job.status, to = %status, "refused an invalid status transition");
    }
    job
}

async fn reclaim(shared: Arc<Mutex<SubmittedJob>>) -> SubmittedJob {
    match Arc::try_unwrap(shared) {
        Ok(mutex) => mutex.into_inner(),
        Err(shared) => shared.lock().await.clone(),
    }
}

/// Unwrap file contents from the tar framing the container backend returns.
fn unwrap_archive(archive: &[u8]) -> std::io::Result<Vec<u8>> {
    use std::io::Read;

    let mut reader = tar::Archive::new(archive);
    let mut contents = Vec::new();
    for entry in reader.entries()? {
        let mut entry = entry?;
        entry.read_to_end(&mut contents)?;
    }
    Ok(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwrap_archive_extracts_entry_contents() {
        let mut builder = tar::Builder::new(Vec::new());
        let payload = b"the contents";
        let mut header = tar::Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "tmp/out", payload.as_slice())
            .unwrap();
        let archive = builder.into_inner().unwrap();

        assert_eq!(unwrap_archive(&archive).unwrap(), payload);
    }

    #[test]
    fn unwrap_archive_rejects_garbage() {
        // A tar header block is 512 bytes; a short random buffer cannot be
        // a valid archive.
        let garbage = vec![0x42_u8; 100];
        assert!(unwrap_archive(&garbage).is_err());
    }
}
