//! End-to-end execution tests: claimed jobs driven through the executor
//! against the scripted container driver.


use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use conveyor::api;
use conveyor::docker::ContainerPlan;
use conveyor::job::{Job, JobSpec, Status, SubmittedJob};
use conveyor::runner::{self, Executor};
use conveyor::storage::Storage;
use harness::{basic_auth, job, TestApp};

const DEADLINE: Duration = Duration::from_secs(5);

fn file_job(cmd: &str, path: &str) -> Job {
    job(cmd, &format!("file:{}", path))
}

async fn submit(test: &TestApp, job: Job) -> u64 {
    test.storage
        .insert_job(SubmittedJob::new(job, "someone".to_string()))
        .await
        .expect("insert should succeed")
}

/// Claim the queued job and run it on an executor task.
async fn claim_and_execute(test: &TestApp) {
    let claimed = test
        .storage
        .claim_job()
        .await
        .expect("claim should succeed")
        .expect("a job should be queued");
    tokio::spawn(Executor::from_state(&test.state).execute(claimed));
}

#[tokio::test]
async fn stdout_result_happy_path() {
    let test = TestApp::new();
    test.docker
        .queue_plan(ContainerPlan::exiting(0).with_stdout(b"hello\n"))
        .await;

    let jid = submit(&test, job("echo hello", "stdout")).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    assert_eq!(done.status, Status::Done);
    assert_eq!(done.stdout, "hello\n");
    assert_eq!(done.result, b"hello\n");
    assert_eq!(done.return_code, "0");
    assert!(done.queue_delay > 0);
    assert!(done.overhead_delay > 0);
    assert!(done.runtime > 0);

    // Timing fields partition the job's wall-clock span.
    let span = done.finished_at.unwrap().as_nanos() - done.created_at.as_nanos();
    assert!(done.queue_delay + done.overhead_delay + done.runtime <= span);

    // The container ran the job's command and is gone now.
    let container_id = done.container_id.expect("container id should be recorded");
    assert_eq!(
        test.docker.command_for(&container_id).await.as_deref(),
        Some("echo hello")
    );
    assert!(test.docker.was_removed(&container_id).await);
    assert_eq!(
        test.docker.container_name(&container_id).await.as_deref(),
        Some(format!("job_{}_unnamed", jid).as_str())
    );
}

#[tokio::test]
async fn file_result_is_unwrapped_from_its_archive() {
    let test = TestApp::new();
    test.docker
        .queue_plan(ContainerPlan::exiting(0).with_file("/tmp/out", b"world"))
        .await;

    let jid = submit(&test, file_job("echo -n world > /tmp/out", "/tmp/out")).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    assert_eq!(done.status, Status::Done);
    assert_eq!(done.result, b"world");
}

#[tokio::test]
async fn missing_result_file_demotes_to_error() {
    let test = TestApp::new();
    test.docker.queue_plan(ContainerPlan::exiting(0)).await;

    let jid = submit(&test, file_job("true", "/tmp/never-written")).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    // The container exited cleanly, but the result could not be read.
    assert_eq!(done.status, Status::Error);
    assert_eq!(done.return_code, "0");
}

#[tokio::test]
async fn nonzero_exit_without_a_kill_is_an_error() {
    let test = TestApp::new();
    test.docker.queue_plan(ContainerPlan::exiting(7)).await;

    let jid = submit(&test, job("exit 7", "stdout")).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    assert_eq!(done.status, Status::Error);
    assert_eq!(done.return_code, "7");
}

#[tokio::test]
async fn stderr_is_captured_separately() {
    let test = TestApp::new();
    test.docker
        .queue_plan(
            ContainerPlan::exiting(1)
                .with_stdout(b"out")
                .with_stderr(b"went wrong\n"),
        )
        .await;

    let jid = submit(&test, job("boom", "stdout")).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    assert_eq!(done.stdout, "out");
    assert_eq!(done.stderr, "went wrong\n");
}

#[tokio::test]
async fn stdin_reaches_the_container() {
    let test = TestApp::new();
    test.docker.queue_plan(ContainerPlan::exiting(0)).await;

    let mut piped = job("cat", "stdout");
    piped.stdin = b"piped bytes".to_vec();
    let jid = submit(&test, piped).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    let container_id = done.container_id.unwrap();
    assert_eq!(
        test.docker.stdin_for(&container_id).await,
        Some(b"piped bytes".to_vec())
    );
}

#[tokio::test]
async fn create_failure_terminates_the_job() {
    let test = TestApp::new();
    let mut plan = ContainerPlan::default();
    plan.fail_create = true;
    test.docker.queue_plan(plan).await;

    let jid = submit(&test, job("id", "stdout")).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    assert_eq!(done.status, Status::Error);
    assert!(done.container_id.is_none());
}

#[tokio::test]
async fn start_failure_terminates_the_job_and_removes_the_container() {
    let test = TestApp::new();
    let mut plan = ContainerPlan::default();
    plan.fail_start = true;
    test.docker.queue_plan(plan).await;

    let jid = submit(&test, job("id", "stdout")).await;
    claim_and_execute(&test).await;

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    assert_eq!(done.status, Status::Error);
    let container_id = done.container_id.unwrap();
    assert!(test.docker.was_removed(&container_id).await);
}

#[tokio::test]
async fn kill_between_claim_and_start_skips_execution() {
    let test = TestApp::new();
    test.docker.queue_plan(ContainerPlan::exiting(0)).await;

    let jid = submit(&test, job("id", "stdout")).await;
    let claimed = test.storage.claim_job().await.unwrap().unwrap();

    // The kill lands after the claim but before the executor runs.
    let mut stored = test.stored_job(jid).await;
    stored.kill_requested = true;
    test.storage.update_job(&stored).await.unwrap();

    Executor::from_state(&test.state).execute(claimed).await;

    let done = test.stored_job(jid).await;
    assert_eq!(done.status, Status::Killed);

    let container_id = done.container_id.unwrap();
    assert!(!test.docker.was_started(&container_id).await);
    assert!(test.docker.was_removed(&container_id).await);
}

#[tokio::test]
async fn kill_during_execution_resolves_to_killed() {
    let test = TestApp::new();
    test.docker
        .queue_plan(ContainerPlan::default().held().with_stdout(b"tick"))
        .await;

    let jid = submit(&test, job("sleep 30", "stdout")).await;
    claim_and_execute(&test).await;

    // Streaming output lands in storage while the container is running.
    let running = test
        .wait_for_job(jid, DEADLINE, |j| {
            j.container_id.is_some() && j.stdout == "tick"
        })
        .await;
    assert_eq!(running.status, Status::Processing);

    // Kill through the API, as a client would.
    let app = api::router(test.state.clone());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/job/kill")
        .header("authorization", basic_auth("admin", "12345"))
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(format!("jid={}&sudo=true", jid)))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    assert_eq!(done.status, Status::Killed);
    assert_eq!(done.return_code, "137");

    let container_id = done.container_id.unwrap();
    assert!(test.docker.was_killed(&container_id).await);
    assert!(test.docker.was_removed(&container_id).await);
}

#[tokio::test]
async fn completed_jobs_update_account_usage() {
    let test = TestApp::new();
    test.docker.queue_plan(ContainerPlan::exiting(0)).await;

    let jid = submit(&test, job("id", "stdout")).await;
    claim_and_execute(&test).await;
    test.wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;

    let account = test
        .storage
        .get_account("someone")
        .await
        .unwrap()
        .expect("account should exist after completion");
    assert_eq!(account.total_jobs, 1);
    assert!(account.total_runtime > 0);
}

#[tokio::test]
async fn runner_loop_claims_and_completes_queued_jobs() {
    let test = TestApp::new();
    test.docker
        .queue_plan(ContainerPlan::exiting(0).with_stdout(b"looped\n"))
        .await;

    let shutdown = CancellationToken::new();
    let loop_handle = tokio::spawn(runner::run(test.state.clone(), shutdown.clone()));

    let jid = submit(&test, job("echo looped", "stdout")).await;
    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;
    assert_eq!(done.status, Status::Done);
    assert_eq!(done.stdout, "looped\n");

    shutdown.cancel();
    loop_handle.await.expect("runner should stop cleanly");
}

#[tokio::test]
async fn runner_terminates_invalid_jobs_defensively() {
    let test = TestApp::new();

    // A job with an empty command can only reach the queue by bypassing
    // submission validation.
    let mut bad = JobSpec {
        cmd: "placeholder".to_string(),
        result_source: "stdout".to_string(),
        result_type: "binary".to_string(),
        ..JobSpec::default()
    }
    .validate()
    .unwrap();
    bad.command = String::new();

    let jid = test
        .storage
        .insert_job(SubmittedJob::new(bad, "someone".to_string()))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let loop_handle = tokio::spawn(runner::run(test.state.clone(), shutdown.clone()));

    let done = test
        .wait_for_job(jid, DEADLINE, |j| j.status.is_terminal())
        .await;
    assert_eq!(done.status, Status::Error);

    // No container was ever created for it.
    assert_eq!(test.docker.container_count().await, 0);

    shutdown.cancel();
    loop_handle.await.expect("runner should stop cleanly");
}
