//! Job endpoints: submission, listing, and kill requests.

use axum::extract::rejection::{FormRejection, JsonRejection};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::{Form, Json};
use axum_extra::extract::{Query, QueryRejection};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::job::{JobSpec, Status, SubmittedJob};
use crate::storage::JobQuery;

use super::{authenticate, AppState};

const LIMIT_DEFAULT: i64 = 1000;
const LIMIT_MAX: i64 = 9999;

#[derive(Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    jids: Vec<u64>,
}

/// Enqueue new jobs under the authenticated account.
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let account = authenticate(&state, &headers).await?;
    let Json(request) = payload.map_err(ApiError::invalid_job_json)?;

    let mut jids = Vec::with_capacity(request.jobs.len());
    for spec in request.jobs {
        let job = spec.validate()?;
        let submitted = SubmittedJob::new(job, account.name.clone());

        let jid = state
            .storage
            .insert_job(submitted)
            .await
            .map_err(ApiError::enqueue_failure)?;

        tracing::info!(jid, account = %account.name, "job submitted");
        jids.push(jid);
    }

    Ok(Json(SubmitResponse { jids }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    jid: Vec<u64>,
    #[serde(default)]
    name: Vec<String>,
    #[serde(default)]
    status: Vec<String>,
    limit: Option<i64>,
    before: Option<u64>,
    after: Option<u64>,
    #[serde(default)]
    sudo: bool,
}

#[derive(Serialize)]
pub struct ListResponse {
    jobs: Vec<SubmittedJob>,
}

/// Report current details for jobs matching the query. Only administrators
/// acting with `sudo` see jobs beyond their own account.
pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ListResponse>, ApiError> {
    let account = authenticate(&state, &headers).await?;
    let Query(params) = params.map_err(ApiError::unable_to_parse_query)?;

    let limit = match params.limit {
        None => LIMIT_DEFAULT,
        Some(limit) if limit < 1 => {
            return Err(ApiError::unable_to_parse_query(format!(
                "invalid negative or zero limit [{}]",
                limit
            )))
        }
        Some(limit) => limit.min(LIMIT_MAX),
    };

    let mut statuses = Vec::with_capacity(params.status.len());
    for raw in &params.status {
        let status: Status = raw
            .parse()
            .map_err(|e: String| ApiError::unable_to_parse_query(e))?;
        statuses.push(status);
    }

    let query = JobQuery {
        account: if account.admin && params.sudo {
            None
        } else {
            Some(account.name.clone())
        },
        jids: params.jid,
        names: params.name,
        statuses,
        limit: limit as usize,
        before: params.before,
        after: params.after,
    };

    let jobs = state
        .storage
        .list_jobs(&query)
        .await
        .map_err(ApiError::list_failure)?;

    tracing::debug!(
        account = %account.name,
        results = jobs.len(),
        "job query succeeded"
    );

    Ok(Json(ListResponse { jobs }))
}

#[derive(Deserialize)]
pub struct KillRequest {
    jid: u64,
    #[serde(default)]
    sudo: bool,
}

#[derive(Serialize)]
pub struct KillResponse {
    status: &'static str,
}

/// Request premature termination of a job.
///
/// Queued jobs are marked killed directly, which removes them from the
/// queue. Jobs with a live container get the container killed; the executor
/// observes the non-zero exit together with the kill flag and records the
/// killed status itself.
pub async fn kill(
    State(state): State<AppState>,
    headers: HeaderMap,
    form: Result<Form<KillRequest>, FormRejection>,
) -> Result<Json<KillResponse>, ApiError> {
    let account = authenticate(&state, &headers).await?;
    let Form(request) = form.map_err(ApiError::invalid_job_form)?;

    let sudo = request.sudo && account.admin;
    let query = JobQuery {
        account: if sudo { None } else { Some(account.name.clone()) },
        jids: vec![request.jid],
        ..JobQuery::default()
    };

    let mut jobs = state
        .storage
        .list_jobs(&query)
        .await
        .map_err(ApiError::list_failure)?;

    let mut job = match jobs.len() {
        0 => return Err(ApiError::job_not_found(request.jid)),
        1 => jobs.remove(0),
        count => return Err(ApiError::duplicate_jid(request.jid, count)),
    };

    job.kill_requested = true;

    // A job that has not been claimed yet can leave the queue right here.
    // Anything already claimed transitions through the executor instead.
    if job.status == Status::Queued {
        job.transition(Status::Killed);
    }

    state
        .storage
        .update_job(&job)
        .await
        .map_err(ApiError::update_failure)?;

    if let Some(container_id) = &job.container_id {
        state
            .docker
            .kill(container_id)
            .await
            .map_err(ApiError::kill_failure)?;

        tracing::info!(
            jid = job.jid,
            account = %account.name,
            container_id = %container_id,
            sudo,
            "running job killed"
        );
    } else {
        tracing::info!(jid = job.jid, account = %account.name, sudo, "job kill requested");
    }

    Ok(Json(KillResponse { status: "ok" }))
}
