//! HTTP API surface. Handlers translate between the wire protocol and the
//! storage/driver seams; they touch jobs only through storage primitives.

pub mod jobs;

use std::sync::Arc;

use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::auth::{basic_credentials, Account, AuthService};
use crate::config::Settings;
use crate::docker::ContainerDriver;
use crate::error::ApiError;
use crate::storage::Storage;

/// Shared state available to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub storage: Arc<dyn Storage>,
    pub docker: Arc<dyn ContainerDriver>,
    pub auth: Arc<dyn AuthService>,
}

/// Build the v1 API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v1/job",
            get(jobs::list)
                .post(jobs::submit)
                .fallback(method_not_supported),
        )
        .route(
            "/v1/job/kill",
            post(jobs::kill).fallback(method_not_supported),
        )
        .route(
            "/v1/auth_service",
            get(auth_service).fallback(method_not_supported),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn method_not_supported() -> ApiError {
    ApiError::method_not_supported()
}

/// Resolve the request's basic auth credentials to an account.
///
/// The configured administrator credentials short-circuit; anyone else is
/// referred to the authentication service.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Account, ApiError> {
    let credentials = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(basic_credentials);

    let (name, key) = match credentials {
        Some(pair) => pair,
        None => return Err(ApiError::credentials_missing()),
    };

    if let Some((admin_name, admin_key)) = state.settings.admin_credentials() {
        if name == admin_name && key == admin_key {
            tracing::debug!(account = %name, "administrator authenticated");
            return Ok(Account {
                name,
                admin: true,
                ..Account::default()
            });
        }
    }

    match state.auth.validate(&name, &key).await {
        Ok(true) => Ok(Account::named(&name)),
        Ok(false) => Err(ApiError::credentials_incorrect(&name)),
        Err(e) => Err(ApiError::auth_service_unreachable(e)),
    }
}

#[derive(Serialize)]
struct AuthServiceDescription {
    address: String,
    style: String,
}

/// Describe the currently configured authentication service.
///
/// Answers without credentials: clients hit this endpoint to discover how
/// to authenticate before they hold any.
async fn auth_service(State(state): State<AppState>) -> Json<AuthServiceDescription> {
    Json(AuthServiceDescription {
        address: state.settings.auth_service.clone(),
        style: state.auth.style().to_string(),
    })
}
