use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use conveyor::api::{self, AppState};
use conveyor::auth::connect_to_auth_service;
use conveyor::config::Settings;
use conveyor::docker::DockerDriver;
use conveyor::runner;
use conveyor::storage::{MongoStorage, Storage};
use conveyor::tls::TlsMaterial;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(settings.log_colors)
        .init();

    tracing::info!(
        port = settings.port,
        log_level = %settings.log_level,
        mongo_url = %settings.mongo_url,
        docker_host = %settings.docker_host,
        docker_tls = settings.docker_tls,
        default_image = %settings.default_image,
        poll_ms = settings.poll,
        auth_service = %settings.auth_service,
        "initializing with loaded settings"
    );

    // TLS material secures the auth service client and, when enabled, the
    // Docker connection.
    let tls = if settings.has_tls_material() {
        Some(TlsMaterial::load(&settings).await?)
    } else {
        None
    };

    let mut https = reqwest::Client::builder().use_rustls_tls();
    if let Some(material) = &tls {
        https = https
            .add_root_certificate(reqwest::Certificate::from_pem(&material.ca_pem)?)
            .identity(reqwest::Identity::from_pem(&material.identity_pem())?);
    }
    let https = https.build()?;

    let auth = connect_to_auth_service(&settings.auth_service, https).await?;

    let storage = MongoStorage::connect(&settings).await?;
    storage.bootstrap().await?;

    let docker = DockerDriver::connect(&settings, tls.as_ref())?;

    let state = AppState {
        settings: Arc::new(settings),
        storage: Arc::new(storage),
        docker: Arc::new(docker),
        auth: Arc::from(auth),
    };

    // SIGTERM or SIGINT drains both long-lived tasks: the API listener
    // stops accepting connections and the runner stops claiming jobs.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let shutdown = CancellationToken::new();
    let drain = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            _ = sigint.recv() => tracing::info!("SIGINT received"),
        }
        tracing::info!("draining the API listener and the job runner");
        drain.cancel();
    });

    tracing::info!("launching job runner");
    tokio::spawn(runner::run(state.clone(), shutdown.clone()));

    let addr = state.settings.listen_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "web API listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
