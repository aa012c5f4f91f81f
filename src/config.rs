use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Runtime settings, loaded from `CONVEYOR_*` environment variables or the
/// equivalent command-line flags.
#[derive(Parser, Debug, Clone)]
#[command(name = "conveyor")]
#[command(about = "Container job queue: HTTP API, durable queue, Docker execution")]
pub struct Settings {
    /// Port for the HTTP API
    #[arg(long, env = "CONVEYOR_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "CONVEYOR_LOGLEVEL", default_value = "info")]
    pub log_level: String,

    /// Force ANSI colors in log output
    #[arg(long, env = "CONVEYOR_LOGCOLORS", default_value_t = false)]
    pub log_colors: bool,

    /// MongoDB connection string or host
    #[arg(long, env = "CONVEYOR_MONGOURL", default_value = "mongo")]
    pub mongo_url: String,

    /// Administrator account name
    #[arg(long, env = "CONVEYOR_ADMINNAME")]
    pub admin_name: Option<String>,

    /// Administrator API key
    #[arg(long, env = "CONVEYOR_ADMINKEY")]
    pub admin_key: Option<String>,

    /// Docker daemon endpoint
    #[arg(long, env = "CONVEYOR_DOCKERHOST", default_value = "unix:///var/run/docker.sock")]
    pub docker_host: String,

    /// Connect to Docker with TLS
    #[arg(long, env = "CONVEYOR_DOCKERTLS", default_value_t = false)]
    pub docker_tls: bool,

    /// CA certificate path (PEM)
    #[arg(long, env = "CONVEYOR_CACERT")]
    pub ca_cert: Option<PathBuf>,

    /// Client certificate path (PEM)
    #[arg(long, env = "CONVEYOR_CERT")]
    pub cert: Option<PathBuf>,

    /// Client private key path (PEM)
    #[arg(long, env = "CONVEYOR_KEY")]
    pub key: Option<PathBuf>,

    /// Image used to execute jobs
    #[arg(long, env = "CONVEYOR_DEFAULTIMAGE", default_value = "cloudpipe/runner-py2")]
    pub default_image: String,

    /// Queue polling interval in milliseconds
    #[arg(long, env = "CONVEYOR_POLL", default_value_t = 500)]
    pub poll: u64,

    /// Base URL of the authentication service; empty disables remote auth
    #[arg(long, env = "CONVEYOR_AUTHSERVICE", default_value = "https://authstore:9001/v1")]
    pub auth_service: String,
}

impl Settings {
    /// Address to bind the HTTP server to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll)
    }

    /// Connection string for the MongoDB driver. Bare hostnames are accepted
    /// for compatibility and normalized to a `mongodb://` URI.
    pub fn mongo_uri(&self) -> String {
        if self.mongo_url.contains("://") {
            self.mongo_url.clone()
        } else {
            format!("mongodb://{}", self.mongo_url)
        }
    }

    /// The configured administrator credentials, when both are present.
    pub fn admin_credentials(&self) -> Option<(&str, &str)> {
        match (self.admin_name.as_deref(), self.admin_key.as_deref()) {
            (Some(name), Some(key)) if !name.is_empty() && !key.is_empty() => Some((name, key)),
            _ => None,
        }
    }

    /// Whether a full set of TLS material paths is configured.
    pub fn has_tls_material(&self) -> bool {
        self.ca_cert.is_some() && self.cert.is_some() && self.key.is_some()
    }
}
