//! Container runtime seam. The executor drives containers exclusively
//! through [`ContainerDriver`]; the Docker engine implementation lives in
//! [`engine`] and a scripted stand-in for tests in [`mock`].

pub mod engine;
pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

pub use engine::DockerDriver;
pub use mock::{ContainerPlan, MockDriver};

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("docker api error: {0}")]
    Api(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container wait ended without an exit status")]
    NoExitStatus,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which output stream of the container a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// A fragment of container output, tagged with its stream of origin.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub kind: StreamKind,
    pub bytes: Vec<u8>,
}

/// The demultiplexed output of an attached container. Ends when the
/// container exits or the attachment is torn down.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk, DriverError>> + Send>>;

/// The narrow set of container interactions the executor relies on.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Create a container that will run `command` under `/bin/bash -c` with
    /// stdin open. Returns the container id.
    async fn create(&self, name: &str, image: &str, command: &str) -> Result<String, DriverError>;

    async fn start(&self, id: &str) -> Result<(), DriverError>;

    /// Attach to the container's streams. The `stdin` bytes are written to
    /// the container's standard input, which is then closed.
    async fn attach(&self, id: &str, stdin: Vec<u8>) -> Result<OutputStream, DriverError>;

    /// Block until the container exits; returns its exit code.
    async fn wait(&self, id: &str) -> Result<i64, DriverError>;

    /// Fetch a file out of the container. The contents come back framed in a
    /// single-entry tar archive, per the Docker API contract.
    async fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>, DriverError>;

    async fn kill(&self, id: &str) -> Result<(), DriverError>;

    async fn remove(&self, id: &str) -> Result<(), DriverError>;
}
