//! A scripted container driver for tests. Each created container consumes
//! the next queued [`ContainerPlan`]; the driver records every interaction
//! for later assertions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::{Mutex, Notify};

use super::{ContainerDriver, DriverError, OutputChunk, OutputStream, StreamKind};

/// Scripted behavior for one mock container.
#[derive(Debug, Clone)]
pub struct ContainerPlan {
    pub exit_code: i64,
    pub stdout: Vec<Vec<u8>>,
    pub stderr: Vec<Vec<u8>>,
    /// Files available to `copy_out`, keyed by absolute path.
    pub files: HashMap<String, Vec<u8>>,
    /// Park `wait` until `kill` is called, then exit 137.
    pub hold_until_killed: bool,
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_wait: bool,
}

impl Default for ContainerPlan {
    fn default() -> Self {
        ContainerPlan {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
            files: HashMap::new(),
            hold_until_killed: false,
            fail_create: false,
            fail_start: false,
            fail_wait: false,
        }
    }
}

impl ContainerPlan {
    pub fn exiting(exit_code: i64) -> Self {
        ContainerPlan {
            exit_code,
            ..ContainerPlan::default()
        }
    }

    pub fn with_stdout(mut self, chunk: &[u8]) -> Self {
        self.stdout.push(chunk.to_vec());
        self
    }

    pub fn with_stderr(mut self, chunk: &[u8]) -> Self {
        self.stderr.push(chunk.to_vec());
        self
    }

    pub fn with_file(mut self, path: &str, contents: &[u8]) -> Self {
        self.files.insert(path.to_string(), contents.to_vec());
        self
    }

    pub fn held(mut self) -> Self {
        self.hold_until_killed = true;
        self
    }
}

struct MockContainer {
    name: String,
    command: String,
    plan: ContainerPlan,
    stdin: Option<Vec<u8>>,
    started: bool,
    killed: bool,
    removed: bool,
    kill_signal: Arc<Notify>,
}

#[derive(Default)]
struct MockInner {
    next_id: u64,
    plans: VecDeque<ContainerPlan>,
    containers: HashMap<String, MockContainer>,
}

/// An in-memory [`ContainerDriver`] with scripted behavior.
#[derive(Default)]
pub struct MockDriver {
    inner: Mutex<MockInner>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver::default()
    }

    /// Queue the plan the next created container will follow. Containers
    /// created beyond the queued plans follow the default plan.
    pub async fn queue_plan(&self, plan: ContainerPlan) {
        self.inner.lock().await.plans.push_back(plan);
    }

    pub async fn container_count(&self) -> usize {
        self.inner.lock().await.containers.len()
    }

    pub async fn container_name(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.containers.get(id).map(|c| c.name.clone())
    }

    pub async fn command_for(&self, id: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.containers.get(id).map(|c| c.command.clone())
    }

    pub async fn stdin_for(&self, id: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        inner.containers.get(id).and_then(|c| c.stdin.clone())
    }

    pub async fn was_started(&self, id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.containers.get(id).map(|c| c.started).unwrap_or(false)
    }

    pub async fn was_killed(&self, id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.containers.get(id).map(|c| c.killed).unwrap_or(false)
    }

    pub async fn was_removed(&self, id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.containers.get(id).map(|c| c.removed).unwrap_or(false)
    }
}

#[async_trait]
impl ContainerDriver for MockDriver {
    async fn create(&self, name: &str, image: &str, command: &str) -> Result<String, DriverError> {
        let _ = image;
        let mut inner = self.inner.lock().await;
        let plan = inner.plans.pop_front().unwrap_or_default();
        if plan.fail_create {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("create refused for {}", name),
            )));
        }

        inner.next_id += 1;
        let id = format!("mock-{}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            MockContainer {
                name: name.to_string(),
                command: command.to_string(),
                plan,
                stdin: None,
                started: false,
                killed: false,
                removed: false,
                kill_signal: Arc::new(Notify::new()),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        if container.plan.fail_start {
            return Err(DriverError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("start refused for {}", id),
            )));
        }
        container.started = true;
        Ok(())
    }

    async fn attach(&self, id: &str, stdin: Vec<u8>) -> Result<OutputStream, DriverError> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        container.stdin = Some(stdin);

        let mut chunks: Vec<Result<OutputChunk, DriverError>> = Vec::new();
        for bytes in &container.plan.stdout {
            chunks.push(Ok(OutputChunk {
                kind: StreamKind::Stdout,
                bytes: bytes.clone(),
            }));
        }
        for bytes in &container.plan.stderr {
            chunks.push(Ok(OutputChunk {
                kind: StreamKind::Stderr,
                bytes: bytes.clone(),
            }));
        }
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn wait(&self, id: &str) -> Result<i64, DriverError> {
        let (plan, killed, signal) = {
            let inner = self.inner.lock().await;
            let container = inner
                .containers
                .get(id)
                .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
            (
                container.plan.clone(),
                container.killed,
                container.kill_signal.clone(),
            )
        };

        if plan.fail_wait {
            return Err(DriverError::NoExitStatus);
        }

        if plan.hold_until_killed {
            if !killed {
                signal.notified().await;
            }
            // killed containers report SIGKILL
            return Ok(137);
        }

        // Give the clock a nudge so measured runtimes are non-zero.
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(plan.exit_code)
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>, DriverError> {
        let contents = {
            let inner = self.inner.lock().await;
            let container = inner
                .containers
                .get(id)
                .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
            container
                .plan
                .files
                .get(path)
                .cloned()
                .ok_or_else(|| DriverError::NotFound(format!("{}:{}", id, path)))?
        };

        // Frame the contents in a single-entry tar archive, as the Docker
        // download API does.
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path.trim_start_matches('/'), contents.as_slice())
            .map_err(DriverError::Io)?;
        builder.into_inner().map_err(DriverError::Io)
    }

    async fn kill(&self, id: &str) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        container.killed = true;
        container.kill_signal.notify_one();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), DriverError> {
        let mut inner = self.inner.lock().await;
        let container = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DriverError::NotFound(id.to_string()))?;
        container.removed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn scripted_lifecycle() {
        let driver = MockDriver::new();
        driver
            .queue_plan(ContainerPlan::exiting(0).with_stdout(b"hello\n"))
            .await;

        let id = driver.create("job_1_test", "image", "echo hello").await.unwrap();
        driver.start(&id).await.unwrap();

        let mut output = driver.attach(&id, b"input".to_vec()).await.unwrap();
        let chunk = output.next().await.unwrap().unwrap();
        assert_eq!(chunk.kind, StreamKind::Stdout);
        assert_eq!(chunk.bytes, b"hello\n");
        assert!(output.next().await.is_none());

        assert_eq!(driver.wait(&id).await.unwrap(), 0);
        assert_eq!(driver.stdin_for(&id).await, Some(b"input".to_vec()));

        driver.remove(&id).await.unwrap();
        assert!(driver.was_removed(&id).await);
    }

    #[tokio::test]
    async fn held_container_exits_when_killed() {
        let driver = Arc::new(MockDriver::new());
        driver.queue_plan(ContainerPlan::default().held()).await;
        let id = driver.create("job_2_held", "image", "sleep 30").await.unwrap();

        let waiter = {
            let driver = driver.clone();
            let id = id.clone();
            tokio::spawn(async move { driver.wait(&id).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        driver.kill(&id).await.unwrap();

        let exit = waiter.await.unwrap().unwrap();
        assert_eq!(exit, 137);
        assert!(driver.was_killed(&id).await);
    }

    #[tokio::test]
    async fn copy_out_frames_contents_in_tar() {
        let driver = MockDriver::new();
        driver
            .queue_plan(ContainerPlan::exiting(0).with_file("/tmp/out", b"world"))
            .await;
        let id = driver.create("job_3_file", "image", "true").await.unwrap();

        let archive = driver.copy_out(&id, "/tmp/out").await.unwrap();
        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents).unwrap();
        assert_eq!(contents, b"world");
    }
}
