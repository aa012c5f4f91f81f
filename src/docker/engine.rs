//! Docker Engine implementation of the container driver.

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    DownloadFromContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;

use crate::config::Settings;
use crate::tls::TlsMaterial;

use super::{ContainerDriver, DriverError, OutputChunk, OutputStream, StreamKind};

const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerDriver {
    client: Docker,
}

impl DockerDriver {
    /// Connect to the Docker daemon named by the settings, with TLS when
    /// configured.
    pub fn connect(
        settings: &Settings,
        tls: Option<&TlsMaterial>,
    ) -> Result<Self, DriverError> {
        let host = settings.docker_host.as_str();

        let client = if settings.docker_tls {
            match tls {
                Some(material) => Docker::connect_with_ssl(
                    host,
                    &material.key_path,
                    &material.cert_path,
                    &material.ca_cert_path,
                    CONNECT_TIMEOUT_SECS,
                    API_DEFAULT_VERSION,
                )?,
                None => {
                    return Err(DriverError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "docker TLS enabled but no TLS material configured",
                    )))
                }
            }
        } else if let Some(path) = host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        };

        Ok(DockerDriver { client })
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn create(&self, name: &str, image: &str, command: &str) -> Result<String, DriverError> {
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "/bin/bash".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let response = self
            .client
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await?;
        Ok(response.id)
    }

    async fn start(&self, id: &str) -> Result<(), DriverError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn attach(&self, id: &str, stdin: Vec<u8>) -> Result<OutputStream, DriverError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, mut input } =
            self.client.attach_container(id, Some(options)).await?;

        // Feed the job's stdin and close the stream so the contained process
        // observes EOF.
        let container = id.to_string();
        tokio::spawn(async move {
            if !stdin.is_empty() {
                if let Err(e) = input.write_all(&stdin).await {
                    tracing::debug!(container = %container, error = %e, "stdin write interrupted");
                }
            }
            let _ = input.shutdown().await;
        });

        let chunks = output.filter_map(|frame| async move {
            match frame {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk {
                        kind: StreamKind::Stdout,
                        bytes: message.to_vec(),
                    }))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk {
                    kind: StreamKind::Stderr,
                    bytes: message.to_vec(),
                })),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(DriverError::Api(e))),
            }
        });

        Ok(Box::pin(chunks))
    }

    async fn wait(&self, id: &str) -> Result<i64, DriverError> {
        let mut responses = self
            .client
            .wait_container(id, None::<WaitContainerOptions<String>>);

        match responses.next().await {
            Some(Ok(status)) => Ok(status.status_code),
            // Non-zero exits surface as a typed error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(DriverError::Api(e)),
            None => Err(DriverError::NoExitStatus),
        }
    }

    async fn copy_out(&self, id: &str, path: &str) -> Result<Vec<u8>, DriverError> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let archive = self
            .client
            .download_from_container(id, Some(options))
            .try_fold(Vec::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;
        Ok(archive)
    }

    async fn kill(&self, id: &str) -> Result<(), DriverError> {
        self.client.kill_container::<String>(id, None).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), DriverError> {
        self.client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}
