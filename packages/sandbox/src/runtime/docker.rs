// ABOUTME: Docker runtime client implementation backed by the bollard library
// ABOUTME: Maps Docker daemon responses into the sandbox error taxonomy

use super::{
    AttachedStream, LogStream, RuntimeClient, SandboxId, SandboxSpec, SandboxStatus, TerminalSize,
};
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use bollard::{
    container::{
        AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
        InspectContainerOptions, LogsOptions, RemoveContainerOptions, ResizeContainerTtyOptions,
        StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as BollardError,
    exec::{CreateExecOptions, StartExecOptions},
    image::CreateImageOptions,
    models::HostConfig,
    Docker,
};
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

/// Label stamped on every sandbox this runtime creates
pub const MANAGED_LABEL: &str = "boxcode.managed";

/// Which call produced a daemon error; the same status code means different
/// things depending on the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Start,
    Inspect,
    Resize,
    Attach,
    Exec,
    Copy,
    Logs,
    Stop,
    Remove,
    Wait,
    Ping,
    Pull,
}

pub struct DockerRuntime {
    client: Docker,
    stop_timeout: Duration,
    pull_missing_images: bool,
}

impl DockerRuntime {
    /// Connect using the local defaults (DOCKER_HOST or the unix socket)
    pub fn connect() -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Connect to a daemon listening on a unix socket at `path`
    pub fn connect_unix(path: &str) -> Result<Self> {
        let client = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Create with a specific Docker connection
    pub fn with_client(client: Docker) -> Self {
        Self {
            client,
            stop_timeout: Duration::from_secs(10),
            pull_missing_images: false,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn with_image_pull(mut self, enabled: bool) -> Self {
        self.pull_missing_images = enabled;
        self
    }

    fn to_bollard_config(spec: &SandboxSpec) -> Config<String> {
        let mut labels = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        Config {
            image: Some(spec.image_ref.clone()),
            cmd: Some(spec.argv.clone()),
            attach_stdin: Some(spec.attach_io),
            attach_stdout: Some(spec.attach_io),
            attach_stderr: Some(spec.attach_io),
            open_stdin: Some(spec.attach_io),
            tty: Some(spec.attach_io),
            network_disabled: Some(!spec.network_enabled),
            labels: Some(labels),
            host_config: Some(HostConfig {
                auto_remove: Some(spec.auto_remove),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn image_exists(&self, image_ref: &str) -> Result<bool> {
        match self.client.inspect_image(image_ref).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_error(Op::Pull, image_ref, e)),
        }
    }

    async fn pull_image(&self, image_ref: &str) -> Result<()> {
        info!("Pulling image: {}", image_ref);

        let options = CreateImageOptions {
            from_image: image_ref.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            let progress = progress.map_err(|e| map_error(Op::Pull, image_ref, e))?;
            if let Some(error) = progress.error {
                return Err(SandboxError::InvalidSpec(format!(
                    "Failed to pull image {}: {}",
                    image_ref, error
                )));
            }
            if let Some(status) = progress.status {
                debug!("Pull status: {}", status);
            }
        }

        info!("Successfully pulled image: {}", image_ref);
        Ok(())
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| map_error(Op::Ping, "daemon", e))
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId> {
        info!(
            "Creating container from {} (name: {:?}, network: {})",
            spec.image_ref, spec.name, spec.network_enabled
        );

        if self.pull_missing_images && !self.image_exists(&spec.image_ref).await? {
            self.pull_image(&spec.image_ref).await?;
        }

        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });
        let subject = spec.name.as_deref().unwrap_or(&spec.image_ref);

        let response = self
            .client
            .create_container(options, Self::to_bollard_config(spec))
            .await
            .map_err(|e| map_error(Op::Create, subject, e))?;

        for warning in &response.warnings {
            warn!("Docker warning for container {}: {}", response.id, warning);
        }
        debug!("Created container: {}", response.id);

        Ok(SandboxId::new(response.id))
    }

    async fn start(&self, id: &SandboxId) -> Result<()> {
        info!("Starting container: {}", id);

        match self
            .client
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already running", id);
                Ok(())
            }
            Err(e) => Err(map_error(Op::Start, id.as_str(), e)),
        }
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxStatus> {
        let details = self
            .client
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_error(Op::Inspect, id.as_str(), e))?;

        let running = details
            .state
            .and_then(|state| state.running)
            .unwrap_or(false);

        Ok(SandboxStatus { running })
    }

    async fn resize(&self, id: &SandboxId, size: TerminalSize) -> Result<()> {
        debug!("Resizing container {} to {}x{}", id, size.cols, size.rows);

        self.client
            .resize_container_tty(
                id.as_str(),
                ResizeContainerTtyOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .map_err(|e| map_error(Op::Resize, id.as_str(), e))
    }

    async fn attach(&self, id: &SandboxId, replay_output: bool) -> Result<AttachedStream> {
        info!("Attaching to container: {} (replay: {})", id, replay_output);

        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(replay_output),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .client
            .attach_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_error(Op::Attach, id.as_str(), e))?;

        let bytes = output
            .map_ok(|chunk| chunk.into_bytes())
            .map_err(std::io::Error::other);

        Ok(AttachedStream {
            output: Box::pin(StreamReader::new(bytes)),
            input,
        })
    }

    async fn exec(&self, id: &SandboxId, argv: Vec<String>) -> Result<()> {
        info!("Executing command in container {}: {:?}", id, argv);

        let exec_config = CreateExecOptions {
            cmd: Some(argv),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(id.as_str(), exec_config)
            .await
            .map_err(|e| map_error(Op::Exec, id.as_str(), e))?;

        self.client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| map_error(Op::Exec, id.as_str(), e))?;

        Ok(())
    }

    async fn copy_archive(&self, id: &SandboxId, dest_path: &str, archive: Vec<u8>) -> Result<()> {
        info!(
            "Copying {} byte archive to container {}:{}",
            archive.len(),
            id,
            dest_path
        );

        let options = UploadToContainerOptions {
            path: dest_path.to_string(),
            no_overwrite_dir_non_dir: "true".to_string(),
        };

        self.client
            .upload_to_container(id.as_str(), Some(options), archive.into())
            .await
            .map_err(|e| match map_error(Op::Copy, id.as_str(), e) {
                SandboxError::PathConflict(_) => SandboxError::PathConflict(dest_path.to_string()),
                other => other,
            })
    }

    async fn logs(&self, id: &SandboxId, follow: bool) -> Result<LogStream> {
        let options = LogsOptions::<String> {
            follow,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let subject = id.to_string();
        let stream = self
            .client
            .logs(id.as_str(), Some(options))
            .map_ok(|chunk| chunk.into_bytes())
            .map_err(move |e| map_error(Op::Logs, &subject, e));

        Ok(stream.boxed())
    }

    async fn stop(&self, id: &SandboxId) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            id,
            self.stop_timeout.as_secs()
        );

        let options = StopContainerOptions {
            t: self.stop_timeout.as_secs() as i64,
        };

        match self.client.stop_container(id.as_str(), Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already stopped", id);
                Ok(())
            }
            Err(e) => Err(map_error(Op::Stop, id.as_str(), e)),
        }
    }

    async fn remove(&self, id: &SandboxId, force: bool) -> Result<()> {
        info!("Removing container: {} (force: {})", id, force);

        let options = RemoveContainerOptions {
            force,
            v: true, // Remove anonymous volumes
            ..Default::default()
        };

        self.client
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| map_error(Op::Remove, id.as_str(), e))
    }

    async fn wait(&self, id: &SandboxId) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.client.wait_container(id.as_str(), Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error; it is still an exit
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(map_error(Op::Wait, id.as_str(), e)),
            None => Err(SandboxError::Transport(format!(
                "wait stream for {} closed without an exit status",
                id
            ))),
        }
    }
}

/// Translate a bollard error for `subject` (a container id, name or image).
fn map_error(op: Op, subject: &str, err: BollardError) -> SandboxError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match (op, status_code) {
            // Create reports a missing image as 404
            (Op::Create, 404) | (Op::Create, 400) => {
                SandboxError::InvalidSpec(format!("{}: {}", subject, message))
            }
            (Op::Create, 409) => SandboxError::NameConflict(subject.to_string()),
            (Op::Pull, 404) => SandboxError::InvalidSpec(format!("{}: {}", subject, message)),
            (_, 404) => SandboxError::NotFound(subject.to_string()),
            (Op::Copy, 400) | (Op::Copy, 403) | (Op::Copy, 409) => {
                SandboxError::PathConflict(message)
            }
            (Op::Resize, 409) | (Op::Exec, 409) | (Op::Attach, 409) => {
                SandboxError::NotRunning(subject.to_string())
            }
            (Op::Remove, 409) => SandboxError::SandboxRunning(subject.to_string()),
            _ => SandboxError::Runtime(format!(
                "{:?} {} failed with status {}: {}",
                op, subject, status_code, message
            )),
        },
        // The wait stream broke after the daemon accepted the request
        other if op == Op::Wait => SandboxError::Transport(format!("wait {}: {}", subject, other)),
        // Everything that is not a daemon response is a failure to talk to the daemon
        other => SandboxError::RuntimeUnavailable(format!("{:?} {}: {}", op, subject, other)),
    }
}
