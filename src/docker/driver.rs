//! Production [`ContainerDriver`] backed by bollard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, RemoveContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::CreateExecOptions;
use bollard::image::{BuildImageOptions, CreateImageOptions};
use futures_util::stream::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::error::DockerError;
use super::{BuildProgress, CONTAINER_WORKDIR, ContainerDriver, LogChunk, raw};

/// Marker the daemon prefixes classic-builder output lines with.
static BUILD_STEP_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*Step (\d+)/\d+").expect("valid build marker pattern"));

/// Grace period, in seconds, given to a container before removal.
const STOP_TIMEOUT_SECS: i64 = 1;

/// Keep-alive command for persistent containers.
const KEEPALIVE_CMD: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Driver speaking to the local Docker daemon.
pub struct DockerDriver {
    client: Docker,
    socket_path: PathBuf,
}

impl DockerDriver {
    /// Connects to the local daemon and verifies it answers.
    pub async fn connect() -> Result<Self, DockerError> {
        let client = Docker::connect_with_local_defaults()?;
        client
            .ping()
            .await
            .map_err(|e| DockerError::Api(format!("cannot reach the Docker daemon: {e}")))?;
        Ok(Self {
            client,
            socket_path: raw::default_socket_path(),
        })
    }

    async fn start_and_stream(
        &self,
        container_id: &str,
        logs: &mpsc::Sender<LogChunk>,
    ) -> Result<i64, DockerError> {
        self.client
            .start_container::<String>(container_id, None)
            .await?;
        raw::stream_demuxed(&self.socket_path, raw::logs_request(container_id), logs).await?;

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.client.wait_container(container_id, Some(options));
        let exit_code = match wait.next().await {
            Some(Ok(response)) => response.status_code,
            // bollard reports a non-zero exit as a wait error; the code is
            // still the container's exit status.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => return Err(e.into()),
            None => 1,
        };
        Ok(exit_code)
    }

    async fn remove_forced(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            warn!(container = %container_id, error = %e, "failed to remove container");
        }
    }
}

fn container_config(
    image: &str,
    cmd: Vec<String>,
    workdir: &Path,
    env: &HashMap<String, String>,
) -> Config<String> {
    Config {
        image: Some(image.to_string()),
        cmd: Some(cmd),
        env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        working_dir: Some(CONTAINER_WORKDIR.to_string()),
        tty: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(bollard::models::HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                workdir.display(),
                CONTAINER_WORKDIR
            )]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn shell_command(command: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]
}

/// Tars up the recipe's containing directory as the build context.
fn build_context_tar(context_dir: &Path) -> Result<Vec<u8>, DockerError> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", context_dir)?;
    Ok(builder.into_inner()?)
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn image_exists(&self, tag: &str) -> Result<bool, DockerError> {
        match self.client.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, name: &str) -> Result<(), DockerError> {
        debug!(image = %name, "pulling image");
        let options = CreateImageOptions {
            from_image: name,
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress?;
        }
        Ok(())
    }

    async fn build_image(
        &self,
        recipe_path: &Path,
        tag: &str,
        progress: mpsc::Sender<BuildProgress>,
    ) -> Result<(), DockerError> {
        debug!(recipe = %recipe_path.display(), tag = %tag, "building image");
        let context_dir = match recipe_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let dockerfile = recipe_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("Dockerfile")
            .to_string();
        let context = build_context_tar(context_dir)?;

        let options = BuildImageOptions {
            dockerfile: dockerfile.as_str(),
            t: tag,
            rm: true,
            ..Default::default()
        };
        let mut stream = self.client.build_image(options, None, Some(context.into()));

        let mut current_step = 0usize;
        while let Some(chunk) = stream.next().await {
            let info = chunk.map_err(|e| DockerError::BuildFailed(e.to_string()))?;
            if let Some(error) = info.error {
                return Err(DockerError::BuildFailed(error));
            }
            let Some(text) = info.stream else {
                continue;
            };
            for line in text.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(step) = BUILD_STEP_MARKER
                    .captures(line)
                    .and_then(|captures| captures.get(1))
                    .and_then(|number| number.as_str().parse().ok())
                {
                    current_step = step;
                }
                if progress.send((current_step, line.to_string())).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn run_transient(
        &self,
        image: &str,
        command: &str,
        workdir: &Path,
        env: &HashMap<String, String>,
        logs: mpsc::Sender<LogChunk>,
    ) -> Result<i64, DockerError> {
        let config = container_config(image, shell_command(command), workdir, env);
        let container = self
            .client
            .create_container::<String, String>(None, config)
            .await?;
        debug!(container = %container.id, image = %image, "running transient container");

        let result = self.start_and_stream(&container.id, &logs).await;
        self.remove_forced(&container.id).await;
        result
    }

    async fn start_persistent(&self, image: &str, workdir: &Path) -> Result<String, DockerError> {
        let cmd = KEEPALIVE_CMD.iter().map(|s| s.to_string()).collect();
        let config = container_config(image, cmd, workdir, &HashMap::new());
        let container = self
            .client
            .create_container::<String, String>(None, config)
            .await?;
        if let Err(e) = self
            .client
            .start_container::<String>(&container.id, None)
            .await
        {
            self.remove_forced(&container.id).await;
            return Err(e.into());
        }
        debug!(container = %container.id, image = %image, "started persistent container");
        Ok(container.id)
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        env: &HashMap<String, String>,
        logs: mpsc::Sender<LogChunk>,
    ) -> Result<i64, DockerError> {
        let options = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(shell_command(command)),
            env: Some(env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            working_dir: Some(CONTAINER_WORKDIR.to_string()),
            ..Default::default()
        };
        let exec = self.client.create_exec(container_id, options).await?;
        raw::stream_demuxed(&self.socket_path, raw::exec_start_request(&exec.id), &logs).await?;

        let inspect = self.client.inspect_exec(&exec.id).await?;
        inspect.exit_code.ok_or_else(|| {
            DockerError::Api(format!(
                "no exit code for exec in container {container_id}"
            ))
        })
    }

    async fn stop_and_remove(&self, container_id: &str) {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        if let Err(e) = self.client.stop_container(container_id, Some(options)).await {
            warn!(container = %container_id, error = %e, "failed to stop container");
        }
        if let Err(e) = self.client.remove_container(container_id, None).await {
            warn!(container = %container_id, error = %e, "failed to remove container");
        }
    }
}
