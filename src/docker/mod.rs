//! Container daemon driver.
//!
//! Everything that talks to the Docker daemon lives here. The engine only
//! sees [`ContainerDriver`]; the production implementation is
//! [`DockerDriver`].

pub mod demux;
pub mod driver;
pub mod error;
mod raw;
pub mod recipe;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::events::LogStream;

pub use driver::DockerDriver;
pub use error::DockerError;

/// Fixed path the host working directory is mounted at inside every
/// container the engine creates.
pub const CONTAINER_WORKDIR: &str = "/workspace";

/// One demultiplexed piece of container output.
pub type LogChunk = (LogStream, String);

/// Build progress: current `Step N/M` number and the stripped log line.
pub type BuildProgress = (usize, String);

/// Daemon operations the engine depends on.
///
/// Streaming operations deliver their output through the supplied bounded
/// sender and return the terminal value; a dropped receiver quietly ends
/// the stream without failing the operation.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Whether the local image store already has `tag`.
    async fn image_exists(&self, tag: &str) -> Result<bool, DockerError>;

    /// Fetches `name` from its registry, draining the daemon's progress
    /// stream to completion.
    async fn pull_image(&self, name: &str) -> Result<(), DockerError>;

    /// Builds the recipe in its containing directory under `tag`, reporting
    /// each non-blank build line with its current step number.
    async fn build_image(
        &self,
        recipe_path: &Path,
        tag: &str,
        progress: mpsc::Sender<BuildProgress>,
    ) -> Result<(), DockerError>;

    /// Runs `command` in a fresh container and returns its exit status.
    /// The container is removed on every exit path.
    async fn run_transient(
        &self,
        image: &str,
        command: &str,
        workdir: &Path,
        env: &HashMap<String, String>,
        logs: mpsc::Sender<LogChunk>,
    ) -> Result<i64, DockerError>;

    /// Starts a long-lived container whose foreground process sleeps
    /// forever, and returns its id. No logs are streamed.
    async fn start_persistent(&self, image: &str, workdir: &Path) -> Result<String, DockerError>;

    /// Runs `command` inside an already running container and returns the
    /// exec instance's exit status.
    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        env: &HashMap<String, String>,
        logs: mpsc::Sender<LogChunk>,
    ) -> Result<i64, DockerError>;

    /// Best-effort stop (short grace period) and removal. Failures are
    /// logged, never propagated.
    async fn stop_and_remove(&self, container_id: &str);
}
