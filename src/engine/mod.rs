//! Pipeline orchestrator.
//!
//! [`PipelineRunner::run`] validates the configuration, consults the filter
//! gate, and spawns a producer task that drives image preparation and the
//! step loop. Events travel over a rendezvous channel, so the producer
//! advances one event at a time, exactly as fast as the consumer reads.

pub mod filter;
mod prepare;
mod step;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, warn};

use crate::config::{ConfigError, Configuration, ImageSource};
use crate::docker::{ContainerDriver, DockerDriver, DockerError};
use crate::events::{EventStatus, PipelineEvent};
use crate::git::{GitProbe, ScmError, ScmProbe};

pub use filter::{GateDecision, HookType};

/// Capacity of the internal driver-to-engine log channels.
const LOG_CHANNEL_CAPACITY: usize = 32;

/// Fatal, pre-stream failures. Once the event stream exists, everything is
/// reported through it instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("source control error: {0}")]
    Scm(#[from] ScmError),
    #[error(transparent)]
    Docker(#[from] DockerError),
}

/// The consumer dropped the event stream; the run winds down silently.
pub(crate) struct RunAborted;

/// Single sender of the run's event stream.
pub(crate) struct EventSink {
    tx: flume::Sender<PipelineEvent>,
}

impl EventSink {
    pub(crate) async fn emit(&self, event: PipelineEvent) -> Result<(), RunAborted> {
        self.tx.send_async(event).await.map_err(|_| RunAborted)
    }
}

/// The pipeline execution engine.
pub struct PipelineRunner {
    driver: Arc<dyn ContainerDriver>,
    scm: Arc<dyn ScmProbe>,
    workdir: PathBuf,
}

impl PipelineRunner {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        scm: Arc<dyn ScmProbe>,
        workdir: PathBuf,
    ) -> Self {
        Self {
            driver,
            scm,
            workdir,
        }
    }

    /// Wires the runner to the local Docker daemon and git checkout rooted
    /// at (or above) `workdir`.
    pub async fn connect(workdir: &Path) -> Result<Self, EngineError> {
        let scm = GitProbe::discover(workdir)?;
        let workdir = scm.repo_root().to_path_buf();
        let driver = DockerDriver::connect().await?;
        Ok(Self::new(Arc::new(driver), Arc::new(scm), workdir))
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Starts a pipeline run and returns its event stream.
    ///
    /// A receiver that ends without a `PipelineStart` means the filter gate
    /// skipped the run. Configuration and source-control failures surface
    /// as `Err` before any event is produced.
    pub fn run(
        &self,
        config: Configuration,
        hook: Option<HookType>,
        debug: bool,
    ) -> Result<flume::Receiver<PipelineEvent>, EngineError> {
        config.validate()?;
        let source = config.docker.source()?;

        let debug = if debug && hook.is_some() {
            warn!("debug mode is unavailable for hook-triggered runs, running normally");
            false
        } else {
            debug
        };

        if filter::decide(&config, hook, self.scm.as_ref())? == GateDecision::Skip {
            // Dropping the sender right away yields an empty stream.
            let (_tx, rx) = flume::bounded(0);
            return Ok(rx);
        }

        let (tx, rx) = flume::bounded(0);
        let driver = Arc::clone(&self.driver);
        let workdir = self.workdir.clone();
        tokio::spawn(async move {
            let events = EventSink { tx };
            let _ = produce(config, source, debug, driver, workdir, events).await;
        });
        Ok(rx)
    }
}

async fn produce(
    config: Configuration,
    source: ImageSource,
    debug: bool,
    driver: Arc<dyn ContainerDriver>,
    workdir: PathBuf,
    events: EventSink,
) -> Result<(), RunAborted> {
    events
        .emit(PipelineEvent::PipelineStart {
            total_steps: config.steps.len(),
            log_level: config.log_level,
        })
        .await?;

    let Some(image) = prepare::prepare_image(&source, &driver, &workdir, &events).await? else {
        return events
            .emit(PipelineEvent::PipelineEnd {
                status: EventStatus::Failure,
            })
            .await;
    };

    if debug {
        run_debug(&config, &image, &driver, &workdir, &events).await
    } else {
        run_standard(&config, &image, &driver, &workdir, &events).await
    }
}

async fn run_standard(
    config: &Configuration,
    image: &str,
    driver: &Arc<dyn ContainerDriver>,
    workdir: &PathBuf,
    events: &EventSink,
) -> Result<(), RunAborted> {
    let mut final_status = EventStatus::Success;
    for step in &config.steps {
        let outcome = step::run_step(
            step,
            step::StepTarget::Transient { image, workdir },
            driver,
            events,
        )
        .await?;
        final_status = final_status.max(outcome.status);
        if outcome.status == EventStatus::Failure {
            break;
        }
    }
    events
        .emit(PipelineEvent::PipelineEnd {
            status: final_status,
        })
        .await
}

async fn run_debug(
    config: &Configuration,
    image: &str,
    driver: &Arc<dyn ContainerDriver>,
    workdir: &Path,
    events: &EventSink,
) -> Result<(), RunAborted> {
    let container_id = match driver.start_persistent(image, workdir).await {
        Ok(id) => id,
        Err(e) => {
            error!(error = %e, "could not start persistent container");
            return events
                .emit(PipelineEvent::PipelineEnd {
                    status: EventStatus::Failure,
                })
                .await;
        }
    };

    let outcome = run_debug_steps(config, &container_id, driver, events).await;
    // Sole release point of the persistent container, reached on every exit
    // path before the final event goes out: once the stream terminates, the
    // container is already gone.
    driver.stop_and_remove(&container_id).await;
    match outcome {
        Ok(status) => events.emit(PipelineEvent::PipelineEnd { status }).await,
        Err(aborted) => Err(aborted),
    }
}

async fn run_debug_steps(
    config: &Configuration,
    container_id: &str,
    driver: &Arc<dyn ContainerDriver>,
    events: &EventSink,
) -> Result<EventStatus, RunAborted> {
    let mut final_status = EventStatus::Success;
    for step in &config.steps {
        let outcome = step::run_step(
            step,
            step::StepTarget::Persistent { container_id },
            driver,
            events,
        )
        .await?;
        final_status = final_status.max(outcome.status);
        if outcome.status == EventStatus::Failure {
            // A failed command is worth a shell; a daemon fault is not.
            if !outcome.fatal {
                events
                    .emit(PipelineEvent::DebugShellStarting {
                        step: step.clone(),
                        container_id: container_id.to_string(),
                    })
                    .await?;
            }
            break;
        }
    }
    Ok(final_status)
}
