//! Execution of one pipeline step.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::error;

use crate::config::Step;
use crate::docker::ContainerDriver;
use crate::events::{EventStatus, PipelineEvent};

use super::{EventSink, LOG_CHANNEL_CAPACITY, RunAborted};

/// Where a step runs: its own container, or the shared debug container.
pub(crate) enum StepTarget<'a> {
    Transient { image: &'a str, workdir: &'a PathBuf },
    Persistent { container_id: &'a str },
}

/// What the orchestrator needs to know about a finished step.
pub(crate) struct StepOutcome {
    pub status: EventStatus,
    /// An infrastructure fault ended the step; the pipeline must stop.
    pub fatal: bool,
}

/// Maps an exit code onto the three-valued status algebra.
pub(crate) fn classify(exit_code: i64, critical: bool) -> EventStatus {
    match (exit_code, critical) {
        (0, _) => EventStatus::Success,
        (_, true) => EventStatus::Failure,
        (_, false) => EventStatus::Warning,
    }
}

/// Runs `step`, relaying its log output as events and classifying the
/// terminal exit code.
pub(crate) async fn run_step(
    step: &Step,
    target: StepTarget<'_>,
    driver: &Arc<dyn ContainerDriver>,
    events: &EventSink,
) -> Result<StepOutcome, RunAborted> {
    events
        .emit(PipelineEvent::StepStart { step: step.clone() })
        .await?;

    let (log_tx, mut log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
    let task = {
        let driver = Arc::clone(driver);
        let command = step.command.clone();
        let env = step.env.clone();
        match target {
            StepTarget::Transient { image, workdir } => {
                let image = image.to_string();
                let workdir = workdir.clone();
                tokio::spawn(async move {
                    driver
                        .run_transient(&image, &command, &workdir, &env, log_tx)
                        .await
                })
            }
            StepTarget::Persistent { container_id } => {
                let container_id = container_id.to_string();
                tokio::spawn(
                    async move { driver.exec(&container_id, &command, &env, log_tx).await },
                )
            }
        }
    };

    let mut delivery = Ok(());
    while let Some((stream, line)) = log_rx.recv().await {
        if let Err(aborted) = events
            .emit(PipelineEvent::LogLine {
                line,
                stream,
                step_name: step.name.clone(),
            })
            .await
        {
            delivery = Err(aborted);
            break;
        }
    }
    // The driver must finish (and release its container) before this call
    // returns, even when the consumer is gone. Closing the log channel
    // unblocks any send the driver is still parked on.
    drop(log_rx);
    let result = task.await;
    delivery?;

    let (status, exit_code, fatal) = match result {
        Ok(Ok(code)) => (classify(code, step.critical), code, false),
        Ok(Err(e)) => {
            error!(step = %step.name, error = %e, "step aborted by infrastructure error");
            (EventStatus::Failure, 1, true)
        }
        Err(e) => {
            error!(step = %step.name, error = %e, "step execution task died");
            (EventStatus::Failure, 1, true)
        }
    };

    events
        .emit(PipelineEvent::StepEnd {
            step: step.clone(),
            status,
            exit_code,
        })
        .await?;

    Ok(StepOutcome { status, fatal })
}
