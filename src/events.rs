//! Event stream vocabulary.
//!
//! The engine reports everything it does as a totally ordered sequence of
//! [`PipelineEvent`] values delivered to a single consumer.

use serde::Serialize;

use crate::config::{LogLevel, Step};

/// Outcome of a step, an image preparation phase, or a whole pipeline.
///
/// Variants are ordered so that aggregation is a plain `max`: a warning
/// degrades a successful pipeline, a failure dominates everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventStatus {
    Success,
    Warning,
    Failure,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Success => write!(f, "SUCCESS"),
            EventStatus::Warning => write!(f, "WARNING"),
            EventStatus::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Logical output channel of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// One event in the pipeline's output stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PipelineEvent {
    /// Emitted exactly once per run that passes the filter gate.
    PipelineStart {
        total_steps: usize,
        log_level: LogLevel,
    },
    ImagePullStart {
        image_name: String,
    },
    ImagePullEnd {
        status: EventStatus,
    },
    ImageBuildStart {
        dockerfile_path: String,
        tag: String,
        total_steps: usize,
    },
    ImageBuildProgress {
        step: usize,
        line: String,
    },
    ImageBuildEnd {
        status: EventStatus,
    },
    StepStart {
        step: Step,
    },
    LogLine {
        line: String,
        stream: LogStream,
        step_name: String,
    },
    StepEnd {
        step: Step,
        status: EventStatus,
        exit_code: i64,
    },
    /// Debug mode only: a critical step failed and the persistent container
    /// is being kept alive for an interactive shell.
    DebugShellStarting {
        step: Step,
        container_id: String,
    },
    /// Always the last event once `PipelineStart` has been emitted.
    PipelineEnd {
        status: EventStatus,
    },
}
