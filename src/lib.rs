//! hookci: a local CI runner wired into git hooks.
//!
//! A pipeline is an ordered list of shell steps executed inside Docker
//! containers built or pulled from the project's configuration. The engine
//! ([`engine::PipelineRunner`]) reports everything through a lazy stream of
//! [`events::PipelineEvent`] values; the CLI in `src/main.rs` is just one
//! consumer of that stream.

pub mod config;
pub mod docker;
pub mod engine;
pub mod events;
pub mod git;
pub mod logging;
pub mod project;

pub use config::{Configuration, Step};
pub use engine::{EngineError, HookType, PipelineRunner};
pub use events::{EventStatus, LogStream, PipelineEvent};
