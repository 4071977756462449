//! Pipeline configuration model.
//!
//! `hookci.yaml` is deserialized into [`Configuration`] and then checked by
//! [`Configuration::validate`] before the engine accepts it. The engine
//! itself never reads the file; it is handed a validated value.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the configuration file at the repository root.
pub const CONFIG_FILENAME: &str = "hookci.yaml";

/// Error raised while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("step name must not be empty")]
    EmptyStepName,
    #[error("duplicate step name '{0}'")]
    DuplicateStepName(String),
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
    #[error("step '{0}' depends on itself")]
    SelfDependency(String),
    #[error("dependency cycle involving steps: {0}")]
    DependencyCycle(String),
    #[error("docker section needs exactly one of 'image' or 'dockerfile'")]
    AmbiguousImageSource,
    #[error("docker section declares neither 'image' nor 'dockerfile'")]
    MissingImageSource,
    #[error("invalid '{filter}' filter pattern: {error}")]
    InvalidFilter { filter: String, error: String },
}

/// Verbosity requested by the configuration, passed through to the consumer
/// in `PipelineStart`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

/// A single shell command executed in a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_critical() -> bool {
    true
}

/// Where the pipeline image comes from: a registry reference or a local
/// Dockerfile. Exactly one must be declared.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,
}

/// Resolved image source, produced by [`DockerSection::source`].
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    Registry(String),
    Recipe(PathBuf),
}

impl DockerSection {
    pub fn source(&self) -> Result<ImageSource, ConfigError> {
        match (&self.image, &self.dockerfile) {
            (Some(_), Some(_)) => Err(ConfigError::AmbiguousImageSource),
            (Some(image), None) => Ok(ImageSource::Registry(image.clone())),
            (None, Some(dockerfile)) => Ok(ImageSource::Recipe(PathBuf::from(dockerfile))),
            (None, None) => Err(ConfigError::MissingImageSource),
        }
    }
}

/// Which git hooks are allowed to trigger a run. Both fields are required
/// by the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hooks {
    pub pre_commit: bool,
    pub pre_push: bool,
}

/// Optional predicates evaluated by the filter gate on hook-triggered runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commits: Option<String>,
}

impl Filters {
    /// Branch pattern, anchored at the start of the branch name.
    pub fn branch_matcher(&self) -> Result<Option<Regex>, ConfigError> {
        compile_anchored(self.branches.as_deref(), "branches", false)
    }

    /// Commit-message pattern, anchored and with `.` matching newlines so a
    /// multi-line message body stays reachable.
    pub fn commit_matcher(&self) -> Result<Option<Regex>, ConfigError> {
        compile_anchored(self.commits.as_deref(), "commits", true)
    }
}

fn compile_anchored(
    pattern: Option<&str>,
    filter: &str,
    dot_matches_newline: bool,
) -> Result<Option<Regex>, ConfigError> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    let anchored = if dot_matches_newline {
        format!("(?s)^(?:{pattern})")
    } else {
        format!("^(?:{pattern})")
    };
    Regex::new(&anchored)
        .map(Some)
        .map_err(|e| ConfigError::InvalidFilter {
            filter: filter.to_string(),
            error: e.to_string(),
        })
}

/// Root configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub version: String,
    #[serde(default)]
    pub log_level: LogLevel,
    pub docker: DockerSection,
    pub hooks: Hooks,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filters>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Configuration {
    /// Reads and parses `hookci.yaml` without validating it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Checks every structural invariant the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.docker.source()?;

        let mut names = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(ConfigError::EmptyStepName);
            }
            if !names.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateStepName(step.name.clone()));
            }
        }

        for step in &self.steps {
            for dependency in &step.depends_on {
                if dependency == &step.name {
                    return Err(ConfigError::SelfDependency(step.name.clone()));
                }
                if !names.contains(dependency.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        step: step.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        self.check_acyclic()?;

        if let Some(filters) = &self.filters {
            filters.branch_matcher()?;
            filters.commit_matcher()?;
        }
        Ok(())
    }

    /// Kahn's algorithm over the `depends_on` edges. The order is discarded:
    /// steps always execute in declaration order, the graph is metadata.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();

        for step in &self.steps {
            in_degree.entry(step.name.as_str()).or_insert(0);
            dependents.entry(step.name.as_str()).or_default();
        }
        for step in &self.steps {
            for dependency in &step.depends_on {
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(step.name.as_str());
                *in_degree.entry(step.name.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut resolved = 0usize;

        while let Some(name) = queue.pop_front() {
            resolved += 1;
            if let Some(next) = dependents.get(name) {
                for &dependent in next {
                    let degree = in_degree.get_mut(dependent).expect("known step");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        if resolved != self.steps.len() {
            let stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(ConfigError::DependencyCycle(stuck.join(", ")));
        }
        Ok(())
    }
}

/// Configuration written by `hookci init`.
pub fn default_config() -> Configuration {
    Configuration {
        version: "1.0".to_string(),
        log_level: LogLevel::Info,
        docker: DockerSection {
            image: Some("alpine:latest".to_string()),
            dockerfile: None,
        },
        hooks: Hooks {
            pre_commit: true,
            pre_push: true,
        },
        filters: None,
        steps: vec![
            Step {
                name: "Linting".to_string(),
                command: "echo 'Linting...'".to_string(),
                critical: true,
                env: HashMap::new(),
                depends_on: Vec::new(),
            },
            Step {
                name: "Testing".to_string(),
                command: "echo 'Testing...'".to_string(),
                critical: true,
                env: HashMap::new(),
                depends_on: Vec::new(),
            },
        ],
    }
}
