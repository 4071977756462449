//! End-to-end pipeline scenarios against a scripted driver.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;

use hookci::config::{
    Configuration, DockerSection, Filters, Hooks, LogLevel, Step,
};
use hookci::docker::{BuildProgress, ContainerDriver, DockerError, LogChunk, recipe};
use hookci::events::{EventStatus, LogStream, PipelineEvent};
use hookci::git::{ScmError, ScmProbe};
use hookci::{HookType, PipelineRunner};

const STUB_CONTAINER_ID: &str = "cid-123";

/// Driver whose behavior is scripted per scenario. Step exit codes come
/// from the command itself: `exit N` fails with N, anything else succeeds.
#[derive(Default)]
struct StubDriver {
    image_exists: bool,
    exists_error: bool,
    pull_fails: bool,
    build_fails: bool,
    build_script: Vec<BuildProgress>,
    run_logs: Vec<LogChunk>,
    run_error: bool,
    calls: Mutex<Vec<String>>,
}

impl StubDriver {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    async fn scripted_run(&self, logs: mpsc::Sender<LogChunk>) -> Result<i64, DockerError> {
        if self.run_error {
            return Err(DockerError::Api("daemon connection lost".to_string()));
        }
        for chunk in &self.run_logs {
            let _ = logs.send(chunk.clone()).await;
        }
        Ok(0)
    }
}

fn exit_code_for(command: &str) -> i64 {
    command
        .strip_prefix("exit ")
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ContainerDriver for StubDriver {
    async fn image_exists(&self, tag: &str) -> Result<bool, DockerError> {
        self.record(format!("image_exists:{tag}"));
        if self.exists_error {
            return Err(DockerError::Api("inspect failed".to_string()));
        }
        Ok(self.image_exists)
    }

    async fn pull_image(&self, name: &str) -> Result<(), DockerError> {
        self.record(format!("pull:{name}"));
        if self.pull_fails {
            return Err(DockerError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn build_image(
        &self,
        _recipe_path: &Path,
        tag: &str,
        progress: mpsc::Sender<BuildProgress>,
    ) -> Result<(), DockerError> {
        self.record(format!("build:{tag}"));
        for item in &self.build_script {
            let _ = progress.send(item.clone()).await;
        }
        if self.build_fails {
            return Err(DockerError::BuildFailed("step failed".to_string()));
        }
        Ok(())
    }

    async fn run_transient(
        &self,
        _image: &str,
        command: &str,
        _workdir: &Path,
        _env: &HashMap<String, String>,
        logs: mpsc::Sender<LogChunk>,
    ) -> Result<i64, DockerError> {
        self.record(format!("run:{command}"));
        self.scripted_run(logs).await?;
        Ok(exit_code_for(command))
    }

    async fn start_persistent(&self, image: &str, _workdir: &Path) -> Result<String, DockerError> {
        self.record(format!("start_persistent:{image}"));
        Ok(STUB_CONTAINER_ID.to_string())
    }

    async fn exec(
        &self,
        container_id: &str,
        command: &str,
        _env: &HashMap<String, String>,
        logs: mpsc::Sender<LogChunk>,
    ) -> Result<i64, DockerError> {
        self.record(format!("exec:{container_id}:{command}"));
        self.scripted_run(logs).await?;
        Ok(exit_code_for(command))
    }

    async fn stop_and_remove(&self, container_id: &str) {
        self.record(format!("stop_and_remove:{container_id}"));
    }
}

struct StubScm {
    branch: &'static str,
    message: &'static str,
}

impl Default for StubScm {
    fn default() -> Self {
        Self {
            branch: "main",
            message: "",
        }
    }
}

impl ScmProbe for StubScm {
    fn current_branch(&self) -> Result<String, ScmError> {
        Ok(self.branch.to_string())
    }

    fn staged_commit_message(&self) -> Result<String, ScmError> {
        Ok(self.message.to_string())
    }
}

fn step(name: &str, command: &str, critical: bool) -> Step {
    Step {
        name: name.to_string(),
        command: command.to_string(),
        critical,
        env: HashMap::new(),
        depends_on: Vec::new(),
    }
}

fn registry_config(steps: Vec<Step>) -> Configuration {
    Configuration {
        version: "1.0".to_string(),
        log_level: LogLevel::Info,
        docker: DockerSection {
            image: Some("busybox:latest".to_string()),
            dockerfile: None,
        },
        hooks: Hooks {
            pre_commit: true,
            pre_push: true,
        },
        filters: None,
        steps,
    }
}

fn recipe_config(steps: Vec<Step>) -> Configuration {
    let mut config = registry_config(steps);
    config.docker = DockerSection {
        image: None,
        dockerfile: Some("Dockerfile".to_string()),
    };
    config
}

fn runner(driver: &Arc<StubDriver>, scm: StubScm, workdir: PathBuf) -> PipelineRunner {
    PipelineRunner::new(
        Arc::clone(driver) as Arc<dyn ContainerDriver>,
        Arc::new(scm),
        workdir,
    )
}

async fn collect(
    runner: &PipelineRunner,
    config: Configuration,
    hook: Option<HookType>,
    debug: bool,
) -> Vec<PipelineEvent> {
    let events = runner.run(config, hook, debug).expect("run starts");
    let mut collected = Vec::new();
    while let Ok(event) = events.recv_async().await {
        collected.push(event);
    }
    collected
}

// S1: cached registry image, one green step.
#[tokio::test]
async fn cached_image_single_green_step() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let ok = step("ok", "true", true);

    let events = collect(&runner, registry_config(vec![ok.clone()]), None, false).await;

    assert_eq!(
        events,
        vec![
            PipelineEvent::PipelineStart {
                total_steps: 1,
                log_level: LogLevel::Info,
            },
            PipelineEvent::StepStart { step: ok.clone() },
            PipelineEvent::StepEnd {
                step: ok,
                status: EventStatus::Success,
                exit_code: 0,
            },
            PipelineEvent::PipelineEnd {
                status: EventStatus::Success,
            },
        ]
    );
}

// S2: pull, then a failing critical step with stderr output.
#[tokio::test]
async fn pull_then_failing_critical_step() {
    let driver = Arc::new(StubDriver {
        image_exists: false,
        run_logs: vec![(LogStream::Stderr, "boom\n".to_string())],
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let failing = step("ok", "exit 2", true);

    let events = collect(&runner, registry_config(vec![failing.clone()]), None, false).await;

    assert_eq!(
        events,
        vec![
            PipelineEvent::PipelineStart {
                total_steps: 1,
                log_level: LogLevel::Info,
            },
            PipelineEvent::ImagePullStart {
                image_name: "busybox:latest".to_string(),
            },
            PipelineEvent::ImagePullEnd {
                status: EventStatus::Success,
            },
            PipelineEvent::StepStart {
                step: failing.clone(),
            },
            PipelineEvent::LogLine {
                line: "boom\n".to_string(),
                stream: LogStream::Stderr,
                step_name: "ok".to_string(),
            },
            PipelineEvent::StepEnd {
                step: failing,
                status: EventStatus::Failure,
                exit_code: 2,
            },
            PipelineEvent::PipelineEnd {
                status: EventStatus::Failure,
            },
        ]
    );
}

// S3: recipe build on cache miss, then a green step.
#[tokio::test]
async fn recipe_build_on_cache_miss() {
    let workdir = tempfile::tempdir().unwrap();
    let dockerfile = workdir.path().join("Dockerfile");
    std::fs::write(&dockerfile, "FROM alpine:latest\nRUN true\nCOPY . /x\n").unwrap();

    let driver = Arc::new(StubDriver {
        image_exists: false,
        build_script: vec![
            (1, "Step 1/3 : FROM alpine:latest".to_string()),
            (2, "Step 2/3 : RUN true".to_string()),
            (3, "Step 3/3 : COPY . /x".to_string()),
        ],
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), workdir.path().to_path_buf());
    let ok = step("ok", "true", true);

    let events = collect(&runner, recipe_config(vec![ok.clone()]), None, false).await;

    let fingerprint = recipe::fingerprint(&dockerfile).unwrap();
    let repo = workdir
        .path()
        .file_name()
        .unwrap()
        .to_str()
        .unwrap()
        .to_lowercase();
    let tag = format!("hookci/{repo}:{fingerprint}");

    assert_eq!(
        events,
        vec![
            PipelineEvent::PipelineStart {
                total_steps: 1,
                log_level: LogLevel::Info,
            },
            PipelineEvent::ImageBuildStart {
                dockerfile_path: dockerfile.display().to_string(),
                tag: tag.clone(),
                total_steps: 3,
            },
            PipelineEvent::ImageBuildProgress {
                step: 1,
                line: "Step 1/3 : FROM alpine:latest".to_string(),
            },
            PipelineEvent::ImageBuildProgress {
                step: 2,
                line: "Step 2/3 : RUN true".to_string(),
            },
            PipelineEvent::ImageBuildProgress {
                step: 3,
                line: "Step 3/3 : COPY . /x".to_string(),
            },
            PipelineEvent::ImageBuildEnd {
                status: EventStatus::Success,
            },
            PipelineEvent::StepStart { step: ok.clone() },
            PipelineEvent::StepEnd {
                step: ok,
                status: EventStatus::Success,
                exit_code: 0,
            },
            PipelineEvent::PipelineEnd {
                status: EventStatus::Success,
            },
        ]
    );
    assert!(driver.calls().contains(&format!("build:{tag}")));
}

// Property 7: a fingerprint cache hit emits no build events at all.
#[tokio::test]
async fn recipe_cache_hit_emits_no_build_events() {
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("Dockerfile"), "FROM alpine\n").unwrap();

    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), workdir.path().to_path_buf());
    let ok = step("ok", "true", true);

    let events = collect(&runner, recipe_config(vec![ok]), None, false).await;

    assert!(events.iter().all(|event| !matches!(
        event,
        PipelineEvent::ImageBuildStart { .. }
            | PipelineEvent::ImageBuildProgress { .. }
            | PipelineEvent::ImageBuildEnd { .. }
    )));
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::PipelineEnd {
            status: EventStatus::Success,
        })
    );
    let calls = driver.calls();
    assert!(!calls.iter().any(|call| call.starts_with("build:")));
}

// S4: a non-critical failure degrades the verdict without stopping the run.
#[tokio::test]
async fn noncritical_failure_degrades_to_warning() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let a = step("A", "true", true);
    let b = step("B", "exit 1", false);
    let c = step("C", "true", true);

    let events = collect(
        &runner,
        registry_config(vec![a.clone(), b.clone(), c.clone()]),
        None,
        false,
    )
    .await;

    let step_ends: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::StepEnd { step, status, .. } => Some((step.name.as_str(), *status)),
            _ => None,
        })
        .collect();
    assert_eq!(
        step_ends,
        vec![
            ("A", EventStatus::Success),
            ("B", EventStatus::Warning),
            ("C", EventStatus::Success),
        ]
    );
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::PipelineEnd {
            status: EventStatus::Warning,
        })
    );
}

// S5: a branch-filter mismatch produces an empty event stream.
#[tokio::test]
async fn branch_filter_skip_is_silent() {
    let driver = Arc::new(StubDriver::default());
    let scm = StubScm {
        branch: "main",
        message: "",
    };
    let runner = runner(&driver, scm, PathBuf::from("/repo"));
    let mut config = registry_config(vec![step("ok", "true", true)]);
    config.filters = Some(Filters {
        branches: Some("feature/.*".to_string()),
        commits: None,
    });

    let events = collect(&runner, config, Some(HookType::PreCommit), false).await;

    assert_eq!(events, vec![]);
    assert_eq!(driver.calls(), Vec::<String>::new());
}

// S6: debug mode opens a shell after a critical failure, then cleans up.
#[tokio::test]
async fn debug_critical_failure_starts_shell_and_cleans_up() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let failing = step("ok", "exit 3", true);

    let events = collect(&runner, registry_config(vec![failing.clone()]), None, true).await;

    assert_eq!(
        events,
        vec![
            PipelineEvent::PipelineStart {
                total_steps: 1,
                log_level: LogLevel::Info,
            },
            PipelineEvent::StepStart {
                step: failing.clone(),
            },
            PipelineEvent::StepEnd {
                step: failing.clone(),
                status: EventStatus::Failure,
                exit_code: 3,
            },
            PipelineEvent::DebugShellStarting {
                step: failing,
                container_id: STUB_CONTAINER_ID.to_string(),
            },
            PipelineEvent::PipelineEnd {
                status: EventStatus::Failure,
            },
        ]
    );

    let cleanups: Vec<_> = driver
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("stop_and_remove:"))
        .collect();
    assert_eq!(cleanups, vec![format!("stop_and_remove:{STUB_CONTAINER_ID}")]);
}

// Cleanup precedes the final event: by the time PipelineEnd is delivered,
// the persistent container has already been released.
#[tokio::test]
async fn debug_cleanup_completes_before_pipeline_end() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let config = registry_config(vec![step("ok", "exit 3", true)]);

    let events = runner.run(config, None, true).expect("run starts");
    while let Ok(event) = events.recv_async().await {
        if matches!(event, PipelineEvent::PipelineEnd { .. }) {
            let cleanups: Vec<_> = driver
                .calls()
                .into_iter()
                .filter(|call| call.starts_with("stop_and_remove:"))
                .collect();
            assert_eq!(
                cleanups,
                vec![format!("stop_and_remove:{STUB_CONTAINER_ID}")],
                "container must be released before the final event is delivered"
            );
            return;
        }
    }
    panic!("stream ended without PipelineEnd");
}

// Debug steps run through exec in the shared container, in order.
#[tokio::test]
async fn debug_mode_uses_persistent_container_for_all_steps() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let config = registry_config(vec![step("a", "true", true), step("b", "true", true)]);

    let events = collect(&runner, config, None, true).await;

    assert_eq!(
        events.last(),
        Some(&PipelineEvent::PipelineEnd {
            status: EventStatus::Success,
        })
    );
    let calls = driver.calls();
    assert!(calls.contains(&format!("exec:{STUB_CONTAINER_ID}:true")));
    assert!(!calls.iter().any(|call| call.starts_with("run:")));
    assert_eq!(
        calls
            .iter()
            .filter(|call| call.starts_with("stop_and_remove:"))
            .count(),
        1
    );
}

// A daemon fault in debug mode ends the run without offering a shell.
#[tokio::test]
async fn debug_infrastructure_error_skips_shell() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        run_error: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let config = registry_config(vec![step("ok", "true", true)]);

    let events = collect(&runner, config, None, true).await;

    assert!(events
        .iter()
        .all(|event| !matches!(event, PipelineEvent::DebugShellStarting { .. })));
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::PipelineEnd {
            status: EventStatus::Failure,
        })
    );
    assert_eq!(
        driver
            .calls()
            .iter()
            .filter(|call| call.starts_with("stop_and_remove:"))
            .count(),
        1
    );
}

// An infrastructure error fails the step with exit code 1 and ends the
// pipeline even when the step is non-critical.
#[tokio::test]
async fn infrastructure_error_is_fatal_even_for_noncritical_steps() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        run_error: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let warn_only = step("flaky", "true", false);
    let never_runs = step("after", "true", true);

    let events = collect(
        &runner,
        registry_config(vec![warn_only.clone(), never_runs]),
        None,
        false,
    )
    .await;

    assert_eq!(
        events[events.len() - 2],
        PipelineEvent::StepEnd {
            step: warn_only,
            status: EventStatus::Failure,
            exit_code: 1,
        }
    );
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::PipelineEnd {
            status: EventStatus::Failure,
        })
    );
    let step_starts = events
        .iter()
        .filter(|event| matches!(event, PipelineEvent::StepStart { .. }))
        .count();
    assert_eq!(step_starts, 1);
}

// A failed pull closes the pipeline before any step runs.
#[tokio::test]
async fn failed_pull_fails_pipeline_without_steps() {
    let driver = Arc::new(StubDriver {
        image_exists: false,
        pull_fails: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));

    let events = collect(
        &runner,
        registry_config(vec![step("ok", "true", true)]),
        None,
        false,
    )
    .await;

    assert_eq!(
        events,
        vec![
            PipelineEvent::PipelineStart {
                total_steps: 1,
                log_level: LogLevel::Info,
            },
            PipelineEvent::ImagePullStart {
                image_name: "busybox:latest".to_string(),
            },
            PipelineEvent::ImagePullEnd {
                status: EventStatus::Failure,
            },
            PipelineEvent::PipelineEnd {
                status: EventStatus::Failure,
            },
        ]
    );
}

// A failed build emits its progress, then the failure pair.
#[tokio::test]
async fn failed_build_fails_pipeline() {
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("Dockerfile"), "FROM alpine\nRUN false\n").unwrap();

    let driver = Arc::new(StubDriver {
        image_exists: false,
        build_fails: true,
        build_script: vec![(1, "Step 1/2 : FROM alpine".to_string())],
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), workdir.path().to_path_buf());

    let events = collect(
        &runner,
        recipe_config(vec![step("ok", "true", true)]),
        None,
        false,
    )
    .await;

    assert!(matches!(
        events[1],
        PipelineEvent::ImageBuildStart { total_steps: 2, .. }
    ));
    assert_eq!(
        events[events.len() - 2..].to_vec(),
        vec![
            PipelineEvent::ImageBuildEnd {
                status: EventStatus::Failure,
            },
            PipelineEvent::PipelineEnd {
                status: EventStatus::Failure,
            },
        ]
    );
}

// A cache-check hiccup is not fatal; the pull still happens.
#[tokio::test]
async fn cache_check_error_still_pulls() {
    let driver = Arc::new(StubDriver {
        exists_error: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));

    let events = collect(
        &runner,
        registry_config(vec![step("ok", "true", true)]),
        None,
        false,
    )
    .await;

    assert!(events.iter().any(|event| matches!(
        event,
        PipelineEvent::ImagePullStart { .. }
    )));
    assert_eq!(
        events.last(),
        Some(&PipelineEvent::PipelineEnd {
            status: EventStatus::Success,
        })
    );
}

// Debug is forced off when a hook type is present.
#[tokio::test]
async fn hook_run_forces_debug_off() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let config = registry_config(vec![step("ok", "true", true)]);

    let events = collect(&runner, config, Some(HookType::PrePush), true).await;

    assert_eq!(
        events.last(),
        Some(&PipelineEvent::PipelineEnd {
            status: EventStatus::Success,
        })
    );
    let calls = driver.calls();
    assert!(calls.iter().any(|call| call.starts_with("run:")));
    assert!(!calls.iter().any(|call| call.starts_with("start_persistent:")));
}

// An empty step list is a trivially successful pipeline.
#[tokio::test]
async fn empty_pipeline_succeeds() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));

    let events = collect(&runner, registry_config(vec![]), None, false).await;

    assert_eq!(
        events,
        vec![
            PipelineEvent::PipelineStart {
                total_steps: 0,
                log_level: LogLevel::Info,
            },
            PipelineEvent::PipelineEnd {
                status: EventStatus::Success,
            },
        ]
    );
}

// Invalid configurations are rejected before any event is produced.
#[tokio::test]
async fn invalid_configuration_is_a_fatal_error() {
    let driver = Arc::new(StubDriver::default());
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let mut config = registry_config(vec![step("ok", "true", true)]);
    config.docker.dockerfile = Some("Dockerfile".to_string());

    assert!(runner.run(config, None, false).is_err());
    assert_eq!(driver.calls(), Vec::<String>::new());
}

// Ordering invariant: per step, StepStart then LogLines then StepEnd, with
// no interleaving across steps.
#[tokio::test]
async fn per_step_event_ordering_holds() {
    let driver = Arc::new(StubDriver {
        image_exists: true,
        run_logs: vec![
            (LogStream::Stdout, "line 1\n".to_string()),
            (LogStream::Stderr, "line 2\n".to_string()),
        ],
        ..Default::default()
    });
    let runner = runner(&driver, StubScm::default(), PathBuf::from("/repo"));
    let config = registry_config(vec![step("a", "true", true), step("b", "true", true)]);

    let events = collect(&runner, config, None, false).await;

    let mut current: Option<&str> = None;
    for event in &events {
        match event {
            PipelineEvent::StepStart { step } => {
                assert_eq!(current, None, "step started while another was open");
                current = Some(step.name.as_str());
            }
            PipelineEvent::LogLine { step_name, .. } => {
                assert_eq!(current, Some(step_name.as_str()));
            }
            PipelineEvent::StepEnd { step, .. } => {
                assert_eq!(current, Some(step.name.as_str()));
                current = None;
            }
            _ => {}
        }
    }
    assert_eq!(current, None);
}
