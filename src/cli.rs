//! Command-line surface and event rendering.

use std::path::Path;

use clap::{Parser, Subcommand, ValueEnum};

use hookci::config::{CONFIG_FILENAME, Configuration};
use hookci::events::{EventStatus, LogStream, PipelineEvent};
use hookci::{HookType, PipelineRunner, logging, project};

/// Exit code for a pipeline that failed.
const EXIT_FAILURE: i32 = 1;
/// Exit code for an error outside the pipeline itself.
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "hookci", version, about = "Run CI pipelines from git hooks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create hookci.yaml and install the git hook scripts
    Init,
    /// Run the pipeline manually
    Run {
        /// Share one container across all steps and open a shell when a
        /// critical step fails
        #[arg(long)]
        debug: bool,
    },
    /// Entry point used by the installed git hooks
    Hook {
        #[arg(value_enum)]
        hook: HookArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum HookArg {
    PreCommit,
    PrePush,
}

impl From<HookArg> for HookType {
    fn from(arg: HookArg) -> Self {
        match arg {
            HookArg::PreCommit => HookType::PreCommit,
            HookArg::PrePush => HookType::PrePush,
        }
    }
}

/// Parses arguments, runs the requested command, returns the process exit
/// code.
pub async fn execute() -> i32 {
    let cli = Cli::parse();
    let cwd = match std::env::current_dir() {
        Ok(cwd) => cwd,
        Err(e) => {
            eprintln!("hookci: cannot determine working directory: {e}");
            return EXIT_FATAL;
        }
    };

    match cli.command {
        Command::Init => init(&cwd),
        Command::Run { debug } => run_pipeline(&cwd, None, debug).await,
        Command::Hook { hook } => run_pipeline(&cwd, Some(hook.into()), false).await,
    }
}

fn init(cwd: &Path) -> i32 {
    match project::init_project(cwd) {
        Ok(report) => {
            println!("Created {}", report.config_path.display());
            for hook in &report.installed_hooks {
                println!("Installed {}", hook.display());
            }
            0
        }
        Err(e) => {
            eprintln!("hookci: {e}");
            EXIT_FATAL
        }
    }
}

async fn run_pipeline(cwd: &Path, hook: Option<HookType>, debug: bool) -> i32 {
    let runner = match PipelineRunner::connect(cwd).await {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("hookci: {e}");
            return EXIT_FATAL;
        }
    };

    let config_path = runner.workdir().join(CONFIG_FILENAME);
    let config = match Configuration::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("hookci: {e}");
            return EXIT_FATAL;
        }
    };
    logging::init(config.log_level.as_filter());

    let events = match runner.run(config, hook, debug) {
        Ok(events) => events,
        Err(e) => {
            eprintln!("hookci: {e}");
            return EXIT_FATAL;
        }
    };

    match render_events(events).await {
        Some(EventStatus::Failure) => EXIT_FAILURE,
        Some(_) => 0,
        // Filter-gate skip: nothing ran, nothing to object to.
        None => 0,
    }
}

/// Drains the event stream to the terminal and returns the final verdict.
async fn render_events(events: flume::Receiver<PipelineEvent>) -> Option<EventStatus> {
    let mut verdict = None;
    while let Ok(event) = events.recv_async().await {
        match event {
            PipelineEvent::PipelineStart { total_steps, .. } => {
                println!("Running pipeline ({total_steps} steps)");
            }
            PipelineEvent::ImagePullStart { image_name } => {
                println!("Pulling image {image_name}...");
            }
            PipelineEvent::ImagePullEnd { status } => {
                println!("Pull: {status}");
            }
            PipelineEvent::ImageBuildStart {
                dockerfile_path,
                tag,
                total_steps,
            } => {
                println!("Building {tag} from {dockerfile_path} ({total_steps} steps)");
            }
            PipelineEvent::ImageBuildProgress { step, line } => {
                println!("  [{step}] {line}");
            }
            PipelineEvent::ImageBuildEnd { status } => {
                println!("Build: {status}");
            }
            PipelineEvent::StepStart { step } => {
                println!("=== {} ===", step.name);
            }
            PipelineEvent::LogLine { line, stream, .. } => {
                print_log_line(&line, stream);
            }
            PipelineEvent::StepEnd {
                step,
                status,
                exit_code,
            } => {
                println!("--- {}: {status} (exit code {exit_code})", step.name);
            }
            PipelineEvent::DebugShellStarting { step, container_id } => {
                eprintln!(
                    "Step '{}' failed; opening a shell in container {container_id}",
                    step.name
                );
                open_debug_shell(&container_id);
            }
            PipelineEvent::PipelineEnd { status } => {
                println!("Pipeline finished: {status}");
                verdict = Some(status);
            }
        }
    }
    verdict
}

fn print_log_line(line: &str, stream: LogStream) {
    let timestamp = chrono::Local::now().format("%H:%M:%S");
    let text = line.trim_end_matches('\n');
    match stream {
        LogStream::Stdout => println!("{timestamp} [OUT] {text}"),
        LogStream::Stderr => eprintln!("{timestamp} [ERR] {text}"),
    }
}

/// Interactive handoff requested by the engine after a failing critical
/// step.
fn open_debug_shell(container_id: &str) {
    let result = std::process::Command::new("docker")
        .args(["exec", "-it", container_id, "/bin/sh"])
        .status();
    match result {
        Ok(status) if !status.success() => {
            eprintln!("debug shell exited with {status}");
        }
        Ok(_) => {}
        Err(e) => eprintln!("could not open debug shell: {e}"),
    }
}
