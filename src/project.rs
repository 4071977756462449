//! First-time project setup: configuration scaffold and hook installation.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

use crate::config::{CONFIG_FILENAME, default_config};
use crate::git::{GitProbe, ScmError};

#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("project already initialized, configuration exists at {0}")]
    AlreadyInitialized(PathBuf),
    #[error(transparent)]
    Scm(#[from] ScmError),
    #[error("could not write project files: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize default configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// What `init` created.
#[derive(Debug)]
pub struct InitReport {
    pub config_path: PathBuf,
    pub installed_hooks: Vec<PathBuf>,
}

const HOOK_NAMES: [&str; 2] = ["pre-commit", "pre-push"];

fn hook_script(hook: &str) -> String {
    format!("#!/bin/sh\n# Installed by hookci.\nexec hookci hook {hook}\n")
}

/// Creates `hookci.yaml` at the repository root and installs the git hook
/// scripts. Pre-existing hook files are left untouched.
pub fn init_project(start: &Path) -> Result<InitReport, ProjectError> {
    let probe = GitProbe::discover(start)?;
    let root = probe.repo_root();

    let config_path = root.join(CONFIG_FILENAME);
    if config_path.exists() {
        return Err(ProjectError::AlreadyInitialized(config_path));
    }
    fs::write(&config_path, serde_yaml::to_string(&default_config())?)?;

    let hooks_dir = root.join(".git").join("hooks");
    fs::create_dir_all(&hooks_dir)?;

    let mut installed_hooks = Vec::new();
    for hook in HOOK_NAMES {
        let hook_path = hooks_dir.join(hook);
        if hook_path.exists() {
            warn!(hook = %hook, "hook script already exists, leaving it alone");
            continue;
        }
        fs::write(&hook_path, hook_script(hook))?;
        make_executable(&hook_path)?;
        installed_hooks.push(hook_path);
    }

    Ok(InitReport {
        config_path,
        installed_hooks,
    })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
