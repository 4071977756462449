//! Hook gate: decides whether a hook-triggered run proceeds at all.

use std::str::FromStr;

use tracing::debug;

use crate::config::Configuration;
use crate::git::ScmProbe;

use super::EngineError;

/// Which git hook triggered the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    PreCommit,
    PrePush,
}

impl HookType {
    pub fn as_str(self) -> &'static str {
        match self {
            HookType::PreCommit => "pre-commit",
            HookType::PrePush => "pre-push",
        }
    }
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-commit" => Ok(HookType::PreCommit),
            "pre-push" => Ok(HookType::PrePush),
            other => Err(format!("unknown hook type '{other}'")),
        }
    }
}

/// Gate verdict. `Skip` ends the run before any event is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    Skip,
}

/// Evaluates hook-enabled flags and the optional branch/commit filters.
/// Manual runs (no hook) always proceed.
pub(crate) fn decide(
    config: &Configuration,
    hook: Option<HookType>,
    scm: &dyn ScmProbe,
) -> Result<GateDecision, EngineError> {
    let Some(hook) = hook else {
        return Ok(GateDecision::Proceed);
    };

    let enabled = match hook {
        HookType::PreCommit => config.hooks.pre_commit,
        HookType::PrePush => config.hooks.pre_push,
    };
    if !enabled {
        debug!(hook = %hook, "hook disabled in configuration, skipping run");
        return Ok(GateDecision::Skip);
    }

    let Some(filters) = &config.filters else {
        return Ok(GateDecision::Proceed);
    };

    if let Some(matcher) = filters.branch_matcher()? {
        let branch = scm.current_branch()?;
        if !matcher.is_match(&branch) {
            debug!(branch = %branch, "branch does not match filter, skipping run");
            return Ok(GateDecision::Skip);
        }
    }

    if hook == HookType::PreCommit {
        if let Some(matcher) = filters.commit_matcher()? {
            let message = scm.staged_commit_message()?;
            if !matcher.is_match(&message) {
                debug!("commit message does not match filter, skipping run");
                return Ok(GateDecision::Skip);
            }
        }
    }

    Ok(GateDecision::Proceed)
}
