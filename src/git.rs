//! Source-control probe.
//!
//! The filter gate needs two facts from git: the current branch and the
//! staged commit message. Both are read the cheap way: one `git` subprocess
//! for the branch, a direct read of `COMMIT_EDITMSG` for the message.

use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScmError {
    #[error("not inside a git repository")]
    NotARepository,
    #[error("git failed: {0}")]
    CommandFailed(String),
    #[error("git I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Minimal source-control facts the engine consumes.
pub trait ScmProbe: Send + Sync {
    fn current_branch(&self) -> Result<String, ScmError>;

    /// Content of the pending commit message with comment lines stripped.
    /// Empty when no message is staged.
    fn staged_commit_message(&self) -> Result<String, ScmError>;
}

/// Probe backed by a local git checkout.
pub struct GitProbe {
    repo_root: PathBuf,
}

impl GitProbe {
    /// Walks up from `start` until a directory containing `.git` is found.
    pub fn discover(start: &Path) -> Result<Self, ScmError> {
        let mut current = start.canonicalize()?;
        loop {
            if current.join(".git").is_dir() {
                return Ok(Self { repo_root: current });
            }
            if !current.pop() {
                return Err(ScmError::NotARepository);
            }
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }
}

impl ScmProbe for GitProbe {
    fn current_branch(&self) -> Result<String, ScmError> {
        let output = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(&self.repo_root)
            .output()?;
        if !output.status.success() {
            return Err(ScmError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn staged_commit_message(&self) -> Result<String, ScmError> {
        let path = self.repo_root.join(".git").join("COMMIT_EDITMSG");
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(e.into()),
        };
        let message: String = content
            .lines()
            .filter(|line| !line.starts_with('#'))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(message.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fake_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        dir
    }

    #[test]
    fn discovers_repo_root_from_subdirectory() {
        let dir = fake_repo();
        let nested = dir.path().join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();
        let probe = GitProbe::discover(&nested).unwrap();
        assert_eq!(
            probe.repo_root().canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn discover_fails_outside_a_repository() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            GitProbe::discover(dir.path()),
            Err(ScmError::NotARepository)
        ));
    }

    #[test]
    fn missing_commit_editmsg_reads_as_empty() {
        let dir = fake_repo();
        let probe = GitProbe::discover(dir.path()).unwrap();
        assert_eq!(probe.staged_commit_message().unwrap(), "");
    }

    #[test]
    fn commit_message_strips_comment_lines_and_whitespace() {
        let dir = fake_repo();
        fs::write(
            dir.path().join(".git").join("COMMIT_EDITMSG"),
            "feat: add parser\n\n# Please enter the commit message\n#\n",
        )
        .unwrap();
        let probe = GitProbe::discover(dir.path()).unwrap();
        assert_eq!(probe.staged_commit_message().unwrap(), "feat: add parser");
    }
}
