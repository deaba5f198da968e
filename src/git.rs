//! The operator's local git repository.

use crate::error::{Error, Result};
use crate::local;
use crate::session::CommandResult;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// A local repository and the directory inside it that holds the flake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalRepo {
    root: PathBuf,

    /// The flake's directory relative to `root`. Empty for the root itself.
    flake_dir: PathBuf,
}

impl LocalRepo {
    /// Finds the repository that contains `dir`. `dir` is taken to be the flake's directory.
    pub fn discover(dir: &Path) -> Result<Self> {
        let dir = dir
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", dir.display()))?;
        let root = local::capture(
            Command::new("git")
                .arg("-C")
                .arg(&dir)
                .args(["rev-parse", "--show-toplevel"]),
        )
        .with_context(|| format!("{} is not inside a git repository", dir.display()))?;
        let root = PathBuf::from(root)
            .canonicalize()
            .context("failed to resolve the repository root")?;

        let flake_dir = dir
            .strip_prefix(&root)
            .map_err(|_| anyhow!("{} is not inside {}", dir.display(), root.display()))?
            .to_owned();
        Ok(LocalRepo { root, flake_dir })
    }

    /// The absolute path of the flake's directory.
    pub fn flake_root(&self) -> PathBuf {
        self.root.join(&self.flake_dir)
    }

    /// The flake's directory relative to the repository root, with `/` separators.
    pub fn flake_dir_str(&self) -> Result<String> {
        let dir = self
            .flake_dir
            .to_str()
            .ok_or_else(|| anyhow!("flake directory is not UTF-8: {}", self.flake_dir.display()))?;
        Ok(dir.to_owned())
    }

    fn git(&self) -> Command {
        let mut command = Command::new("git");
        command.arg("-C").arg(&self.root);
        command
    }

    /// Paths with changes that are not committed, including untracked files.
    pub fn dirty_paths(&self) -> Result<Vec<String>> {
        let status = local::capture(self.git().args(["status", "--porcelain"]))?;
        Ok(status
            .lines()
            .filter(|line| line.len() > 3)
            .map(|line| line[3..].to_owned())
            .collect())
    }

    /// Fails with [Error::DirtyTree] unless the working tree is clean.
    pub fn require_clean(&self) -> Result<()> {
        let paths = self.dirty_paths()?;
        if paths.is_empty() {
            Ok(())
        } else {
            Err(Error::DirtyTree { paths })
        }
    }

    /// The commit at HEAD.
    pub fn head(&self) -> Result<String> {
        Ok(local::capture(self.git().args(["rev-parse", "--verify", "HEAD^{commit}"]))
            .context("the repository has no commits")?)
    }

    /// Points the remote `name` at `url`, creating the remote if needed.
    pub fn set_remote(&self, name: &str, url: &str) -> Result<()> {
        let remotes = local::capture(self.git().arg("remote"))?;
        let verb = if remotes.lines().any(|remote| remote == name) {
            "set-url"
        } else {
            "add"
        };
        local::capture(self.git().args(["remote", verb, name, url]))?;
        info!(remote = name, url, "configured git remote");
        Ok(())
    }

    /// Pushes with `refspec`, relaying git's output, including the remote hook's, to the operator.
    pub fn push(
        &self,
        remote: &str,
        refspec: &str,
        ssh_command: Option<&str>,
    ) -> Result<CommandResult> {
        let mut command = self.async_git(ssh_command);
        command.args(["push", "--porcelain", remote, refspec]);
        Ok(local::stream(&mut command)?)
    }

    /// Fetches `branch` from `remote` and merges it, fast-forward only.
    pub fn pull(
        &self,
        remote: &str,
        branch: &str,
        ssh_command: Option<&str>,
    ) -> Result<CommandResult> {
        let mut command = self.async_git(ssh_command);
        command.args(["pull", "--ff-only", remote, branch]);
        Ok(local::stream(&mut command)?)
    }

    fn async_git(&self, ssh_command: Option<&str>) -> tokio::process::Command {
        let mut command = tokio::process::Command::new("git");
        command.arg("-C").arg(&self.root);
        if let Some(ssh_command) = ssh_command {
            command.env("GIT_SSH_COMMAND", ssh_command);
        }
        command
    }
}
