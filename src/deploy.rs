//! Pushes committed history to a host and reports what its receive hook did.

use crate::activate::Activator;
use crate::error::{Error, Result};
use crate::git::LocalRepo;
use crate::session::{quote, CommandResult, GitTransport, Session};
use tracing::info;

/// The result of a successful push.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeployOutcome {
    /// The commit that the host now runs.
    pub commit: String,

    /// The remote already had this commit, so the hook did not run.
    pub up_to_date: bool,

    /// git's output, including everything the hook printed.
    pub output: CommandResult,

    /// Activation was run again over a separate session because the push was up to date.
    pub reactivated: bool,
}

/// Pushes HEAD to `deploy_ref` on `remote`. The hook builds and activates the commit as part of
/// the push.
///
/// The working tree must be clean; check with [LocalRepo::require_clean] before connecting.
pub fn push(
    repo: &LocalRepo,
    address: &str,
    remote: &str,
    deploy_ref: &str,
    transport: &GitTransport,
) -> Result<DeployOutcome> {
    let commit = repo.head()?;
    info!(address, %commit, "pushing");

    let output = repo.push(
        remote,
        &format!("HEAD:{deploy_ref}"),
        transport.ssh_command.as_deref(),
    )?;
    if !output.success() {
        return Err(push_failure(address, output));
    }

    let up_to_date = output.stdout.lines().any(|line| line.starts_with("=\t"));
    Ok(DeployOutcome {
        commit,
        up_to_date,
        output,
        reactivated: false,
    })
}

/// Classifies a failed `git push --porcelain`.
fn push_failure(address: &str, output: CommandResult) -> Error {
    if output.stdout.contains("[remote rejected]") {
        return Error::BuildFailure { output };
    }
    if output.stderr.contains("Permission denied") {
        return Error::Authentication {
            address: address.to_owned(),
            message: "git could not authenticate with the login key".to_owned(),
        };
    }
    if output.stderr.contains("Could not read from remote repository") {
        let message = output
            .stderr
            .lines()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("git could not reach the remote repository")
            .trim()
            .to_owned();
        return Error::Connection {
            address: address.to_owned(),
            message,
            partial: Some(output),
        };
    }
    Error::RemoteCommand {
        command: "git push".to_owned(),
        output,
    }
}

/// Runs activation again against the tree in `working_dir`, for deploys where the push had nothing
/// to send.
pub fn reactivate(
    session: &mut dyn Session,
    working_dir: &str,
    flake_dir: &str,
    flake_attr: &str,
    activator: &dyn Activator,
) -> Result<CommandResult> {
    let tree = if flake_dir.is_empty() {
        working_dir.to_owned()
    } else {
        format!("{}/{flake_dir}", working_dir.trim_end_matches('/'))
    };
    let command = format!(
        "set -eu\ntree={}\ncd \"$tree\"\n{}",
        quote(&tree)?,
        activator.script(flake_attr),
    );

    info!(address = session.address(), %tree, "reactivating");
    let output = session.run(&command)?;
    if output.success() {
        Ok(output)
    } else {
        Err(Error::BuildFailure { output })
    }
}
