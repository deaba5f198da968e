//! The error taxonomy shared by every lifecycle operation.

use crate::session::CommandResult;
use crate::state::Stage;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can abort a command.
///
/// No variant is ever swallowed: each one aborts the current command and leaves the host record at
/// its last confirmed stage. Variants that stem from a remote command carry the full
/// [CommandResult] so the operator can diagnose the failure without logging in.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The host could not be reached, or the transport dropped mid-command. Retryable.
    #[error("could not reach {address}: {message}")]
    Connection {
        address: String,
        message: String,

        /// Whatever the remote command produced before the transport failed, if a command was
        /// running. Remote side effects of that command are not rolled back.
        partial: Option<CommandResult>,
    },

    /// The remote host rejected the credential.
    #[error("authentication to {address} failed: {message}")]
    Authentication { address: String, message: String },

    /// The operation is out of lifecycle order.
    #[error("cannot {operation} {address}: host is {stage}; {hint}")]
    StateConflict {
        address: String,
        operation: &'static str,
        stage: Stage,
        hint: String,
    },

    /// A step of the installer sequence failed. The host is in an undefined state.
    #[error("bootstrap step `{step}` failed with {}", output.status_text())]
    InstallFailure { step: String, output: CommandResult },

    /// The remote build/switch rejected the push.
    #[error("remote build/switch failed; the pushed commit was not accepted")]
    BuildFailure { output: CommandResult },

    /// Any other remote command that exited unsuccessfully.
    #[error("remote command failed with {}: {command}", output.status_text())]
    RemoteCommand {
        command: String,
        output: CommandResult,
    },

    /// Writing a file on the remote host failed.
    #[error("could not write {remote_path} on the remote host ({})", output.status_text())]
    Transfer {
        remote_path: String,
        output: CommandResult,
    },

    /// Key-based login could not be confirmed. Password login was left in place.
    #[error(
        "key-based login to {address} could not be confirmed ({message}); \
        password login is still enabled"
    )]
    KeyVerification { address: String, message: String },

    /// The local working tree has changes that a push would not include.
    #[error("the working tree has uncommitted changes:\n{}", paths.join("\n"))]
    DirtyTree { paths: Vec<String> },

    /// Operator input that can never succeed, e.g. a malformed host name.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// A local tool (git, ssh-keygen, ...) or file failed.
    #[error(transparent)]
    Local(#[from] anyhow::Error),
}

impl Error {
    /// The remote output attached to this error, if any.
    pub fn output(&self) -> Option<&CommandResult> {
        use Error::*;
        match self {
            Connection { partial, .. } => partial.as_ref(),
            InstallFailure { output, .. }
            | BuildFailure { output }
            | RemoteCommand { output, .. }
            | Transfer { output, .. } => Some(output),
            _ => None,
        }
    }

    /// The process exit status that the command-line interface reports for this error.
    pub fn exit_code(&self) -> u8 {
        use Error::*;
        match self {
            InvalidInput(_) => 2,
            Connection { .. } => 3,
            Authentication { .. } => 4,
            InstallFailure { .. }
            | BuildFailure { .. }
            | RemoteCommand { .. }
            | Transfer { .. } => 5,
            StateConflict { .. } => 6,
            KeyVerification { .. } => 7,
            DirtyTree { .. } => 8,
            Io(_) | Local(_) => 1,
        }
    }
}
