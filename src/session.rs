//! Remote shell sessions.
//!
//! Every lifecycle operation talks to the remote host through a [Session] opened by a
//! [Connector]. The production connector is [SshConnector], which drives the system `ssh` client
//! and, with the `openssh` feature, a multiplexed [openssh] session for key-based logins. Tests
//! substitute the fakes in `crate::testing`.
//!
//! Sessions are blocking. Internally, each one owns a current-thread Tokio runtime so that stdout
//! and stderr of a long-running remote command can be relayed to the operator while they are being
//! captured.

use crate::credential::Credential;
use crate::error::{Error, Result};
use anyhow::{anyhow, Context};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[cfg(feature = "openssh")]
mod mux;
mod ssh;

pub use ssh::{interactive_shell, SshConnector};

/// The exit status and captured output of one remote command. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandResult {
    /// The exit code, or `None` if the command was killed by a signal or never finished.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,

    /// Whether stdout and stderr were already relayed to the operator as they arrived.
    pub echoed: bool,
}

impl CommandResult {
    pub fn new(exit_code: Option<i32>, stdout: Vec<u8>, stderr: Vec<u8>, echoed: bool) -> Self {
        CommandResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            echoed,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// A short human-readable description of the exit status.
    pub fn status_text(&self) -> String {
        match self.exit_code {
            Some(i) => format!("exit code {i}"),
            None => "no exit code".to_string(),
        }
    }

    /// Turns an unsuccessful result into [Error::RemoteCommand].
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::RemoteCommand {
                command: command.to_owned(),
                output: self,
            })
        }
    }
}

/// How to authenticate a new [Session].
#[derive(Clone, Copy, Debug)]
pub enum Auth<'a> {
    /// The live installer's temporary root password. The installer's host key is not checked,
    /// because it is regenerated on every boot of the installer image.
    Installer { password: &'a str },

    /// The installed system's root password. The host key must match the recorded identity.
    Password { password: &'a str },

    /// The [Credential]'s private key. The host key must match the recorded identity.
    Key(&'a Credential),
}

impl Auth<'_> {
    /// A name for log output. Never includes secrets.
    pub fn describe(&self) -> &'static str {
        match self {
            Auth::Installer { .. } => "installer password",
            Auth::Password { .. } => "root password",
            Auth::Key(_) => "key",
        }
    }
}

/// One authenticated connection to a remote host.
///
/// Every command may mutate remote state irreversibly. Nothing is rolled back when a command or
/// the connection fails.
pub trait Session {
    /// The address this session is connected to.
    fn address(&self) -> &str;

    /// Runs `command` through the remote user's shell and waits for it to finish.
    ///
    /// `input`, if any, is written to the command's stdin, which is then closed. If `echo` is set,
    /// stdout and stderr are relayed to the operator as they arrive.
    ///
    /// A non-zero exit status is not an error here; callers decide what failure means. Transport
    /// failures are returned as [Error::Connection] (with whatever output arrived before the
    /// failure) or [Error::Authentication].
    fn exec(&mut self, command: &str, input: Option<&[u8]>, echo: bool) -> Result<CommandResult>;

    /// Runs `command`, relaying its output to the operator.
    fn run(&mut self, command: &str) -> Result<CommandResult> {
        self.exec(command, None, true)
    }

    /// Runs `command` silently, e.g. to read a file.
    fn query(&mut self, command: &str) -> Result<CommandResult> {
        self.exec(command, None, false)
    }

    /// Copies a local file to `remote_path` and sets its mode.
    fn put_file(&mut self, local_path: &Path, remote_path: &str, mode: u32) -> Result<()> {
        let contents = fs::read(local_path)
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        self.put_bytes(&contents, remote_path, mode)
    }

    /// Writes `contents` to `remote_path` and sets its mode. Overwrites any existing file.
    fn put_bytes(&mut self, contents: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let path = quote(remote_path)?;
        let command = format!("umask 077 && cat > {path} && chmod {mode:o} {path}");
        let output = self.exec(&command, Some(contents), false)?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Transfer {
                remote_path: remote_path.to_owned(),
                output,
            })
        }
    }
}

/// Where and how `git` reaches a host's remote repository.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitTransport {
    /// The URL to store as the local repository's remote.
    pub url: String,

    /// The value for `GIT_SSH_COMMAND`, if git needs one to authenticate.
    pub ssh_command: Option<String>,
}

/// Opens [Session]s to remote hosts.
pub trait Connector {
    /// Connects to `address` as root.
    fn connect(&mut self, address: &str, auth: Auth<'_>) -> Result<Box<dyn Session>>;

    /// Describes how git should push to the repository at `remote_path` on `address`.
    ///
    /// Does not touch the network.
    fn git_transport(
        &self,
        address: &str,
        remote_path: &str,
        credential: &Credential,
    ) -> Result<GitTransport>;
}

/// Quotes one word for a POSIX shell.
pub fn quote(word: &str) -> Result<String> {
    Ok(shlex::try_quote(word)
        .map_err(|e| anyhow!("cannot quote {word:?} for the remote shell: {e}"))?
        .into_owned())
}

/// Classifies a result from the `ssh` client that exited with status 255.
///
/// OpenSSH reserves 255 for its own failures, so a remote command that itself exits with 255 is
/// indistinguishable from a dropped connection and is reported as one.
pub(crate) fn transport_failure(address: &str, result: CommandResult) -> Error {
    let message = result
        .stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("ssh exited with status 255")
        .trim()
        .to_owned();
    if result.stderr.contains("Permission denied") {
        Error::Authentication {
            address: address.to_owned(),
            message,
        }
    } else {
        Error::Connection {
            address: address.to_owned(),
            message,
            partial: Some(result),
        }
    }
}

/// Builds the current-thread runtime that a blocking session uses to drive async I/O.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

/// Reads `reader` to the end, optionally copying each chunk to `echo` as it arrives.
pub(crate) async fn pump<R, W>(reader: Option<R>, mut echo: Option<W>) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
    W: Write,
{
    let mut captured = Vec::new();
    let Some(mut reader) = reader else {
        return Ok(captured);
    };

    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        if let Some(echo) = echo.as_mut() {
            echo.write_all(&buffer[..n])?;
            echo.flush()?;
        }
        captured.extend_from_slice(&buffer[..n]);
    }
    Ok(captured)
}

/// Writes `input` to `writer` and closes it.
pub(crate) async fn feed<W>(writer: Option<W>, input: Option<&[u8]>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let (Some(mut writer), Some(input)) = (writer, input) {
        writer.write_all(input).await?;
        writer.shutdown().await?;
    }
    Ok(())
}

#[cfg(test)]
mod test;
