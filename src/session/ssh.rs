//! Sessions driven by the system `ssh` client.

use super::{feed, pump, quote, runtime, transport_failure, Auth, CommandResult, Connector};
use super::{GitTransport, Session};
use crate::config::Config;
use crate::credential::Credential;
use crate::error::{Error, Result};
use anyhow::Context;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

/// The environment variable through which the askpass helper receives the password.
const ASKPASS_SECRET_VAR: &str = "NIXPLOY_ASKPASS_SECRET";

/// Prints the password to `ssh`. Runs in place of an interactive prompt.
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$NIXPLOY_ASKPASS_SECRET\"\n";

/// The production [Connector].
///
/// All connections go to `root@<address>`. Host keys are checked against nixploy's own
/// known-hosts file, which the bootstrap step fills in, rather than the operator's
/// `~/.ssh/known_hosts`.
#[derive(Debug)]
pub struct SshConnector {
    /// Generated client configuration passed to every `ssh` invocation with `-F`.
    ssh_config: PathBuf,
    known_hosts: PathBuf,
    connect_timeout: Duration,
}

impl SshConnector {
    /// Writes the generated `ssh_config` into the state directory and returns a connector that
    /// uses it.
    pub fn new(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.state_dir).with_context(|| {
            format!(
                "failed to create state directory {}",
                config.state_dir.display(),
            )
        })?;

        let known_hosts = config.known_hosts_path();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&known_hosts)
            .with_context(|| format!("failed to open {}", known_hosts.display()))?;

        let ssh_config = config.state_dir.join("ssh_config");
        fs::write(&ssh_config, render_ssh_config(&known_hosts))
            .with_context(|| format!("failed to write {}", ssh_config.display()))?;

        Ok(SshConnector {
            ssh_config,
            known_hosts,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        })
    }

    pub fn known_hosts(&self) -> &Path {
        &self.known_hosts
    }

    /// Arguments common to every `ssh` invocation for `auth`, not including the destination.
    fn args(&self, auth: &Auth<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-F".into(),
            self.ssh_config.clone().into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()).into(),
        ];

        let options: &[&str] = match auth {
            Auth::Installer { .. } => &[
                "StrictHostKeyChecking=no",
                "UserKnownHostsFile=/dev/null",
                "PubkeyAuthentication=no",
                "PreferredAuthentications=keyboard-interactive,password",
                "NumberOfPasswordPrompts=1",
            ],
            Auth::Password { .. } => &[
                "PubkeyAuthentication=no",
                "PreferredAuthentications=keyboard-interactive,password",
                "NumberOfPasswordPrompts=1",
            ],
            Auth::Key(credential) => {
                args.push("-i".into());
                args.push(credential.private_key().into());
                &[
                    "IdentitiesOnly=yes",
                    "BatchMode=yes",
                    "PasswordAuthentication=no",
                    "KbdInteractiveAuthentication=no",
                ]
            }
        };
        for option in options {
            args.push("-o".into());
            args.push((*option).into());
        }
        args
    }
}

impl Connector for SshConnector {
    fn connect(&mut self, address: &str, auth: Auth<'_>) -> Result<Box<dyn Session>> {
        info!(address, auth = auth.describe(), "connecting");

        #[cfg(feature = "openssh")]
        if let Auth::Key(credential) = auth {
            let session = super::mux::MuxSession::connect(
                address,
                credential,
                &self.ssh_config,
                self.connect_timeout,
            )?;
            return Ok(Box::new(session));
        }

        let askpass = match auth {
            Auth::Installer { password } | Auth::Password { password } => {
                Some(Askpass::new(password)?)
            }
            Auth::Key(_) => None,
        };
        let mut session = ProcessSession {
            runtime: runtime()?,
            address: address.to_owned(),
            args: self.args(&auth),
            askpass,
        };

        // `ssh` only authenticates once a command runs, so run a trivial one to surface
        // connection and authentication errors here rather than in the middle of a step.
        let probe = session.query("true")?;
        if !probe.success() {
            return Err(Error::Connection {
                address: address.to_owned(),
                message: format!("connection probe exited with {}", probe.status_text()),
                partial: Some(probe),
            });
        }
        Ok(Box::new(session))
    }

    fn git_transport(
        &self,
        address: &str,
        remote_path: &str,
        credential: &Credential,
    ) -> Result<GitTransport> {
        let host = if address.contains(':') {
            format!("[{address}]")
        } else {
            address.to_owned()
        };

        let mut words = vec!["ssh".to_owned()];
        for arg in self.args(&Auth::Key(credential)) {
            let arg = arg
                .into_string()
                .map_err(|arg| anyhow::anyhow!("ssh argument is not UTF-8: {arg:?}"))?;
            words.push(quote(&arg)?);
        }

        Ok(GitTransport {
            url: format!("ssh://root@{host}{remote_path}"),
            ssh_command: Some(words.join(" ")),
        })
    }
}

/// Opens an interactive, key-authenticated shell on `address`, handing the terminal to `ssh`.
pub fn interactive_shell(
    connector: &SshConnector,
    address: &str,
    credential: &Credential,
) -> Result<ExitStatus> {
    let status = std::process::Command::new("ssh")
        .args(connector.args(&Auth::Key(credential)))
        .arg(format!("root@{address}"))
        .status()
        .context("failed to start ssh")?;
    Ok(status)
}

/// Renders the client configuration shared by all sessions.
fn render_ssh_config(known_hosts: &Path) -> String {
    format!(
        "# Generated by nixploy. Rewritten on every run.\n\
        Host *\n    \
            User root\n    \
            UserKnownHostsFile \"{}\"\n    \
            StrictHostKeyChecking yes\n    \
            ServerAliveInterval 15\n    \
            LogLevel ERROR\n",
        known_hosts.display(),
    )
}

/// Supplies a password to `ssh` through `SSH_ASKPASS`, keeping it out of argv.
struct Askpass {
    /// Holds the helper script. Removed on drop.
    _dir: TempDir,
    script: PathBuf,
    secret: String,
}

impl Askpass {
    fn new(secret: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("nixploy-askpass")
            .tempdir()
            .context("failed to create askpass directory")?;
        let script = dir.path().join("askpass");

        // Write and close the file before it is ever executed.
        fs::write(&script, ASKPASS_SCRIPT).context("failed to write askpass helper")?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o700))
            .context("failed to set askpass helper mode")?;

        Ok(Askpass {
            _dir: dir,
            script,
            secret: secret.to_owned(),
        })
    }
}

/// A [Session] that runs each command in a fresh `ssh` process.
struct ProcessSession {
    runtime: tokio::runtime::Runtime,
    address: String,
    args: Vec<OsString>,
    askpass: Option<Askpass>,
}

impl Session for ProcessSession {
    fn address(&self) -> &str {
        &self.address
    }

    fn exec(&mut self, command: &str, input: Option<&[u8]>, echo: bool) -> Result<CommandResult> {
        debug!(address = %self.address, command, "running remote command");

        let mut ssh = Command::new("ssh");
        ssh.args(&self.args)
            .arg(format!("root@{}", self.address))
            .arg("--")
            .arg(command)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(askpass) = &self.askpass {
            ssh.env("SSH_ASKPASS", &askpass.script)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", ":0")
                .env(ASKPASS_SECRET_VAR, &askpass.secret);
        }

        let (status, fed, stdout, stderr) = self
            .runtime
            .block_on(async {
                let mut child = ssh.spawn()?;
                let (fed, stdout, stderr) = tokio::join!(
                    feed(child.stdin.take(), input),
                    pump(child.stdout.take(), echo.then(io::stdout)),
                    pump(child.stderr.take(), echo.then(io::stderr)),
                );
                let status = child.wait().await?;
                Ok::<_, io::Error>((status, fed, stdout, stderr))
            })
            .context("failed to run ssh")?;

        let result = CommandResult::new(status.code(), stdout?, stderr?, echo);
        if result.exit_code == Some(255) {
            return Err(transport_failure(&self.address, result));
        }
        if let Err(error) = fed {
            return Err(Error::Connection {
                address: self.address.clone(),
                message: format!("failed to send input: {error}"),
                partial: Some(result),
            });
        }
        Ok(result)
    }
}
