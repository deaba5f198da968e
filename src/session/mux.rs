//! Key-authenticated sessions over a multiplexed [openssh] master connection.
//!
//! One master connection carries every command of a lifecycle step, so repeated commands don't
//! pay for a new handshake each time.

use super::{feed, pump, runtime, CommandResult, Session};
use crate::credential::Credential;
use crate::error::{Error, Result};
use openssh::{KnownHosts, SessionBuilder, Stdio};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// An implementation of [Session] using the [openssh] crate.
pub(super) struct MuxSession {
    /// The Tokio runtime. We need this so we can run async tasks using [block_on].
    ///
    /// [block_on]: tokio::runtime::Runtime::block_on
    runtime: tokio::runtime::Runtime,

    session: openssh::Session,
    address: String,
}

impl MuxSession {
    /// Opens the master connection. Host keys are checked strictly against the known-hosts file
    /// named in `ssh_config`.
    pub(super) fn connect(
        address: &str,
        credential: &Credential,
        ssh_config: &Path,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let runtime = runtime()?;

        let mut builder = SessionBuilder::default();
        builder
            .user("root".to_owned())
            .keyfile(credential.private_key())
            .config_file(ssh_config)
            .known_hosts_check(KnownHosts::Strict)
            .connect_timeout(connect_timeout);

        let session = runtime
            .block_on(builder.connect_mux(address))
            .map_err(|error| connect_failure(address, error))?;

        Ok(MuxSession {
            runtime,
            session,
            address: address.to_owned(),
        })
    }
}

/// Maps a failed master connection to the error taxonomy.
fn connect_failure(address: &str, error: openssh::Error) -> Error {
    let message = error.to_string();
    if message.contains("Permission denied") {
        Error::Authentication {
            address: address.to_owned(),
            message,
        }
    } else {
        Error::Connection {
            address: address.to_owned(),
            message,
            partial: None,
        }
    }
}

impl Session for MuxSession {
    fn address(&self) -> &str {
        &self.address
    }

    fn exec(&mut self, command: &str, input: Option<&[u8]>, echo: bool) -> Result<CommandResult> {
        debug!(address = %self.address, command, "running remote command");

        let session = &self.session;
        let outcome = self.runtime.block_on(async {
            let mut remote = session.raw_command(command);
            remote
                .stdin(if input.is_some() {
                    Stdio::piped()
                } else {
                    Stdio::null()
                })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            let mut child = match remote.spawn().await {
                Ok(child) => child,
                Err(error) => return Err((error, None)),
            };

            let (fed, stdout, stderr) = tokio::join!(
                feed(child.stdin().take(), input),
                pump(child.stdout().take(), echo.then(io::stdout)),
                pump(child.stderr().take(), echo.then(io::stderr)),
            );
            let captured = (fed, stdout, stderr);

            match child.wait().await {
                Ok(status) => Ok((status, captured)),
                Err(error) => Err((error, Some(captured))),
            }
        });

        match outcome {
            Ok((status, (fed, stdout, stderr))) => {
                let result = CommandResult::new(status.code(), stdout?, stderr?, echo);
                if let Err(error) = fed {
                    return Err(Error::Connection {
                        address: self.address.clone(),
                        message: format!("failed to send input: {error}"),
                        partial: Some(result),
                    });
                }
                Ok(result)
            }
            Err((error, captured)) => {
                // The connection dropped. Keep whatever arrived before it did.
                let partial = captured.map(|(_, stdout, stderr)| {
                    CommandResult::new(
                        None,
                        stdout.unwrap_or_default(),
                        stderr.unwrap_or_default(),
                        echo,
                    )
                });
                Err(Error::Connection {
                    address: self.address.clone(),
                    message: error.to_string(),
                    partial,
                })
            }
        }
    }
}
