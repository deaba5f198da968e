//! Utilities for running programs on the operator's machine, e.g. `git` and `ssh-keygen`.

use crate::session::{feed, pump, runtime, CommandResult};
use anyhow::{bail, Context};
use shlex::Quoter;
use std::ffi::OsStr;
use std::io;
use std::process::{Command, Stdio};

/// Renders a command and its arguments for error output.
///
/// There is no canonical representation to apply here. We just want to make a best effort to
/// indicate to the user what went wrong.
fn describe(program: &OsStr, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> String {
    let mut components = vec![program.to_string_lossy().to_string()];
    components.extend(
        args.into_iter()
            .map(|a| a.as_ref().to_string_lossy().to_string()),
    );

    // Try to use shlex to properly quote the string. If that fails, naively join with spaces.
    match Quoter::new().join(components.iter().map(|s| &s[..])) {
        Ok(s) => s,
        Err(_) => components.join(" "),
    }
}

/// Runs a command as a new process and waits for it to complete.
///
/// Standard input, output, and error are inherited from the parent process.
///
/// # Errors
///
/// Returns an error if the command cannot be run for any reason or exits with an error.
pub fn run<C: AsRef<OsStr>, A: AsRef<OsStr>>(cmd: C, args: &[A]) -> anyhow::Result<()> {
    let command = || describe(cmd.as_ref(), args);

    let status = Command::new(&cmd)
        .args(args)
        .status()
        .with_context(|| format!("failed to start command: {}", command()))?;

    if !status.success() {
        let error = match status.code() {
            Some(i) => format!("exit code {i}"),
            None => "error".to_string(),
        };
        bail!("command exited with {error}: {}", command());
    }
    Ok(())
}

/// Runs a prepared command and returns its stdout with trailing white space removed.
///
/// # Errors
///
/// Returns an error, including the command's stderr, if the command cannot be run or exits with
/// an error.
pub fn capture(command: &mut Command) -> anyhow::Result<String> {
    let description = describe(command.get_program(), command.get_args());
    let output = command
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to start command: {description}"))?;

    if !output.status.success() {
        let error = match output.status.code() {
            Some(i) => format!("exit code {i}"),
            None => "error".to_string(),
        };
        bail!(
            "command exited with {error}: {description}\n{}",
            String::from_utf8_lossy(&output.stderr).trim_end(),
        );
    }

    let mut stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("command returned output that was not UTF-8: {description}"))?;
    stdout.truncate(stdout.trim_end().len());
    Ok(stdout)
}

/// Runs a prepared command, relaying its output to the operator while capturing it.
///
/// Unlike [capture], an unsuccessful exit status is not an error; the caller inspects the
/// returned [CommandResult].
pub fn stream(command: &mut tokio::process::Command) -> anyhow::Result<CommandResult> {
    let description = {
        let std = command.as_std();
        describe(std.get_program(), std.get_args())
    };
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let runtime = runtime()?;
    let (status, stdout, stderr) = runtime
        .block_on(async {
            let mut child = command.spawn()?;
            let (fed, stdout, stderr) = tokio::join!(
                feed(child.stdin.take(), None),
                pump(child.stdout.take(), Some(io::stdout())),
                pump(child.stderr.take(), Some(io::stderr())),
            );
            fed?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((status, stdout?, stderr?))
        })
        .with_context(|| format!("failed to run command: {description}"))?;

    Ok(CommandResult::new(status.code(), stdout, stderr, true))
}
