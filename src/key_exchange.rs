//! Replaces password login with the operator's key.
//!
//! The order is fixed: install the key, prove it with a new key-only session, and only then retire
//! the password. Retiring first could lock the operator out permanently.

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::session::{quote, Auth, Connector, Session};
use tracing::info;

/// Whether [authorize] had to change the remote `authorized_keys`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Authorized {
    Added,
    AlreadyPresent,
}

/// Appends `public_key` to root's `authorized_keys` unless the exact line is already there.
pub fn authorize(session: &mut dyn Session, public_key: &str) -> Result<Authorized> {
    let key = quote(public_key)?;
    let command = format!(
        "umask 077 && mkdir -p \"$HOME/.ssh\" && keys=\"$HOME/.ssh/authorized_keys\" && \
        touch \"$keys\" && \
        if grep -qxF -- {key} \"$keys\"; then echo present; \
        else {{ [ -z \"$(tail -c 1 \"$keys\")\" ] || echo; printf '%s\\n' {key}; }} >> \"$keys\" \
        && echo added; fi && \
        chmod 700 \"$HOME/.ssh\" && chmod 600 \"$keys\"",
    );
    let output = session.query(&command)?.check("install login key")?;

    let authorized = match output.stdout.trim() {
        "added" => Authorized::Added,
        _ => Authorized::AlreadyPresent,
    };
    info!(address = session.address(), ?authorized, "login key authorized");
    Ok(authorized)
}

/// Opens a new session that can only authenticate with the key and runs a command over it.
///
/// Every failure, including a dropped connection, is reported as [Error::KeyVerification]: the
/// key cannot be considered working until this succeeds.
pub fn verify(
    connector: &mut dyn Connector,
    address: &str,
    credential: &Credential,
) -> Result<Box<dyn Session>> {
    let failure = |message: String| Error::KeyVerification {
        address: address.to_owned(),
        message,
    };

    let mut session = connector
        .connect(address, Auth::Key(credential))
        .map_err(|e| failure(e.to_string()))?;
    let output = session
        .query("true")
        .map_err(|e| failure(e.to_string()))?;
    if !output.success() {
        return Err(failure(format!(
            "test command exited with {}",
            output.status_text(),
        )));
    }

    info!(address, "key-based login confirmed");
    Ok(session)
}

/// Locks root's password so that only the key can log in, and confirms the lock took effect.
pub fn retire_password(session: &mut dyn Session) -> Result<()> {
    session
        .query("usermod -p '*' root")?
        .check("usermod -p '*' root")?;

    // Compare on the remote side so the hash never crosses the wire.
    let command = "test \"$(getent shadow root | cut -d: -f2)\" = '*'";
    session.query(command)?.check(command)?;

    info!(address = session.address(), "root password retired");
    Ok(())
}
