//! nixploy's own known-hosts file.
//!
//! Host identities are recorded when bootstrap generates them, so later connections are verified
//! against a key that was learned over the installer session instead of trusted on first use.

use crate::error::{Error, Result};
use anyhow::Context;
use std::fs;
use std::io;
use std::path::Path;
use tracing::info;

/// Records `key` (`<type> <base64> [comment]`) as the identity of `address`, replacing any line
/// previously recorded for it.
pub fn record(path: &Path, address: &str, key: &str) -> Result<()> {
    let mut fields = key.split_whitespace();
    let (Some(kind), Some(blob)) = (fields.next(), fields.next()) else {
        return Err(Error::InvalidInput(format!(
            "not a public host key: {key:?}"
        )));
    };

    let existing = read(path)?;
    let mut contents: String = existing
        .lines()
        .filter(|line| host_of(line) != Some(address))
        .flat_map(|line| [line, "\n"])
        .collect();
    contents.push_str(&format!("{address} {kind} {blob}\n"));

    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    info!(address, kind, "recorded host identity");
    Ok(())
}

/// Returns the key recorded for `address` as `<type> <base64>`.
pub fn lookup(path: &Path, address: &str) -> Result<Option<String>> {
    Ok(read(path)?.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() != Some(address) {
            return None;
        }
        let kind = fields.next()?;
        let blob = fields.next()?;
        Some(format!("{kind} {blob}"))
    }))
}

fn host_of(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

fn read(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("failed to read {}", path.display()))
            .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_replaces_previous_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, "192.0.2.2 ssh-ed25519 BBBB\n192.0.2.1 ssh-ed25519 OLD\n").unwrap();

        record(&path, "192.0.2.1", "ssh-ed25519 NEW root@installer\n").unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "192.0.2.2 ssh-ed25519 BBBB\n192.0.2.1 ssh-ed25519 NEW\n",
        );
        assert_eq!(
            lookup(&path, "192.0.2.1").unwrap().as_deref(),
            Some("ssh-ed25519 NEW"),
        );
        assert_eq!(lookup(&path, "192.0.2.3").unwrap(), None);
    }

    #[test]
    fn record_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        record(&path, "web1.example", "ssh-ed25519 AAAA").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "web1.example ssh-ed25519 AAAA\n");
    }

    #[test]
    fn rejects_malformed_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        assert!(matches!(
            record(&path, "192.0.2.1", "garbage"),
            Err(Error::InvalidInput(_)),
        ));
        assert!(!path.exists());
    }
}
