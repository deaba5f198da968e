//! The operator's login key pair.
//!
//! One key pair authenticates every host after key exchange. It is generated once per local
//! environment and never replaced. Only the public half ever leaves the machine.

use crate::error::{Error, Result};
use crate::local;
use anyhow::Context;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// The comment embedded in generated keys.
const KEY_COMMENT: &str = "nixploy";

/// Whether [Credential::ensure] found or created the key pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyOrigin {
    Existing,
    Generated,
}

/// An ed25519 key pair on disk, identified by the path of its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    private_key: PathBuf,
}

impl Credential {
    pub fn new(private_key: impl Into<PathBuf>) -> Self {
        Credential {
            private_key: private_key.into(),
        }
    }

    pub fn private_key(&self) -> &Path {
        &self.private_key
    }

    /// The public key's path: the private key's path plus `.pub`.
    pub fn public_key_path(&self) -> PathBuf {
        let mut key_path: OsString = self.private_key.clone().into();
        key_path.push(".pub");
        key_path.into()
    }

    /// Generates the key pair unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if only one half of the pair exists. There is no sensible way to proceed:
    /// regenerating would orphan every host that trusts the existing key.
    pub fn ensure(&self) -> Result<KeyOrigin> {
        let public_key = self.public_key_path();
        let private_exists = path_exists(&self.private_key)?;
        let public_exists = path_exists(&public_key)?;

        if private_exists ^ public_exists {
            return Err(anyhow::anyhow!(
                "found one half of the login key pair:\n\
                {} (present: {})\n\
                {} (present: {})\n\
                \n\
                Please either install the missing file or remove the existing file.",
                self.private_key.display(),
                private_exists,
                public_key.display(),
                public_exists,
            )
            .into());
        }
        if private_exists {
            return Ok(KeyOrigin::Existing);
        }

        if let Some(dir) = self.private_key.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        info!(path = %self.private_key.display(), "generating login key pair");
        local::run(
            "ssh-keygen",
            &[
                OsStr::new("-q"),
                OsStr::new("-t"),
                OsStr::new("ed25519"),
                OsStr::new("-N"),
                OsStr::new(""),
                OsStr::new("-C"),
                OsStr::new(KEY_COMMENT),
                OsStr::new("-f"),
                self.private_key.as_os_str(),
            ],
        )?;
        Ok(KeyOrigin::Generated)
    }

    /// Reads the public key as a single `authorized_keys` line, without the trailing newline.
    pub fn public_key(&self) -> Result<String> {
        let path = self.public_key_path();
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read public key {}", path.display()))?;
        let line = contents.trim();

        let mut fields = line.split_whitespace();
        let valid = matches!(
            (fields.next(), fields.next()),
            (Some(kind), Some(_)) if kind.starts_with("ssh-") || kind.starts_with("ecdsa-"),
        );
        if !valid || line.contains('\n') {
            return Err(Error::InvalidInput(format!(
                "{} does not contain exactly one public key",
                path.display(),
            )));
        }
        Ok(line.to_owned())
    }
}

fn path_exists(path: &Path) -> Result<bool> {
    Ok(path
        .try_exists()
        .with_context(|| format!("could not determine whether {} exists", path.display()))?)
}

#[cfg(test)]
mod test;
