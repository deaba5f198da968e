//! Per-host deployment state.
//!
//! Each host has one [HostRecord], stored as YAML under `<state_dir>/hosts/`. A command reads the
//! record once at the start and writes it once after its transition succeeds, so a crash or an
//! error never advances a host speculatively.

use crate::error::{Error, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The lifecycle stages, in order.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Nothing has been done to the host, or it is booted into the installer.
    #[default]
    Fresh,
    /// Installed and rebooted; reachable with the root password.
    Bootstrapped,
    /// Reachable with the login key; password login retired.
    KeyInstalled,
    /// The bare repository and receive hook exist.
    RepoCreated,
    /// At least one push has been built and activated.
    Deployed,
}

impl Stage {
    /// The command that moves a host out of this stage.
    pub fn next_command(self) -> &'static str {
        match self {
            Stage::Fresh => "bootstrap",
            Stage::Bootstrapped => "store-key",
            Stage::KeyInstalled => "create",
            Stage::RepoCreated | Stage::Deployed => "deploy",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Fresh => "fresh",
            Stage::Bootstrapped => "bootstrapped",
            Stage::KeyInstalled => "key-installed",
            Stage::RepoCreated => "repo-created",
            Stage::Deployed => "deployed",
        })
    }
}

/// Everything remembered about one host between invocations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostRecord {
    pub address: String,
    pub hostname: Option<String>,
    pub stage: Stage,

    /// Set once a bootstrap has started touching the disk, cleared when it completes. While set,
    /// the host is in an unknown state and only a forced bootstrap may proceed.
    pub bootstrap_pending: bool,

    /// The root password set during bootstrap. Kept only until key exchange retires password
    /// login. The record file is readable by the owner only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_password: Option<String>,

    /// The host's public identity key as `<type> <base64>`.
    pub host_key: Option<String>,

    /// The name of the local git remote that points at this host.
    pub git_remote: Option<String>,

    /// The flake's directory relative to the repository root, as it was when the hook was
    /// installed. Empty for the root itself.
    pub flake_dir: Option<String>,

    pub deployed_commit: Option<String>,

    /// When the record last changed stage.
    pub updated: Option<DateTime<Utc>>,
}

impl HostRecord {
    pub fn new(address: &str) -> Self {
        HostRecord {
            address: address.to_owned(),
            ..HostRecord::default()
        }
    }

    /// Checks that the host has reached at least `min` before running `operation`.
    pub fn require(&self, operation: &'static str, min: Stage) -> Result<()> {
        if self.stage >= min {
            return Ok(());
        }
        let hint = if self.stage == Stage::Fresh && self.bootstrap_pending {
            "a previous bootstrap did not finish; run `bootstrap --force` to start over".to_owned()
        } else {
            format!("run `{}` first", self.stage.next_command())
        };
        Err(Error::StateConflict {
            address: self.address.clone(),
            operation,
            stage: self.stage,
            hint,
        })
    }

    /// Moves the record to `to`. Never moves it backwards.
    pub fn advance(&mut self, to: Stage) {
        if to > self.stage {
            self.stage = to;
        }
        self.updated = Some(Utc::now());
    }
}

/// The directory of host records.
#[derive(Clone, Debug)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        StateStore { dir: dir.into() }
    }

    /// The record file for `address`.
    pub fn path(&self, address: &str) -> PathBuf {
        let name: String = address
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        self.dir.join(format!("{name}.yaml"))
    }

    /// Reads the record for `address`. A host without a record is [Stage::Fresh].
    pub fn load(&self, address: &str) -> Result<HostRecord> {
        let path = self.path(address);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(HostRecord::new(address))
            }
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read {}", path.display()))
                    .into())
            }
        };
        let mut record: HostRecord = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse host record {}", path.display()))?;
        record.address = address.to_owned();
        Ok(record)
    }

    /// Writes `record` atomically: readers see either the old record or the new one, never a
    /// partial file.
    pub fn save(&self, record: &HostRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.path(&record.address);
        let contents = serde_yaml::to_string(record).context("failed to serialize host record")?;

        let mut file = tempfile::NamedTempFile::new_in(&self.dir).with_context(|| {
            format!("failed to create a temporary file in {}", self.dir.display())
        })?;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))
            .context("failed to restrict host record permissions")?;
        file.write_all(contents.as_bytes())?;
        file.as_file().sync_all()?;
        file.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("failed to write {}", path.display()))?;

        debug!(path = %path.display(), stage = %record.stage, "saved host record");
        Ok(())
    }
}

/// Reads every record in `dir`, sorted by address.
pub fn list(dir: &Path) -> Result<Vec<HostRecord>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let record: HostRecord = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse host record {}", path.display()))?;
        records.push(record);
    }
    records.sort_by(|a, b| a.address.cmp(&b.address));
    Ok(records)
}
