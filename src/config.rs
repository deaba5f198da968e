use crate::activate::Activation;
use crate::bootstrap::DiskLayout;
use crate::error::{Error, Result};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// The name of the optional configuration file inside the state directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Operator settings. Every field has a default, so the file is optional and may be partial.
///
/// Example `config.yaml`:
///
/// ```yaml
/// key_file: /home/me/.ssh/nixploy
/// deploy_branch: main
/// disk:
///   device: /dev/nvme0n1
///   swap_gib: 16
/// activation:
///   nixos-rebuild: boot
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Where host records, the known-hosts file, and the generated ssh configuration live. Not
    /// read from the file; it is where the file is found.
    #[serde(skip)]
    pub state_dir: PathBuf,

    /// The private key of the credential. Defaults to `~/.ssh/nixploy`.
    pub key_file: Option<PathBuf>,

    /// The directory on the remote host that holds the bare repository and the working dir.
    pub remote_root: String,

    /// The only branch that the remote repository accepts.
    pub deploy_branch: String,

    pub disk: DiskLayout,

    /// How the remote hook builds and activates a pushed tree.
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub activation: Activation,

    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            state_dir: PathBuf::new(),
            key_file: None,
            remote_root: "/etc/nixploy".to_owned(),
            deploy_branch: "main".to_owned(),
            disk: DiskLayout::default(),
            activation: Activation::default(),
            connect_timeout_secs: 10,
        }
    }
}

impl Config {
    /// Reads `config.yaml` from `state_dir`, falling back to defaults if it does not exist.
    pub fn load(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(CONFIG_FILE);
        let mut config = match fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str::<Config>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("failed to read {}", path.display()))
                    .into())
            }
        };
        config.state_dir = state_dir.to_owned();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.remote_root.starts_with('/') {
            return Err(Error::InvalidInput(format!(
                "remote_root must be an absolute path, not {:?}",
                self.remote_root,
            )));
        }
        if self.deploy_branch.is_empty()
            || self.deploy_branch.starts_with('-')
            || self.deploy_branch.contains(char::is_whitespace)
        {
            return Err(Error::InvalidInput(format!(
                "deploy_branch is not a usable branch name: {:?}",
                self.deploy_branch,
            )));
        }
        self.disk.validate()
    }

    /// The credential's private key.
    pub fn key_path(&self) -> Result<PathBuf> {
        match &self.key_file {
            Some(path) => Ok(path.clone()),
            None => {
                let mut path = home_dir()?;
                path.push(".ssh");
                path.push("nixploy");
                Ok(path)
            }
        }
    }

    /// The known-hosts file that holds the host identities recorded during bootstrap.
    pub fn known_hosts_path(&self) -> PathBuf {
        self.state_dir.join("known_hosts")
    }

    /// The directory of per-host records.
    pub fn hosts_dir(&self) -> PathBuf {
        self.state_dir.join("hosts")
    }

    /// The remote bare repository.
    pub fn bare_repo(&self) -> String {
        format!("{}/bare", self.remote_root.trim_end_matches('/'))
    }

    /// The remote directory that holds the last activated tree.
    pub fn working_dir(&self) -> String {
        format!("{}/working-dir", self.remote_root.trim_end_matches('/'))
    }

    /// The ref that deploys push to.
    pub fn deploy_ref(&self) -> String {
        format!("refs/heads/{}", self.deploy_branch)
    }
}

/// Returns the default state directory, `~/.config/nixploy`.
pub fn default_state_dir() -> Result<PathBuf> {
    let mut path = home_dir()?;
    path.push(".config");
    path.push("nixploy");
    Ok(path)
}

fn home_dir() -> Result<PathBuf> {
    Ok(home::home_dir().ok_or_else(|| anyhow!("could not determine the home directory"))?)
}
