//! The deployment state machine.
//!
//! Every operation follows the same shape: load the host's record, check the transition's guard,
//! run the step, and save the advanced record. A failure anywhere returns before the save, so the
//! record always reflects the last transition that completed.
//!
//! | Operation | Guard | Result |
//! |---|---|---|
//! | [bootstrap](Deployer::bootstrap) | fresh, or forced | bootstrapped |
//! | [store_key](Deployer::store_key) | at least bootstrapped | key-installed |
//! | [create](Deployer::create) | at least key-installed | repo-created |
//! | [deploy](Deployer::deploy) | at least repo-created | deployed |

use crate::bootstrap::{Bootstrap, Host};
use crate::config::Config;
use crate::credential::Credential;
use crate::deploy::{self, DeployOutcome};
use crate::error::{Error, Result};
use crate::git::LocalRepo;
use crate::key_exchange;
use crate::known_hosts;
use crate::repository::{self, Hook};
use crate::session::{Auth, CommandResult, Connector};
use crate::state::{self, HostRecord, Stage, StateStore};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// What [Deployer::create] set up.
#[derive(Clone, Debug)]
pub struct Created {
    pub record: HostRecord,

    /// The local git remote that points at the host.
    pub remote: String,
    pub url: String,

    /// Files written into the local repository that need to be committed before deploying.
    pub scaffolded: Vec<PathBuf>,
}

/// Runs lifecycle operations against hosts reached through `C`.
pub struct Deployer<C: Connector> {
    config: Config,
    connector: C,
    store: StateStore,
    credential: Credential,

    /// The flake's directory in the local repository.
    repo_dir: PathBuf,
}

impl<C: Connector> Deployer<C> {
    pub fn new(config: Config, connector: C, repo_dir: impl Into<PathBuf>) -> Result<Self> {
        let store = StateStore::new(config.hosts_dir());
        let credential = Credential::new(config.key_path()?);
        Ok(Deployer {
            config,
            connector,
            store,
            credential,
            repo_dir: repo_dir.into(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// The persisted record for `address`.
    pub fn record(&self, address: &str) -> Result<HostRecord> {
        self.store.load(address)
    }

    /// Every persisted record.
    pub fn records(&self) -> Result<Vec<HostRecord>> {
        state::list(&self.config.hosts_dir())
    }

    /// Installs NixOS on a host booted into the installer.
    ///
    /// Destructive. Unless `force` is set, the host must be fresh and must not have an unfinished
    /// bootstrap on record; both checks happen before connecting. A forced bootstrap starts the
    /// record over.
    pub fn bootstrap(&mut self, host: &Host, force: bool) -> Result<HostRecord> {
        host.validate()?;
        let mut record = self.check_bootstrap(&host.address, force)?;
        if force && record.stage != Stage::Fresh {
            warn!(address = %host.address, stage = %record.stage, "forcing a new bootstrap");
        }

        let mut session = self.connector.connect(
            &host.address,
            Auth::Installer {
                password: &host.installer_password,
            },
        )?;

        // From here on the disk may change. Record that before touching it.
        record = HostRecord {
            hostname: Some(host.hostname.clone()),
            bootstrap_pending: true,
            ..HostRecord::new(&host.address)
        };
        self.store.save(&record)?;

        let host_dir = self.repo_dir.join(&host.hostname);
        let installed =
            Bootstrap::new(session.as_mut(), host, &self.config.disk, host_dir).run()?;
        known_hosts::record(
            &self.config.known_hosts_path(),
            &host.address,
            &installed.host_key,
        )?;

        record.bootstrap_pending = false;
        record.root_password = Some(host.root_password.clone());
        record.host_key = Some(installed.host_key);
        record.advance(Stage::Bootstrapped);
        self.store.save(&record)?;
        info!(address = %host.address, "bootstrapped; the host is rebooting");
        Ok(record)
    }

    /// Checks, without connecting, that `address` may be bootstrapped, and returns its record.
    pub fn check_bootstrap(&self, address: &str, force: bool) -> Result<HostRecord> {
        let record = self.store.load(address)?;
        if force || (record.stage == Stage::Fresh && !record.bootstrap_pending) {
            return Ok(record);
        }
        let hint = if record.bootstrap_pending {
            "a previous bootstrap did not finish; pass --force to start over"
        } else {
            "bootstrap erases the disk; pass --force to reinstall"
        };
        Err(Error::StateConflict {
            address: address.to_owned(),
            operation: "bootstrap",
            stage: record.stage,
            hint: hint.to_owned(),
        })
    }

    /// Installs the login key, confirms it works, and retires password login.
    ///
    /// Before the key is installed, the first session authenticates with `password`, or with the
    /// root password stored by bootstrap. Afterwards, re-runs use the key. A rejected password
    /// falls back to the key, since an interrupted earlier run may have retired the password
    /// after the key was proven.
    pub fn store_key(&mut self, address: &str, password: Option<&str>) -> Result<HostRecord> {
        let mut record = self.store.load(address)?;
        record.require("store-key", Stage::Bootstrapped)?;
        self.restore_known_host(&record)?;

        self.credential.ensure()?;
        let public_key = self.credential.public_key()?;

        let mut session = if record.stage >= Stage::KeyInstalled {
            self.connector.connect(address, Auth::Key(&self.credential))?
        } else {
            let password = password
                .or(record.root_password.as_deref())
                .ok_or_else(|| {
                    Error::InvalidInput(format!(
                        "no root password is stored for {address}; pass --password"
                    ))
                })?;
            match self.connector.connect(address, Auth::Password { password }) {
                Err(rejected @ Error::Authentication { .. }) => {
                    warn!(address, "root password rejected; trying the login key");
                    self.connector
                        .connect(address, Auth::Key(&self.credential))
                        .map_err(|_| rejected)?
                }
                session => session?,
            }
        };
        key_exchange::authorize(session.as_mut(), &public_key)?;
        drop(session);

        let mut verified = key_exchange::verify(&mut self.connector, address, &self.credential)?;
        key_exchange::retire_password(verified.as_mut())?;

        record.root_password = None;
        record.advance(Stage::KeyInstalled);
        self.store.save(&record)?;
        Ok(record)
    }

    /// Creates the bare repository and receive hook on the host and points a local git remote at
    /// it. Scaffolds the host's configuration and `flake.nix` locally if they are missing.
    pub fn create(&mut self, address: &str) -> Result<Created> {
        let mut record = self.store.load(address)?;
        record.require("create", Stage::KeyInstalled)?;
        let repo = LocalRepo::discover(&self.repo_dir)?;

        let mut session = self.connector.connect(address, Auth::Key(&self.credential))?;
        let hostname = match &record.hostname {
            Some(hostname) => hostname.clone(),
            None => session
                .query("hostname")?
                .check("hostname")?
                .stdout
                .trim()
                .to_owned(),
        };
        repository::require_attr(&hostname)?;

        let scaffolded = repository::scaffold(session.as_mut(), &repo.flake_root(), &hostname)?;

        let flake_dir = repo.flake_dir_str()?;
        let activator = self.config.activation.activator();
        let bare = self.config.bare_repo();
        let hook = Hook {
            deploy_ref: &self.config.deploy_ref(),
            working_dir: &self.config.working_dir(),
            flake_dir: &flake_dir,
            flake_attr: &hostname,
            activator: activator.as_ref(),
        }
        .render()?;
        repository::initialize(session.as_mut(), &bare, &self.config.deploy_branch, &hook)?;

        let transport = self
            .connector
            .git_transport(address, &bare, &self.credential)?;
        let remote = repository::remote_name(&hostname);
        repo.set_remote(&remote, &transport.url)?;

        record.hostname = Some(hostname);
        record.git_remote = Some(remote.clone());
        record.flake_dir = Some(flake_dir);
        record.advance(Stage::RepoCreated);
        self.store.save(&record)?;
        Ok(Created {
            record,
            remote,
            url: transport.url,
            scaffolded,
        })
    }

    /// Pushes HEAD to the host, which builds and activates it.
    ///
    /// The working tree must be clean; that is checked before any connection. If the host already
    /// has HEAD, nothing is activated unless `force` is set.
    pub fn deploy(&mut self, address: &str, force: bool) -> Result<DeployOutcome> {
        let mut record = self.store.load(address)?;
        record.require("deploy", Stage::RepoCreated)?;
        let repo = LocalRepo::discover(&self.repo_dir)?;
        repo.require_clean()?;

        let (remote, hostname) = wiring(&record)?;
        let flake_dir = record.flake_dir.clone().unwrap_or_default();
        if repo.flake_dir_str()? != flake_dir {
            warn!(
                hook = %flake_dir,
                "the receive hook builds a different flake directory; \
                run `create` again to change it",
            );
        }

        let transport = self
            .connector
            .git_transport(address, &self.config.bare_repo(), &self.credential)?;
        let mut outcome = deploy::push(
            &repo,
            address,
            &remote,
            &self.config.deploy_ref(),
            &transport,
        )?;

        if outcome.up_to_date {
            if force {
                let mut session = self.connector.connect(address, Auth::Key(&self.credential))?;
                let activator = self.config.activation.activator();
                deploy::reactivate(
                    session.as_mut(),
                    &self.config.working_dir(),
                    &flake_dir,
                    &hostname,
                    activator.as_ref(),
                )?;
                outcome.reactivated = true;
            } else {
                info!(
                    address,
                    commit = %outcome.commit,
                    "already deployed; pass --force to activate again",
                );
            }
        }

        record.deployed_commit = Some(outcome.commit.clone());
        record.advance(Stage::Deployed);
        self.store.save(&record)?;
        Ok(outcome)
    }

    /// Fetches the deployed history back into the local repository, fast-forward only.
    pub fn pull(&mut self, address: &str) -> Result<CommandResult> {
        let record = self.store.load(address)?;
        record.require("pull", Stage::RepoCreated)?;
        let repo = LocalRepo::discover(&self.repo_dir)?;
        let (remote, _) = wiring(&record)?;

        let transport = self
            .connector
            .git_transport(address, &self.config.bare_repo(), &self.credential)?;
        let output = repo.pull(
            &remote,
            &self.config.deploy_branch,
            transport.ssh_command.as_deref(),
        )?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::RemoteCommand {
                command: "git pull".to_owned(),
                output,
            })
        }
    }

    /// Re-records the host identity learned during bootstrap if the known-hosts file lost it.
    fn restore_known_host(&self, record: &HostRecord) -> Result<()> {
        let Some(host_key) = &record.host_key else {
            return Ok(());
        };
        let path = self.config.known_hosts_path();
        if known_hosts::lookup(&path, &record.address)?.as_deref() != Some(host_key.as_str()) {
            warn!(
                address = %record.address,
                "host identity missing from known hosts; restoring it",
            );
            known_hosts::record(&path, &record.address, host_key)?;
        }
        Ok(())
    }
}

/// The git remote and host name that `create` recorded.
fn wiring(record: &HostRecord) -> Result<(String, String)> {
    match (&record.git_remote, &record.hostname) {
        (Some(remote), Some(hostname)) => Ok((remote.clone(), hostname.clone())),
        _ => Err(Error::StateConflict {
            address: record.address.clone(),
            operation: "deploy",
            stage: record.stage,
            hint: "the record has no git remote; run `create` again".to_owned(),
        }),
    }
}
