//! Drives hosts through the whole lifecycle against a sandboxed fake remote.
//!
//! The fake remote runs unscripted commands in a local sandbox, so the bare repository, its
//! receive hook, and `authorized_keys` are real. Only the installer sequence is scripted, since it
//! would repartition the machine running the tests.

use nixploy::activate::Activation;
use nixploy::bootstrap::Host;
use nixploy::config::Config;
use nixploy::state::Stage;
use nixploy::testing::{commit_file, git, init_repo, FakeConnector, FakeRemote, HOST_KEY};
use nixploy::{Deployer, Error};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const ADDRESS: &str = "192.0.2.10";

/// Everything a test needs, kept alive together.
struct Fixture {
    remote: FakeRemote,
    state: TempDir,
    repo: TempDir,
    deployer: Deployer<FakeConnector>,
}

impl Fixture {
    fn new() -> Self {
        Fixture::with_activation("test -f flake.nix")
    }

    fn with_activation(command: &str) -> Self {
        let remote = FakeRemote::sandboxed();
        remote.script_installer();

        let state = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        init_repo(repo.path());

        let config = Config {
            state_dir: state.path().to_owned(),
            key_file: Some(state.path().join("id_ed25519")),
            remote_root: remote.sandbox().join("nixploy").display().to_string(),
            activation: Activation::Command(command.to_owned()),
            ..Config::default()
        };
        let deployer = Deployer::new(config, remote.connector(), repo.path()).unwrap();
        Fixture {
            remote,
            state,
            repo,
            deployer,
        }
    }

    fn host() -> Host {
        Host {
            address: ADDRESS.to_owned(),
            hostname: "web1".to_owned(),
            installer_password: "installer".to_owned(),
            root_password: "hunter2".to_owned(),
        }
    }

    fn bare(&self) -> PathBuf {
        self.remote.sandbox().join("nixploy/bare")
    }

    /// Runs bootstrap, store-key, and create, then commits the files they wrote locally.
    fn ready_to_deploy(&mut self) {
        self.deployer.bootstrap(&Fixture::host(), false).unwrap();
        self.deployer.store_key(ADDRESS, None).unwrap();
        self.deployer.create(ADDRESS).unwrap();
        commit_all(self.repo.path());
    }
}

fn commit_all(dir: &Path) {
    git(dir, &["add", "--all"]);
    git(dir, &["commit", "--quiet", "-m", "Add web1"]);
}

mod full_flow {
    use super::*;

    #[test]
    fn fresh_host_to_deployed() {
        let mut fixture = Fixture::new();
        let bare = fixture.bare();
        let sandbox = fixture.remote.sandbox();
        let d = &mut fixture.deployer;

        let record = d.bootstrap(&Fixture::host(), false).unwrap();
        assert_eq!(record.stage, Stage::Bootstrapped);
        assert!(!record.bootstrap_pending);
        assert_eq!(record.host_key.as_deref(), Some(HOST_KEY));
        assert_eq!(record.root_password.as_deref(), Some("hunter2"));
        let known_hosts = fs::read_to_string(fixture.state.path().join("known_hosts")).unwrap();
        assert!(known_hosts.contains(&format!("{ADDRESS} {HOST_KEY}")), "{known_hosts}");
        assert!(fixture.repo.path().join("web1/configuration.nix").exists());
        assert!(fixture.repo.path().join("web1/nixploy.nix").exists());

        let record = d.store_key(ADDRESS, None).unwrap();
        assert_eq!(record.stage, Stage::KeyInstalled);
        assert_eq!(record.root_password, None);
        assert!(!fixture.remote.password_login_enabled());
        for entry in fs::read_dir(fixture.state.path().join("hosts")).unwrap() {
            let stored = fs::read_to_string(entry.unwrap().path()).unwrap();
            assert!(!stored.contains("hunter2"), "{stored}");
        }

        let created = d.create(ADDRESS).unwrap();
        assert_eq!(created.record.stage, Stage::RepoCreated);
        assert_eq!(created.remote, "nixploy-web1");
        assert!(bare.join("HEAD").exists());
        assert!(bare.join("hooks/pre-receive").exists());
        assert_eq!(
            git(fixture.repo.path(), &["remote", "get-url", "nixploy-web1"]),
            bare.display().to_string(),
        );

        commit_all(fixture.repo.path());
        let head = git(fixture.repo.path(), &["rev-parse", "HEAD"]);
        let outcome = d.deploy(ADDRESS, false).unwrap();
        assert_eq!(outcome.commit, head);
        assert!(!outcome.up_to_date);
        assert_eq!(git(&bare, &["rev-parse", "refs/heads/main"]), head);
        assert!(sandbox
            .join("nixploy/working-dir/web1/configuration.nix")
            .exists());

        let record = d.record(ADDRESS).unwrap();
        assert_eq!(record.stage, Stage::Deployed);
        assert_eq!(record.deployed_commit.as_deref(), Some(head.as_str()));
    }

    #[test]
    fn redeploy_without_changes_is_up_to_date() {
        let mut fixture = Fixture::new();
        fixture.ready_to_deploy();
        fixture.deployer.deploy(ADDRESS, false).unwrap();

        let outcome = fixture.deployer.deploy(ADDRESS, false).unwrap();
        assert!(outcome.up_to_date);
        assert!(!outcome.reactivated);

        let outcome = fixture.deployer.deploy(ADDRESS, true).unwrap();
        assert!(outcome.up_to_date);
        assert!(outcome.reactivated);
    }

    #[test]
    fn deploys_new_commits() {
        let mut fixture = Fixture::new();
        fixture.ready_to_deploy();
        fixture.deployer.deploy(ADDRESS, false).unwrap();

        commit_file(fixture.repo.path(), "web1/extra.nix", "{ }\n");
        let head = git(fixture.repo.path(), &["rev-parse", "HEAD"]);
        let outcome = fixture.deployer.deploy(ADDRESS, false).unwrap();
        assert_eq!(outcome.commit, head);
        assert!(fixture
            .remote
            .sandbox()
            .join("nixploy/working-dir/web1/extra.nix")
            .exists());
    }
}

mod deploy {
    use super::*;

    #[test]
    fn failed_build_keeps_ref_and_record() {
        let mut fixture = Fixture::with_activation("echo 'error: attribute missing' >&2; exit 1");
        fixture.ready_to_deploy();

        let error = fixture.deployer.deploy(ADDRESS, false).unwrap_err();
        assert!(matches!(error, Error::BuildFailure { .. }), "{error:?}");
        assert_eq!(error.exit_code(), 5);
        assert!(error.output().unwrap().stderr.contains("attribute missing"));

        let refs = git(&fixture.bare(), &["for-each-ref"]);
        assert_eq!(refs, "");
        let record = fixture.deployer.record(ADDRESS).unwrap();
        assert_eq!(record.stage, Stage::RepoCreated);
        assert_eq!(record.deployed_commit, None);
    }

    #[test]
    fn dirty_tree_fails_before_connecting() {
        let mut fixture = Fixture::new();
        fixture.ready_to_deploy();
        fs::write(fixture.repo.path().join("web1/configuration.nix"), "# edited\n").unwrap();
        let connections = fixture.remote.connections().len();
        let commands = fixture.remote.commands().len();

        let error = fixture.deployer.deploy(ADDRESS, false).unwrap_err();
        match &error {
            Error::DirtyTree { paths } => assert_eq!(paths, &["web1/configuration.nix"]),
            e => panic!("unexpected error: {e:?}"),
        }
        assert_eq!(error.exit_code(), 8);
        assert_eq!(fixture.remote.connections().len(), connections);
        assert_eq!(fixture.remote.commands().len(), commands);
        assert_eq!(git(&fixture.bare(), &["for-each-ref"]), "");
    }

    #[test]
    fn refuses_before_create() {
        let mut fixture = Fixture::new();
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();

        let error = fixture.deployer.deploy(ADDRESS, false).unwrap_err();
        assert!(matches!(error, Error::StateConflict { .. }), "{error:?}");
        assert_eq!(error.exit_code(), 6);
    }
}

mod bootstrap {
    use super::*;

    #[test]
    fn second_bootstrap_needs_force() {
        let mut fixture = Fixture::new();
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();
        let connections = fixture.remote.connections().len();
        let commands = fixture.remote.commands().len();

        let error = fixture
            .deployer
            .bootstrap(&Fixture::host(), false)
            .unwrap_err();
        assert!(matches!(error, Error::StateConflict { .. }), "{error:?}");
        assert_eq!(fixture.remote.connections().len(), connections);
        assert_eq!(fixture.remote.commands().len(), commands);

        let record = fixture.deployer.bootstrap(&Fixture::host(), true).unwrap();
        assert_eq!(record.stage, Stage::Bootstrapped);
    }

    #[test]
    fn check_runs_without_connecting() {
        let mut fixture = Fixture::new();
        assert!(fixture.deployer.check_bootstrap(ADDRESS, false).is_ok());
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();
        let connections = fixture.remote.connections().len();

        let error = fixture.deployer.check_bootstrap(ADDRESS, false).unwrap_err();
        assert!(matches!(error, Error::StateConflict { .. }), "{error:?}");
        let record = fixture.deployer.check_bootstrap(ADDRESS, true).unwrap();
        assert_eq!(record.stage, Stage::Bootstrapped);
        assert_eq!(fixture.remote.connections().len(), connections);
    }

    #[test]
    fn failed_step_leaves_pending_marker() {
        let mut fixture = Fixture::new();
        fixture.remote.respond("nixos-install", 1, "", "error: out of space\n");

        let error = fixture
            .deployer
            .bootstrap(&Fixture::host(), false)
            .unwrap_err();
        match &error {
            Error::InstallFailure { step, .. } => assert_eq!(step, "install"),
            e => panic!("unexpected error: {e:?}"),
        }
        let record = fixture.deployer.record(ADDRESS).unwrap();
        assert_eq!(record.stage, Stage::Fresh);
        assert!(record.bootstrap_pending);

        let error = fixture
            .deployer
            .bootstrap(&Fixture::host(), false)
            .unwrap_err();
        assert!(matches!(error, Error::StateConflict { .. }), "{error:?}");
        let error = fixture.deployer.store_key(ADDRESS, None).unwrap_err();
        assert!(matches!(error, Error::StateConflict { .. }), "{error:?}");
    }

    #[test]
    fn unreachable_host_leaves_record_fresh() {
        let mut fixture = Fixture::new();
        fixture.remote.set_reachable(false);

        let error = fixture
            .deployer
            .bootstrap(&Fixture::host(), false)
            .unwrap_err();
        assert_eq!(error.exit_code(), 3);
        let record = fixture.deployer.record(ADDRESS).unwrap();
        assert_eq!(record.stage, Stage::Fresh);
        assert!(!record.bootstrap_pending);
    }
}

mod store_key {
    use super::*;

    #[test]
    fn is_idempotent() {
        let mut fixture = Fixture::new();
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();
        fixture.deployer.store_key(ADDRESS, None).unwrap();
        let keys = fixture.remote.sandbox().join(".ssh/authorized_keys");
        let first = fs::read_to_string(&keys).unwrap();

        let record = fixture.deployer.store_key(ADDRESS, None).unwrap();
        assert_eq!(record.stage, Stage::KeyInstalled);
        assert_eq!(fs::read_to_string(&keys).unwrap(), first);
        assert_eq!(first.lines().count(), 1);
    }

    #[test]
    fn rerun_after_interrupted_retirement_uses_the_key() {
        let mut fixture = Fixture::new();
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();
        fixture.remote.drop_connection("getent shadow root");

        let error = fixture.deployer.store_key(ADDRESS, None).unwrap_err();
        assert!(matches!(error, Error::Connection { .. }), "{error:?}");
        assert!(!fixture.remote.password_login_enabled());
        let record = fixture.deployer.record(ADDRESS).unwrap();
        assert_eq!(record.stage, Stage::Bootstrapped);

        fixture.remote.respond("getent shadow root", 0, "", "");
        let record = fixture.deployer.store_key(ADDRESS, None).unwrap();
        assert_eq!(record.stage, Stage::KeyInstalled);
        assert_eq!(record.root_password, None);

        let attempts: Vec<_> = fixture
            .remote
            .connections()
            .into_iter()
            .rev()
            .take(3)
            .map(|c| (c.auth, c.accepted))
            .collect();
        assert_eq!(
            attempts,
            [("key", true), ("key", true), ("root password", false)],
        );
    }

    #[test]
    fn restores_a_lost_host_identity() {
        let mut fixture = Fixture::new();
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();
        let known_hosts = fixture.state.path().join("known_hosts");
        fs::write(&known_hosts, "198.51.100.7 ssh-ed25519 OTHER\n").unwrap();

        fixture.deployer.store_key(ADDRESS, None).unwrap();
        assert_eq!(
            fs::read_to_string(&known_hosts).unwrap(),
            format!("198.51.100.7 ssh-ed25519 OTHER\n{ADDRESS} {HOST_KEY}\n"),
        );
    }

    #[test]
    fn rejected_key_keeps_password_login() {
        let mut fixture = Fixture::new();
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();
        fixture.remote.reject_key();

        let error = fixture.deployer.store_key(ADDRESS, None).unwrap_err();
        assert!(matches!(error, Error::KeyVerification { .. }), "{error:?}");
        assert_eq!(error.exit_code(), 7);
        assert!(fixture.remote.password_login_enabled());

        let record = fixture.deployer.record(ADDRESS).unwrap();
        assert_eq!(record.stage, Stage::Bootstrapped);
        assert_eq!(record.root_password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn uses_the_stored_root_password() {
        let mut fixture = Fixture::new();
        fixture.deployer.bootstrap(&Fixture::host(), false).unwrap();
        fixture.deployer.store_key(ADDRESS, None).unwrap();

        let password_logins: Vec<_> = fixture
            .remote
            .connections()
            .into_iter()
            .filter(|c| c.auth == "root password")
            .collect();
        assert_eq!(password_logins.len(), 1);
        assert_eq!(password_logins[0].password.as_deref(), Some("hunter2"));
    }
}
