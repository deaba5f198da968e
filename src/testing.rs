//! Fakes and fixtures for exercising lifecycle operations without a real host.
//!
//! [FakeRemote] stands in for a remote machine. A scripted remote answers commands from a table;
//! a sandboxed remote additionally runs unscripted commands in a local `sh` with `$HOME` and the
//! working directory set to a temporary directory, so real `git` and shell behavior can be
//! observed.
//!
//! Hidden from documentation. Compiled for unit tests and, through the `testing` feature, for the
//! integration tests.

use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::session::{Auth, CommandResult, Connector, GitTransport, Session};
use std::cell::RefCell;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::rc::Rc;
use tempfile::TempDir;

/// What `nixos-generate-config` writes as `hardware-configuration.nix` in a scripted installer.
pub const HARDWARE_CONFIG: &str = "{ config, lib, modulesPath, ... }:\n\n\
{\n  imports = [ (modulesPath + \"/profiles/qemu-guest.nix\") ];\n\n  \
fileSystems.\"/\" = { device = \"/dev/disk/by-label/nixos\"; fsType = \"ext4\"; };\n}\n";

/// What `nixos-generate-config` writes as `configuration.nix` in a scripted installer.
pub const GENERATED_CONFIG: &str = "{ config, pkgs, ... }:\n\n\
{\n  imports =\n    [ # Include the results of the hardware scan.\n      \
./hardware-configuration.nix\n    ];\n\n  \
# boot.loader.grub.device = \"/dev/sda\";\n\n  \
system.stateVersion = \"24.05\";\n}\n";

/// The host identity key that a scripted installer generates.
pub const HOST_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFakeHostIdentity";

/// One command run on a [FakeRemote].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Executed {
    pub address: String,
    pub command: String,
    pub input: Option<Vec<u8>>,
}

/// One connection attempt to a [FakeRemote].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub address: String,

    /// [Auth::describe] of the credential used.
    pub auth: &'static str,

    pub password: Option<String>,
    pub accepted: bool,
}

#[derive(Clone, Debug)]
enum Response {
    Result(CommandResult),
    DropConnection,
}

struct State {
    sandbox: TempDir,
    local_exec: bool,

    /// Checked newest first.
    responses: Vec<(String, Response)>,

    executed: Vec<Executed>,
    connections: Vec<Connection>,
    password_login: bool,
    accept_key: bool,
    reachable: bool,
}

/// A fake remote host. Clones share state.
#[derive(Clone)]
pub struct FakeRemote {
    state: Rc<RefCell<State>>,
}

impl FakeRemote {
    fn new(local_exec: bool) -> Self {
        let sandbox = tempfile::Builder::new()
            .prefix("nixploy-remote")
            .tempdir()
            .unwrap();
        FakeRemote {
            state: Rc::new(RefCell::new(State {
                sandbox,
                local_exec,
                responses: Vec::new(),
                executed: Vec::new(),
                connections: Vec::new(),
                password_login: true,
                accept_key: true,
                reachable: true,
            })),
        }
    }

    /// A remote on which every unscripted command succeeds without output.
    pub fn scripted() -> Self {
        FakeRemote::new(false)
    }

    /// A remote on which unscripted commands run in a local sandbox directory.
    pub fn sandboxed() -> Self {
        FakeRemote::new(true)
    }

    /// The sandbox directory, which is `$HOME` for sandboxed commands.
    pub fn sandbox(&self) -> PathBuf {
        self.state.borrow().sandbox.path().to_owned()
    }

    /// Answers commands containing `pattern`. Newer responses take precedence.
    pub fn respond(&self, pattern: &str, exit_code: i32, stdout: &str, stderr: &str) {
        let result = CommandResult::new(Some(exit_code), stdout.into(), stderr.into(), false);
        self.state
            .borrow_mut()
            .responses
            .push((pattern.to_owned(), Response::Result(result)));
    }

    /// Fails commands containing `pattern` as if the connection dropped while they ran.
    pub fn drop_connection(&self, pattern: &str) {
        self.state
            .borrow_mut()
            .responses
            .push((pattern.to_owned(), Response::DropConnection));
    }

    /// Scripts every command of the installer sequence as a success, with generated
    /// configuration files and a host key to read back.
    pub fn script_installer(&self) {
        for pattern in [
            "umount -R /mnt",
            "parted ",
            "udevadm settle",
            "mkfs.ext4",
            "mkswap",
            "swapon",
            "mount /dev/disk/by-label/nixos /mnt",
            "nixos-generate-config",
            "cat > /mnt/etc/nixos/",
            "nixos-install",
            "chpasswd --root /mnt",
            "reboot",
        ] {
            self.respond(pattern, 0, "", "");
        }
        self.respond(
            "cat /mnt/etc/nixos/hardware-configuration.nix",
            0,
            HARDWARE_CONFIG,
            "",
        );
        self.respond("cat /mnt/etc/nixos/configuration.nix", 0, GENERATED_CONFIG, "");
        self.respond(
            "/mnt/etc/ssh/ssh_host_ed25519_key",
            0,
            &format!("{HOST_KEY} root@installer\n"),
            "",
        );
    }

    /// Makes the remote refuse key logins.
    pub fn reject_key(&self) {
        self.state.borrow_mut().accept_key = false;
    }

    /// Makes every connection attempt fail as if the host were down.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.borrow_mut().reachable = reachable;
    }

    /// Whether root can still log in with a password. `usermod -p` turns this off.
    pub fn password_login_enabled(&self) -> bool {
        self.state.borrow().password_login
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state.borrow().executed.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.command).collect()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.state.borrow().connections.clone()
    }

    /// A session that is already connected, bypassing authentication.
    pub fn session(&self, address: &str) -> Box<dyn Session> {
        Box::new(FakeSession {
            remote: self.clone(),
            address: address.to_owned(),
        })
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            remote: self.clone(),
        }
    }

    /// Whether the sandbox's `authorized_keys` holds `credential`'s public key.
    fn key_authorized(&self, credential: &Credential) -> bool {
        let Ok(key) = credential.public_key() else {
            return false;
        };
        let path = self.sandbox().join(".ssh/authorized_keys");
        fs::read_to_string(path)
            .map(|keys| keys.lines().any(|line| line == key))
            .unwrap_or(false)
    }

    fn exec(&self, address: &str, command: &str, input: Option<&[u8]>) -> Result<CommandResult> {
        self.state.borrow_mut().executed.push(Executed {
            address: address.to_owned(),
            command: command.to_owned(),
            input: input.map(<[u8]>::to_vec),
        });

        let response = self
            .state
            .borrow()
            .responses
            .iter()
            .rev()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, response)| response.clone());
        match response {
            Some(Response::Result(result)) => return Ok(result),
            Some(Response::DropConnection) => {
                return Err(Error::Connection {
                    address: address.to_owned(),
                    message: "Connection to host closed by remote host.".to_owned(),
                    partial: Some(CommandResult::new(None, Vec::new(), Vec::new(), false)),
                })
            }
            None => {}
        }

        // Account management that must not touch the machine running the tests.
        if command.starts_with("usermod -p '*' root") {
            self.state.borrow_mut().password_login = false;
            return Ok(CommandResult::new(Some(0), Vec::new(), Vec::new(), false));
        }
        if command.contains("getent shadow root") {
            let locked = !self.state.borrow().password_login;
            let code = if locked { 0 } else { 1 };
            return Ok(CommandResult::new(Some(code), Vec::new(), Vec::new(), false));
        }

        if !self.state.borrow().local_exec {
            return Ok(CommandResult::new(Some(0), Vec::new(), Vec::new(), false));
        }
        self.run_locally(command, input)
    }

    fn run_locally(&self, command: &str, input: Option<&[u8]>) -> Result<CommandResult> {
        let sandbox = self.sandbox();
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&sandbox)
            .env("HOME", &sandbox)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        if let (Some(mut stdin), Some(input)) = (child.stdin.take(), input) {
            stdin.write_all(input)?;
        }
        let output = child.wait_with_output()?;
        Ok(CommandResult::new(
            output.status.code(),
            output.stdout,
            output.stderr,
            false,
        ))
    }
}

struct FakeSession {
    remote: FakeRemote,
    address: String,
}

impl Session for FakeSession {
    fn address(&self) -> &str {
        &self.address
    }

    fn exec(&mut self, command: &str, input: Option<&[u8]>, echo: bool) -> Result<CommandResult> {
        let mut result = self.remote.exec(&self.address, command, input)?;
        result.echoed = echo;
        Ok(result)
    }
}

/// A [Connector] for a [FakeRemote].
///
/// The installer password is always accepted. The root password is accepted until `usermod -p`
/// runs. On a sandboxed remote, the key is accepted once it appears in the sandbox's
/// `authorized_keys`; on a scripted one, unless [FakeRemote::reject_key] was called.
pub struct FakeConnector {
    remote: FakeRemote,
}

impl Connector for FakeConnector {
    fn connect(&mut self, address: &str, auth: Auth<'_>) -> Result<Box<dyn Session>> {
        let (reachable, password_login, accept_key, local_exec) = {
            let state = self.remote.state.borrow();
            (
                state.reachable,
                state.password_login,
                state.accept_key,
                state.local_exec,
            )
        };
        if !reachable {
            return Err(Error::Connection {
                address: address.to_owned(),
                message: format!("ssh: connect to host {address} port 22: No route to host"),
                partial: None,
            });
        }

        let (accepted, password) = match auth {
            Auth::Installer { password } => (true, Some(password.to_owned())),
            Auth::Password { password } => (password_login, Some(password.to_owned())),
            Auth::Key(credential) => (
                accept_key && (!local_exec || self.remote.key_authorized(credential)),
                None,
            ),
        };
        self.remote.state.borrow_mut().connections.push(Connection {
            address: address.to_owned(),
            auth: auth.describe(),
            password,
            accepted,
        });

        if !accepted {
            return Err(Error::Authentication {
                address: address.to_owned(),
                message: format!("root@{address}: Permission denied"),
            });
        }
        Ok(self.remote.session(address))
    }

    fn git_transport(
        &self,
        _address: &str,
        remote_path: &str,
        _credential: &Credential,
    ) -> Result<GitTransport> {
        Ok(GitTransport {
            url: remote_path.to_owned(),
            ssh_command: None,
        })
    }
}

/// Runs git in `dir` and returns its trimmed stdout. Panics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr),
    );
    String::from_utf8(output.stdout).unwrap().trim_end().to_owned()
}

/// Initializes a repository on `main` with a committed `flake.nix`.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "--quiet", "--initial-branch=main"]);
    git(dir, &["config", "user.name", "nixploy tests"]);
    git(dir, &["config", "user.email", "tests@nixploy.invalid"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    commit_file(dir, "flake.nix", "{ }\n");
}

/// Writes `path` (relative to `dir`) and commits it.
pub fn commit_file(dir: &Path, path: &str, contents: &str) {
    let full = dir.join(path);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&full, contents).unwrap();
    git(dir, &["add", "--", path]);
    git(dir, &["commit", "--quiet", "-m", &format!("Update {path}")]);
}
