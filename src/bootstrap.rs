//! Turns a host booted into the NixOS installer into an installed system with a known identity.
//!
//! Every step runs over one installer session. A failing step aborts the whole sequence and leaves
//! the disk in whatever state the step left it; the only way forward is a forced bootstrap from
//! the start.

use crate::error::{Error, Result};
use crate::session::{quote, CommandResult, Session};
use anyhow::{anyhow, Context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{info, warn};

/// The module that nixploy owns inside each host's configuration directory.
pub const MODULE_FILE: &str = "nixploy.nix";

/// Where the installer mounts the target system.
const TARGET_CONFIG_DIR: &str = "/mnt/etc/nixos";

/// The host identity key, generated on the target before installation.
const HOST_KEY: &str = "/mnt/etc/ssh/ssh_host_ed25519_key";

/// The operator's description of a host to install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Host {
    pub address: String,
    pub hostname: String,

    /// The live installer's temporary root password.
    pub installer_password: String,

    /// The root password of the installed system.
    pub root_password: String,
}

impl Host {
    pub fn validate(&self) -> Result<()> {
        validate_hostname(&self.hostname)?;
        if self.address.is_empty() || self.address.starts_with('-') {
            return Err(Error::InvalidInput(format!(
                "not a usable address: {:?}",
                self.address,
            )));
        }
        if self.installer_password.is_empty() || self.root_password.is_empty() {
            return Err(Error::InvalidInput("passwords must not be empty".to_owned()));
        }
        if self.root_password.contains('\n') {
            return Err(Error::InvalidInput(
                "the root password must not contain a line break".to_owned(),
            ));
        }
        if self.installer_password == self.root_password {
            return Err(Error::InvalidInput(
                "the root password must differ from the installer password".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Checks that `hostname` is a single DNS label, which is also what NixOS accepts for
/// `networking.hostName` and what a flake attribute can hold without quoting.
pub fn validate_hostname(hostname: &str) -> Result<()> {
    static LABEL: OnceLock<Regex> = OnceLock::new();
    let label = LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap()
    });
    if label.is_match(hostname) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "not a valid host name: {hostname:?}"
        )))
    }
}

/// The disk to partition: an MBR label with a root partition and, unless `swap_gib` is zero, a
/// swap partition at the end.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiskLayout {
    pub device: String,
    pub swap_gib: u32,
}

impl Default for DiskLayout {
    fn default() -> Self {
        DiskLayout {
            device: "/dev/sda".to_owned(),
            swap_gib: 8,
        }
    }
}

impl DiskLayout {
    pub fn validate(&self) -> Result<()> {
        let valid = self.device.starts_with("/dev/")
            && self.device[5..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "/-_.".contains(c));
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!(
                "not a usable disk device: {:?}",
                self.device,
            )))
        }
    }

    /// The device node of partition `n`. Devices whose names end in a digit separate the
    /// partition number with `p`, e.g. `/dev/nvme0n1p1`.
    pub fn partition(&self, n: u32) -> String {
        if self.device.ends_with(|c: char| c.is_ascii_digit()) {
            format!("{}p{n}", self.device)
        } else {
            format!("{}{n}", self.device)
        }
    }

    /// Commands that partition, format, and mount the disk under `/mnt`.
    pub fn commands(&self) -> Vec<String> {
        let device = &self.device;
        let mut commands = vec![format!("parted {device} -s -- mklabel msdos")];
        if self.swap_gib == 0 {
            commands.push(format!("parted {device} -s -- mkpart primary 1MiB 100%"));
        } else {
            let swap = self.swap_gib;
            commands.push(format!(
                "parted {device} -s -- mkpart primary 1MiB -{swap}GiB"
            ));
            commands.push(format!(
                "parted {device} -s -- mkpart primary linux-swap -{swap}GiB 100%"
            ));
        }

        // Wait for the partition and label links to appear.
        commands.push("udevadm settle".to_owned());
        commands.push(format!("mkfs.ext4 -q -F -L nixos {}", self.partition(1)));
        if self.swap_gib != 0 {
            commands.push(format!("mkswap -L swap {}", self.partition(2)));
        }
        commands.push("udevadm settle".to_owned());
        commands.push("mount /dev/disk/by-label/nixos /mnt".to_owned());
        if self.swap_gib != 0 {
            commands.push(format!("swapon {}", self.partition(2)));
        }
        commands
    }
}

/// The bootstrap steps, in the order they run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Prepare,
    Partition,
    GenerateConfig,
    UploadConfig,
    HostIdentity,
    Install,
    RootPassword,
    Reboot,
}

impl Step {
    pub const ALL: [Step; 8] = [
        Step::Prepare,
        Step::Partition,
        Step::GenerateConfig,
        Step::UploadConfig,
        Step::HostIdentity,
        Step::Install,
        Step::RootPassword,
        Step::Reboot,
    ];
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Prepare => "prepare",
            Step::Partition => "partition",
            Step::GenerateConfig => "generate-config",
            Step::UploadConfig => "upload-config",
            Step::HostIdentity => "host-identity",
            Step::Install => "install",
            Step::RootPassword => "root-password",
            Step::Reboot => "reboot",
        })
    }
}

/// What a completed bootstrap learned about the host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Installed {
    /// The host's public identity key as `<type> <base64>`.
    pub host_key: String,
}

/// Drives the installer sequence over one installer session.
pub struct Bootstrap<'a> {
    session: &'a mut dyn Session,
    host: &'a Host,
    disk: &'a DiskLayout,

    /// The host's directory in the local repository, e.g. `<flake>/web1`.
    host_dir: PathBuf,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        session: &'a mut dyn Session,
        host: &'a Host,
        disk: &'a DiskLayout,
        host_dir: PathBuf,
    ) -> Self {
        Bootstrap {
            session,
            host,
            disk,
            host_dir,
        }
    }

    /// Runs every [Step] in order.
    pub fn run(mut self) -> Result<Installed> {
        let mut host_key = None;
        for step in Step::ALL {
            info!(address = %self.host.address, %step, "bootstrap step");
            match step {
                Step::Prepare => {
                    self.command(
                        step,
                        "umount -R /mnt 2>/dev/null || true; swapoff -a 2>/dev/null || true",
                    )?;
                }
                Step::Partition => {
                    for command in self.disk.commands() {
                        self.command(step, &command)?;
                    }
                }
                Step::GenerateConfig => {
                    self.command(step, "nixos-generate-config --root /mnt 2>&1")?;
                }
                Step::UploadConfig => self.upload_config()?,
                Step::HostIdentity => host_key = Some(self.host_identity()?),
                Step::Install => {
                    self.command(step, "nixos-install --no-root-passwd 2>&1")?;
                }
                Step::RootPassword => self.root_password()?,
                Step::Reboot => self.reboot()?,
            }
        }

        let host_key = host_key.ok_or_else(|| anyhow!("no host identity was generated"))?;
        Ok(Installed { host_key })
    }

    /// Runs `command` with its output relayed. A non-zero exit fails the step.
    fn command(&mut self, step: Step, command: &str) -> Result<CommandResult> {
        let output = self.session.run(command)?;
        if output.success() {
            Ok(output)
        } else {
            Err(Error::InstallFailure {
                step: step.to_string(),
                output,
            })
        }
    }

    /// Reads a file from the target system.
    fn fetch(&mut self, step: Step, remote_path: &str) -> Result<String> {
        let command = format!("cat {}", quote(remote_path)?);
        let output = self.session.query(&command)?;
        if !output.success() {
            return Err(Error::InstallFailure {
                step: step.to_string(),
                output,
            });
        }
        Ok(output.stdout)
    }

    fn upload(&mut self, step: Step, local_path: &Path, remote_path: &str) -> Result<()> {
        match self.session.put_file(local_path, remote_path, 0o644) {
            Err(Error::Transfer { output, .. }) => Err(Error::InstallFailure {
                step: step.to_string(),
                output,
            }),
            x => x,
        }
    }

    /// Syncs the host's configuration directory in the local repository with the generated
    /// configuration, then uploads it to the target.
    ///
    /// The hardware configuration always comes from the target. An existing local
    /// `configuration.nix` is the operator's and is kept; it only gains an import of the
    /// nixploy module.
    fn upload_config(&mut self) -> Result<()> {
        let step = Step::UploadConfig;
        fs::create_dir_all(&self.host_dir)
            .with_context(|| format!("failed to create {}", self.host_dir.display()))?;

        let hardware_path = format!("{TARGET_CONFIG_DIR}/hardware-configuration.nix");
        let hardware = self.fetch(step, &hardware_path)?;
        write_local(&self.host_dir.join("hardware-configuration.nix"), &hardware)?;

        let config_path = self.host_dir.join("configuration.nix");
        let config = if config_path.exists() {
            info!(path = %config_path.display(), "keeping existing configuration.nix");
            fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?
        } else {
            self.fetch(step, &format!("{TARGET_CONFIG_DIR}/configuration.nix"))?
        };
        let config = patch_imports(&config)?;
        write_local(&config_path, &config)?;

        let module = render_module(&self.host.hostname, &self.disk.device);
        write_local(&self.host_dir.join(MODULE_FILE), &module)?;

        for name in ["hardware-configuration.nix", "configuration.nix", MODULE_FILE] {
            let local_path = self.host_dir.join(name);
            self.upload(step, &local_path, &format!("{TARGET_CONFIG_DIR}/{name}"))?;
        }
        Ok(())
    }

    /// Generates the host's identity key on the target and returns its public half.
    fn host_identity(&mut self) -> Result<String> {
        let step = Step::HostIdentity;
        let comment = quote(&format!("root@{}", self.host.hostname))?;
        let command = format!(
            "mkdir -p /mnt/etc/ssh && rm -f {HOST_KEY} {HOST_KEY}.pub && \
            ssh-keygen -q -t ed25519 -N '' -C {comment} -f {HOST_KEY} && \
            cat {HOST_KEY}.pub",
        );
        let output = self.session.query(&command)?;
        if !output.success() {
            return Err(Error::InstallFailure {
                step: step.to_string(),
                output,
            });
        }

        let mut fields = output.stdout.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some(kind), Some(blob)) => Ok(format!("{kind} {blob}")),
            _ => Err(Error::InstallFailure {
                step: step.to_string(),
                output,
            }),
        }
    }

    /// Sets the installed system's root password. The password travels on stdin only.
    fn root_password(&mut self) -> Result<()> {
        let input = format!("root:{}\n", self.host.root_password);
        let output = self
            .session
            .exec("chpasswd --root /mnt", Some(input.as_bytes()), false)?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::InstallFailure {
                step: Step::RootPassword.to_string(),
                output,
            })
        }
    }

    /// Schedules a reboot. The connection may drop before the command returns.
    fn reboot(&mut self) -> Result<()> {
        match self
            .session
            .run("nohup sh -c 'sleep 2; reboot' >/dev/null 2>&1 &")
        {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(Error::InstallFailure {
                step: Step::Reboot.to_string(),
                output,
            }),
            Err(Error::Connection { message, .. }) => {
                warn!(address = %self.host.address, %message, "connection dropped while rebooting");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn write_local(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Adds `./nixploy.nix` to the imports of a NixOS module. Does nothing if it is already imported.
pub fn patch_imports(config: &str) -> Result<String> {
    static IMPORTS: OnceLock<Regex> = OnceLock::new();
    static BODY: OnceLock<Regex> = OnceLock::new();

    let import = format!("./{MODULE_FILE}");
    if config.contains(&import) {
        return Ok(config.to_owned());
    }

    let imports = IMPORTS.get_or_init(|| Regex::new(r"imports\s*=\s*\[").unwrap());
    if let Some(m) = imports.find(config) {
        return Ok(format!(
            "{}\n      {import}{}",
            &config[..m.end()],
            &config[m.end()..],
        ));
    }

    // No imports list. Start one at the top of the module's attribute set.
    let body = BODY.get_or_init(|| Regex::new(r"\}\s*:\s*\{").unwrap());
    if let Some(m) = body.find(config) {
        return Ok(format!(
            "{}\n  imports = [ {import} ];\n{}",
            &config[..m.end()],
            &config[m.end()..],
        ));
    }

    Err(anyhow!(
        "could not find where to import {import} in configuration.nix; add it to the module's \
        imports by hand"
    )
    .into())
}

/// Renders the module that makes an installed host manageable: its name, boot loader, and the
/// services that store-key and deploy rely on.
pub fn render_module(hostname: &str, device: &str) -> String {
    format!(
        r#"# Generated by nixploy on every bootstrap. Put your own settings in configuration.nix.
{{ lib, pkgs, ... }}:

{{
  networking.hostName = "{hostname}";

  boot.loader.grub.device = lib.mkDefault "{device}";

  # Root logs in with a password until store-key installs the login key.
  services.openssh.enable = true;
  services.openssh.settings.PermitRootLogin = lib.mkDefault "yes";

  # The receive hook needs git; deploys build flakes.
  environment.systemPackages = [ pkgs.git ];
  nix.settings.experimental-features = [ "nix-command" "flakes" ];
}}
"#
    )
}
