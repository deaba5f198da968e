//! The remote bare repository and its receive hook.
//!
//! The hook runs as `pre-receive`, so a push whose build or activation fails is rejected before
//! the ref moves: the remote history only ever contains commits that were activated.

use crate::activate::Activator;
use crate::error::{Error, Result};
use crate::session::{quote, Session};
use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// The hook's name inside the bare repository.
pub const HOOK: &str = "hooks/pre-receive";

/// The inputs of the receive hook.
pub struct Hook<'a> {
    /// The only ref that may be pushed, e.g. `refs/heads/main`.
    pub deploy_ref: &'a str,

    /// Where the last activated tree is kept.
    pub working_dir: &'a str,

    /// The flake's directory relative to the repository root. Empty for the root.
    pub flake_dir: &'a str,

    /// The `nixosConfigurations` attribute to build.
    pub flake_attr: &'a str,

    pub activator: &'a dyn Activator,
}

impl Hook<'_> {
    /// Renders the hook script.
    ///
    /// The pushed commit is exported into a staging directory next to the working dir and
    /// activated from there. The staging directory replaces the working dir only once activation
    /// succeeds; a failure leaves the previous tree in place and rejects the push.
    pub fn render(&self) -> Result<String> {
        let tree = if self.flake_dir.is_empty() {
            "\"$staging\"".to_owned()
        } else {
            format!("\"$staging\"/{}", quote(self.flake_dir)?)
        };
        let activation: String = self
            .activator
            .script(self.flake_attr)
            .lines()
            .map(|line| format!("    {line}\n"))
            .collect();

        Ok(format!(
            r#"#!/bin/sh
# Generated by nixploy. Rewritten by every `nixploy create`.
set -eu

deploy_ref={deploy_ref}
work={work}
staging="$work.incoming"

while read -r old new ref; do
    if [ "$ref" != "$deploy_ref" ]; then
        echo "nixploy: only $deploy_ref can be pushed, not $ref" >&2
        exit 1
    fi
    case "$new" in
        *[!0]*) ;;
        *) echo "nixploy: $ref cannot be deleted" >&2; exit 1 ;;
    esac

    rm -rf "$staging" "$staging.tar"
    mkdir -p "$staging"
    git archive --format=tar -o "$staging.tar" "$new"
    tar -xf "$staging.tar" -C "$staging"
    rm -f "$staging.tar"

    echo "nixploy: activating $new (was $old)" >&2
    tree={tree}
    (
    unset GIT_DIR GIT_QUARANTINE_PATH GIT_OBJECT_DIRECTORY GIT_ALTERNATE_OBJECT_DIRECTORIES
    cd "$tree"
{activation}    )

    rm -rf "$work"
    mv "$staging" "$work"
    echo "nixploy: activated $new" >&2
done
"#,
            deploy_ref = quote(self.deploy_ref)?,
            work = quote(self.working_dir)?,
        ))
    }
}

/// Creates the bare repository at `bare` if needed, hardens it, and installs `hook`.
///
/// Existing history is never touched.
pub fn initialize(session: &mut dyn Session, bare: &str, branch: &str, hook: &str) -> Result<()> {
    let repo = quote(bare)?;
    let head = quote(&format!("refs/heads/{branch}"))?;
    let command = format!(
        "mkdir -p {repo} && git init --bare --quiet {repo} && \
        git -C {repo} config receive.denyNonFastForwards true && \
        git -C {repo} config receive.denyDeletes true && \
        git -C {repo} symbolic-ref HEAD {head}",
    );
    session.run(&command)?.check(&command)?;

    session.put_bytes(hook.as_bytes(), &format!("{bare}/{HOOK}"), 0o755)?;
    info!(address = session.address(), bare, "remote repository ready");
    Ok(())
}

/// Fills in what a new host needs in the local repository: its configuration, copied from the
/// host, and a `flake.nix` that builds it. Existing files are left alone.
///
/// Returns the files written, which the operator has to review and commit before deploying.
pub fn scaffold(
    session: &mut dyn Session,
    flake_root: &Path,
    hostname: &str,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    let host_dir = flake_root.join(hostname);
    if host_dir.join("configuration.nix").exists() {
        info!(path = %host_dir.display(), "host configuration present");
    } else {
        fs::create_dir_all(&host_dir)
            .with_context(|| format!("failed to create {}", host_dir.display()))?;
        for name in ["configuration.nix", "hardware-configuration.nix"] {
            let command = format!("cat /etc/nixos/{name}");
            let output = session.query(&command)?.check(&command)?;
            let path = host_dir.join(name);
            fs::write(&path, output.stdout)
                .with_context(|| format!("failed to write {}", path.display()))?;
            written.push(path);
        }
        warn!(
            path = %host_dir.display(),
            "copied the host's configuration; check that it keeps sshd and root login enabled",
        );
    }

    let flake = flake_root.join("flake.nix");
    if flake.exists() {
        let contents = fs::read_to_string(&flake)
            .with_context(|| format!("failed to read {}", flake.display()))?;
        if !contents.contains(hostname) {
            warn!(
                path = %flake.display(),
                "flake.nix does not mention nixosConfigurations.{hostname}; \
                add it before deploying",
            );
        }
    } else {
        fs::write(&flake, render_flake(hostname))
            .with_context(|| format!("failed to write {}", flake.display()))?;
        written.push(flake);
    }

    Ok(written)
}

/// Renders a minimal `flake.nix` with one configuration, `hostname`.
pub fn render_flake(hostname: &str) -> String {
    format!(
        r#"{{
  description = "NixOS hosts deployed with nixploy";

  inputs.nixpkgs.url = "github:NixOS/nixpkgs/nixos-unstable";

  outputs = {{ nixpkgs, ... }}: {{
    nixosConfigurations = {{
      {hostname} = nixpkgs.lib.nixosSystem {{
        system = "x86_64-linux";
        modules = [
          ./{hostname}/configuration.nix
          {{ nix.registry.nixpkgs.flake = nixpkgs; }}
        ];
      }};
    }};
  }};
}}
"#
    )
}

/// The local git remote name used for `hostname`.
pub fn remote_name(hostname: &str) -> String {
    format!("nixploy-{hostname}")
}

/// Fails unless `hostname` is usable as a flake attribute without quoting.
pub(crate) fn require_attr(hostname: &str) -> Result<()> {
    crate::bootstrap::validate_hostname(hostname).map_err(|_| {
        Error::InvalidInput(format!(
            "the host name {hostname:?} cannot be used as a flake attribute"
        ))
    })
}
