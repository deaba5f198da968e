//! Build-and-activate mechanisms that the receive hook runs against a pushed tree.
//!
//! The hook only consumes an [Activator]'s exit status and output. Any mechanism that can be
//! expressed as a shell script run from the root of the flake can be substituted without touching
//! the rest of the deploy path.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Signals ignored while the new configuration is being activated.
const ACTIVATION_SIGNALS: &str = "HUP INT TERM PIPE";

/// Renders the part of the receive hook that builds and activates a tree.
///
/// The script runs with `set -eu`, with the flake's directory as its working directory, and with
/// `$tree` set to that directory. A non-zero exit rejects the push.
pub trait Activator {
    fn script(&self, flake_attr: &str) -> String;
}

/// What `nixos-rebuild` does with the built system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildAction {
    /// Activate now and make it the boot default.
    #[default]
    Switch,

    /// Make it the boot default without activating.
    Boot,

    /// Activate now without changing the boot default.
    Test,
}

impl fmt::Display for RebuildAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RebuildAction::Switch => "switch",
            RebuildAction::Boot => "boot",
            RebuildAction::Test => "test",
        })
    }
}

/// Builds and activates with `nixos-rebuild`.
///
/// The build runs first and may be interrupted safely. Activation then runs with hangup,
/// interrupt, termination, and broken-pipe signals ignored, so an operator interrupt or a dropped
/// connection cannot leave a half-switched system.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NixosRebuild {
    pub action: RebuildAction,
}

impl Activator for NixosRebuild {
    fn script(&self, flake_attr: &str) -> String {
        // Activation output goes to a file first: with the pushing client gone, writing to the
        // pipe would fail and could abort the switch.
        let target = format!("\"$tree#{flake_attr}\"");
        format!(
            "nixos-rebuild build --flake {target} 2>&1\n\
            trap '' {ACTIVATION_SIGNALS}\n\
            log=$(mktemp)\n\
            status=0\n\
            nixos-rebuild {} --flake {target} >\"$log\" 2>&1 || status=$?\n\
            cat \"$log\" || true\n\
            rm -f \"$log\"\n\
            exit \"$status\"\n",
            self.action,
        )
    }
}

/// Runs an operator-supplied shell command from the root of the flake.
///
/// `$NIXPLOY_FLAKE_ATTR` holds the configuration's name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub command: String,
}

impl Activator for ShellCommand {
    fn script(&self, flake_attr: &str) -> String {
        // The attribute is a validated host name, so it needs no quoting.
        format!(
            "NIXPLOY_FLAKE_ATTR={flake_attr}\nexport NIXPLOY_FLAKE_ATTR\n{}\n",
            self.command.trim_end(),
        )
    }
}

/// The configurable choice of [Activator].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Activation {
    NixosRebuild(RebuildAction),
    Command(String),
}

impl Default for Activation {
    fn default() -> Self {
        Activation::NixosRebuild(RebuildAction::default())
    }
}

impl Activation {
    pub fn activator(&self) -> Box<dyn Activator> {
        match self {
            Activation::NixosRebuild(action) => Box::new(NixosRebuild { action: *action }),
            Activation::Command(command) => Box::new(ShellCommand {
                command: command.clone(),
            }),
        }
    }
}
