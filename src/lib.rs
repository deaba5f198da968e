//! Provision and update NixOS hosts over ssh.
//!
//! # Lifecycle
//!
//! A host moves through four commands, in order:
//!
//! 1. `bootstrap` installs NixOS on a host booted into the installer image, sets its host name and
//!    root password, and records its ssh host key.
//! 2. `store-key` installs the operator's login key, proves that it works, and retires password
//!    login.
//! 3. `create` creates a bare git repository on the host with a receive hook that builds and
//!    activates every push, and points a local git remote at it.
//! 4. `deploy` pushes the local repository's HEAD. The push succeeds only if the host built and
//!    activated it. Repeat as needed.
//!
//! Nothing is evaluated or built locally. The host does all of that inside the receive hook.
//!
//! # Program flow
//!
//! The binary parses arguments and prompts for anything missing, then hands off to a
//! [lifecycle::Deployer]. The deployer keeps one [state::HostRecord] per host and advances it
//! only after a step succeeds. Remote work happens through the [session::Session] trait, so the
//! state machine runs unchanged against the fakes in `testing`, which is compiled only for tests
//! and with the `testing` feature.

pub mod activate;
pub mod bootstrap;
pub mod config;
pub mod credential;
pub mod deploy;
pub mod error;
pub mod git;
pub mod key_exchange;
pub mod known_hosts;
pub mod lifecycle;
pub mod local;
pub mod repository;
pub mod session;
pub mod state;

#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

#[doc(inline)]
pub use error::{Error, Result};
#[doc(inline)]
pub use lifecycle::Deployer;
