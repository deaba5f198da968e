use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser, Subcommand};
use nixploy::bootstrap::{validate_hostname, Host};
use nixploy::config::{self, Config};
use nixploy::session::{interactive_shell, SshConnector};
use nixploy::state::{HostRecord, Stage};
use nixploy::{Deployer, Error, Result};
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Provision and deploy NixOS hosts over ssh.
#[derive(Debug, Parser)]
#[command(name = "nixploy", version)]
struct Cli {
    /// Where host records, known host keys, and config.yaml live [default: ~/.config/nixploy]
    #[arg(long, env = "NIXPLOY_HOME", global = true)]
    state_dir: Option<PathBuf>,

    /// The flake's directory in the local git repository
    #[arg(long, default_value = ".", global = true)]
    repo: PathBuf,

    /// Log more detail; repeat for even more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Erase a host booted into the NixOS installer and install NixOS on it
    Bootstrap {
        address: String,
        hostname: String,

        /// The installer's temporary root password [prompted if missing]
        #[arg(long, env = "NIXPLOY_INSTALLER_PASSWORD", hide_env_values = true)]
        installer_password: Option<String>,

        /// The installed system's root password [prompted if missing]
        #[arg(long, env = "NIXPLOY_ROOT_PASSWORD", hide_env_values = true)]
        root_password: Option<String>,

        /// Reinstall a host that was already bootstrapped
        #[arg(short, long)]
        force: bool,

        /// Don't ask for confirmation before erasing the disk
        #[arg(short, long)]
        yes: bool,
    },

    /// Install the login key and retire password login
    StoreKey {
        address: String,

        /// The root password, if it differs from the one set by bootstrap
        #[arg(long, env = "NIXPLOY_ROOT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Create the remote repository and its deploy hook
    Create { address: String },

    /// Push HEAD to the host, which builds and activates it
    Deploy {
        address: String,

        /// Activate again even if the host already has HEAD
        #[arg(short, long)]
        force: bool,
    },

    /// Fetch the deployed history into the local repository
    Pull { address: String },

    /// Open a root shell on the host
    Ssh { address: String },

    /// Show what is known about one host, or all of them
    Status { address: Option<String> },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            report(&error);
            ExitCode::from(error.exit_code())
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "nixploy=info",
        1 => "nixploy=debug",
        _ => "nixploy=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("NIXPLOY_LOG").unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .without_time()
        .init();
}

/// Prints `error` along with any remote output the operator has not seen yet.
fn report(error: &Error) {
    if let Some(output) = error.output() {
        if !output.echoed {
            print!("{}", output.stdout);
            let _ = io::stdout().flush();
            eprint!("{}", output.stderr);
        }
    }
    eprintln!("error: {error:#}");
}

fn run(cli: Cli) -> Result<()> {
    let state_dir = match cli.state_dir {
        Some(dir) => dir,
        None => config::default_state_dir()?,
    };
    let config = Config::load(&state_dir)?;
    let connector = SshConnector::new(&config)?;
    let mut deployer = Deployer::new(config, connector, cli.repo)?;

    match cli.command {
        Command::Bootstrap {
            address,
            hostname,
            installer_password,
            root_password,
            force,
            yes,
        } => {
            validate_hostname(&hostname)?;
            deployer.check_bootstrap(&address, force)?;
            let installer_password = match installer_password {
                Some(password) => password,
                None => dialoguer::Password::new()
                    .with_prompt("Installer root password")
                    .interact()
                    .context("password prompt")?,
            };
            let root_password = match root_password {
                Some(password) => password,
                None => dialoguer::Password::new()
                    .with_prompt("New root password")
                    .with_confirmation("Repeat root password", "Passwords do not match")
                    .interact()
                    .context("password prompt")?,
            };
            let host = Host {
                address,
                hostname,
                installer_password,
                root_password,
            };
            host.validate()?;

            let disk = &deployer.config().disk;
            println!("Bootstrapping {} over ssh", host.address);
            println!("  - Boot:      MBR");
            println!("  - Disk:      {}", disk.device);
            println!("  - Swap:      {} GiB", disk.swap_gib);
            println!("  - Host name: {}", host.hostname);
            if !yes {
                let confirmed = dialoguer::Confirm::new()
                    .with_prompt(format!(
                        "Erase {} on {} and install NixOS?",
                        disk.device, host.address,
                    ))
                    .default(false)
                    .interact()
                    .context("bootstrap confirmation")?;
                if !confirmed {
                    return Err(anyhow!("aborted").into());
                }
            }

            deployer.bootstrap(&host, force)?;
            println!(
                "{} is rebooting into NixOS. Next: nixploy store-key {}",
                host.hostname, host.address,
            );
        }

        Command::StoreKey { address, password } => {
            deployer.store_key(&address, password.as_deref())?;
            println!("Key login to {address} works and password login is retired.");
            println!("Next: nixploy create {address}");
        }

        Command::Create { address } => {
            let created = deployer.create(&address)?;
            println!("Git remote `{}` points at {}", created.remote, created.url);
            for path in &created.scaffolded {
                println!("Wrote {}", path.display());
            }
            if !created.scaffolded.is_empty() {
                println!("Review and commit these files before deploying.");
            }
            println!("Next: nixploy deploy {address}");
        }

        Command::Deploy { address, force } => {
            let outcome = deployer.deploy(&address, force)?;
            if outcome.up_to_date && !outcome.reactivated {
                println!("{address} already runs {}", outcome.commit);
            } else {
                println!("{address} now runs {}", outcome.commit);
            }
        }

        Command::Pull { address } => {
            deployer.pull(&address)?;
        }

        Command::Ssh { address } => {
            deployer
                .record(&address)?
                .require("open a shell on", Stage::KeyInstalled)?;
            let status = interactive_shell(deployer.connector(), &address, deployer.credential())?;
            if !status.success() {
                return Err(anyhow!("ssh exited with {status}").into());
            }
        }

        Command::Status { address } => match address {
            Some(address) => print_record(&deployer.record(&address)?),
            None => {
                for record in deployer.records()? {
                    println!(
                        "{:<24} {:<16} {:<14} {}",
                        record.address,
                        record.hostname.as_deref().unwrap_or("-"),
                        record.stage,
                        record.deployed_commit.as_deref().unwrap_or("-"),
                    );
                }
            }
        },
    }
    Ok(())
}

fn print_record(record: &HostRecord) {
    let field = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_owned());
    println!("address:          {}", record.address);
    println!("hostname:         {}", field(&record.hostname));
    println!("stage:            {}", record.stage);
    if record.bootstrap_pending {
        println!("                  (bootstrap did not finish)");
    }
    println!(
        "root password:    {}",
        if record.root_password.is_some() { "stored" } else { "-" },
    );
    println!("host key:         {}", field(&record.host_key));
    println!("git remote:       {}", field(&record.git_remote));
    println!("flake directory:  {}", field(&record.flake_dir));
    println!("deployed commit:  {}", field(&record.deployed_commit));
    match record.updated {
        Some(updated) => println!("updated:          {}", updated.to_rfc3339()),
        None => println!("updated:          -"),
    }
}
