//! opsman, an operations manager for a multi-host software deployment.
//!
//! Tracks installed packages and dispatches service lifecycle commands to
//! the local host or to every host registered for a service. The `--local`
//! flag on service commands is the remote wire mode: it runs the local
//! dispatcher and prints exactly one status token on stdout, which the
//! remote dispatcher on the calling side parses back.

mod render;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ops_config::{ServiceRegistry, SiteConfig};
use ops_dispatch::{Dispatcher, HandlerRegistry, LocalDispatcher, RemoteDispatcher};
use ops_proto::{Command as ServiceOp, Status};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "opsman")]
#[command(about = "Operations manager for a multi-host deployment")]
#[command(version)]
struct Cli {
    /// Directory containing site.json and services.json
    #[arg(long, env = "OPSMAN_CONFIG_DIR", default_value = "/etc/opsman")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage deployment services
    Service {
        #[command(subcommand)]
        command: ServiceCommands,
    },

    /// Query the site configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Manage installed packages
    Packages {
        #[command(subcommand)]
        command: PackageCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ServiceCommands {
    /// List registered services
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Start a service on its registered hosts
    Start {
        service: String,
        /// Run on the current host only and print a single status token
        #[arg(long)]
        local: bool,
        /// Emit JSON instead of a table
        #[arg(long, conflicts_with = "local")]
        json: bool,
    },

    /// Stop a service on its registered hosts
    Stop {
        service: String,
        /// Run on the current host only and print a single status token
        #[arg(long)]
        local: bool,
        /// Emit JSON instead of a table
        #[arg(long, conflicts_with = "local")]
        json: bool,
    },

    /// Restart a service on its registered hosts
    Restart {
        service: String,
        /// Run on the current host only and print a single status token
        #[arg(long)]
        local: bool,
        /// Emit JSON instead of a table
        #[arg(long, conflicts_with = "local")]
        json: bool,
    },

    /// Show the status of a service on its registered hosts
    Status {
        service: String,
        /// Run on the current host only and print a single status token
        #[arg(long)]
        local: bool,
        /// Emit JSON instead of a table
        #[arg(long, conflicts_with = "local")]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Read values from the site configuration
    Get {
        #[arg(required = true)]
        keys: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PackageCommands {
    /// Show installed packages and their source-control state
    Status {
        /// Only packages whose name contains this
        #[arg(default_value = "")]
        filter: String,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check out a git reference in a package's source checkout
    Checkout { package: String, reference: String },

    /// Pull the package's branch and reinstall it
    Upgrade { package: String },
}

/// `--local` service commands reply on stdout with a single status token;
/// tracing must stay out of that stream.
fn is_wire_mode(command: &Commands) -> bool {
    match command {
        Commands::Service { command } => matches!(
            command,
            ServiceCommands::Start { local: true, .. }
                | ServiceCommands::Stop { local: true, .. }
                | ServiceCommands::Restart { local: true, .. }
                | ServiceCommands::Status { local: true, .. }
        ),
        _ => false,
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if !is_wire_mode(&cli.command) {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(
                EnvFilter::from_default_env()
                    .add_directive("opsman=info".parse()?)
                    .add_directive("ops_dispatch=info".parse()?)
                    .add_directive("ops_config=info".parse()?)
                    .add_directive("ops_packages=info".parse()?),
            )
            .init();
    }

    match cli.command {
        Commands::Service { command } => service_command(&cli.config_dir, command),
        Commands::Config { command } => config_command(&cli.config_dir, command),
        Commands::Packages { command } => package_command(&cli.config_dir, command),
    }
}

fn load_site(config_dir: &Path) -> Result<SiteConfig> {
    let path = config_dir.join("site.json");
    SiteConfig::load(&path).with_context(|| format!("load site config from {}", path.display()))
}

fn load_registry(config_dir: &Path) -> Result<ServiceRegistry> {
    let path = config_dir.join("services.json");
    ServiceRegistry::load(&path)
        .with_context(|| format!("load service registry from {}", path.display()))
}

// ─── Services ────────────────────────────────────────────────────────────────

fn service_command(config_dir: &Path, command: ServiceCommands) -> Result<()> {
    let site = load_site(config_dir)?;
    let registry = load_registry(config_dir)?;

    match command {
        ServiceCommands::List { json } => {
            if json {
                print!("{}", render::render_json(registry.services()));
                return Ok(());
            }
            let rows: Vec<Vec<String>> = registry
                .services()
                .iter()
                .map(|s| {
                    vec![
                        s.name.clone(),
                        s.description.clone(),
                        if s.hosts.is_empty() {
                            "-".to_string()
                        } else {
                            s.hosts.join(", ")
                        },
                    ]
                })
                .collect();
            print!("{}", render::render_table(&["NAME", "DESCRIPTION", "HOSTS"], &rows));
            Ok(())
        }
        ServiceCommands::Start { service, local, json } => {
            run_op(site, registry, &service, ServiceOp::Start, local, json)
        }
        ServiceCommands::Stop { service, local, json } => {
            run_op(site, registry, &service, ServiceOp::Stop, local, json)
        }
        ServiceCommands::Restart { service, local, json } => {
            run_op(site, registry, &service, ServiceOp::Restart, local, json)
        }
        ServiceCommands::Status { service, local, json } => {
            run_op(site, registry, &service, ServiceOp::Status, local, json)
        }
    }
}

fn run_op(
    site: SiteConfig,
    registry: ServiceRegistry,
    service: &str,
    op: ServiceOp,
    local: bool,
    json: bool,
) -> Result<()> {
    let descriptor = registry.get_service(service)?.clone();
    let use_local = local || descriptor.hosts.is_empty();
    tracing::debug!(service, hosts = descriptor.hosts.len(), use_local, "dispatching");

    let results = if use_local {
        LocalDispatcher::new(registry, HandlerRegistry::builtin(), site).run(op, service)?
    } else {
        RemoteDispatcher::new(registry, HandlerRegistry::builtin(), &site).run(op, service)?
    };

    if local {
        // Wire reply: one token, exit 0 even for a failed result. Only
        // configuration errors (handled above via ?) exit non-zero.
        let status = results.first().map(|r| r.status).unwrap_or(Status::Unknown);
        println!("{status}");
        return Ok(());
    }

    if json {
        print!("{}", render::render_json(&results));
        return Ok(());
    }

    let width = results.iter().map(|r| r.hostname.len()).max().unwrap_or(0);
    for result in &results {
        println!(
            "{:<width$}  {}",
            result.hostname,
            render::styled_status(result.status)
        );
    }
    Ok(())
}

// ─── Config ──────────────────────────────────────────────────────────────────

fn config_command(config_dir: &Path, command: ConfigCommands) -> Result<()> {
    let site = load_site(config_dir)?;

    match command {
        ConfigCommands::Get { keys } => {
            for key in keys {
                println!("{key}: {}", site.get(&key).unwrap_or("-"));
            }
            Ok(())
        }
    }
}

// ─── Packages ────────────────────────────────────────────────────────────────

fn package_command(config_dir: &Path, command: PackageCommands) -> Result<()> {
    let site = load_site(config_dir)?;
    let deploy_root = PathBuf::from(
        site.get("deploy_root")
            .context("deploy_root not set in site config")?,
    );

    match command {
        PackageCommands::Status { filter, json } => {
            let packages = ops_packages::list_packages(&deploy_root, &filter);
            if json {
                print!("{}", render::render_json(&packages));
                return Ok(());
            }
            let rows: Vec<Vec<String>> = packages
                .into_iter()
                .map(|p| {
                    vec![
                        p.name,
                        p.version,
                        p.branch.unwrap_or_else(|| "-".to_string()),
                        if p.editable { "yes" } else { "no" }.to_string(),
                        p.path
                            .map(|path| path.display().to_string())
                            .unwrap_or_else(|| "-".to_string()),
                    ]
                })
                .collect();
            print!(
                "{}",
                render::render_table(&["NAME", "VERSION", "BRANCH", "EDITABLE", "PATH"], &rows)
            );
            Ok(())
        }
        PackageCommands::Checkout { package, reference } => {
            let pkg = ops_packages::get_package(&deploy_root, &package)
                .with_context(|| format!("package '{package}' is not installed"))?;
            if !ops_packages::switch_reference(&pkg, &reference) {
                bail!("could not checkout '{}' to '{reference}'", pkg.name);
            }
            println!("{} now at '{reference}'", pkg.name);
            Ok(())
        }
        PackageCommands::Upgrade { package } => {
            let pkg = ops_packages::get_package(&deploy_root, &package)
                .with_context(|| format!("package '{package}' is not installed"))?;
            let installer = site.get_or("installer", "pip");
            if !ops_packages::pull(&pkg, installer) {
                bail!("could not upgrade '{}'", pkg.name);
            }
            println!("{} upgraded", pkg.name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_mode_only_for_local_service_commands() {
        let local = Commands::Service {
            command: ServiceCommands::Start {
                service: "apache".to_string(),
                local: true,
                json: false,
            },
        };
        let remote = Commands::Service {
            command: ServiceCommands::Start {
                service: "apache".to_string(),
                local: false,
                json: false,
            },
        };
        let config = Commands::Config {
            command: ConfigCommands::Get {
                keys: vec!["site_id".to_string()],
            },
        };

        assert!(is_wire_mode(&local));
        assert!(!is_wire_mode(&remote));
        assert!(!is_wire_mode(&config));
    }

    #[test]
    fn test_cli_parses_service_start() {
        let cli = Cli::try_parse_from(["opsman", "service", "start", "apache", "--local"])
            .expect("parse");
        assert!(is_wire_mode(&cli.command));
    }

    #[test]
    fn test_cli_parses_json_flag() {
        let cli = Cli::try_parse_from(["opsman", "service", "status", "apache", "--json"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Service {
                command: ServiceCommands::Status { json: true, local: false, .. },
            }
        ));
    }

    #[test]
    fn test_cli_rejects_json_in_wire_mode() {
        // --local replies with a bare status token; JSON would corrupt it.
        let err =
            Cli::try_parse_from(["opsman", "service", "start", "apache", "--local", "--json"])
                .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }
}
