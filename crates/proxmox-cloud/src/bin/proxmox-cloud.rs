//! proxmox-cloud CLI - drive Proxmox VE guests from a profile file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use proxmox_cloud::config::DEFAULT_PROVIDER;
use proxmox_cloud::params::parse_kwargs;
use proxmox_cloud::{CallKind, CloudConfig, Params, ProxmoxClient, ProxmoxDriver, SshBootstrap};

/// proxmox-cloud - Proxmox VE VM and container lifecycle.
#[derive(Parser)]
#[command(name = "proxmox-cloud")]
#[command(about = "Create, inspect, power and destroy Proxmox VE guests")]
struct Cli {
    /// Provider and profile file (or set `PROXMOX_CLOUD_CONFIG` env var).
    #[arg(long, env = "PROXMOX_CLOUD_CONFIG")]
    config: PathBuf,

    /// Provider entry to use (or set `PROXMOX_CLOUD_PROVIDER` env var).
    #[arg(long, env = "PROXMOX_CLOUD_PROVIDER", default_value = DEFAULT_PROVIDER)]
    provider: String,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a driver function with key=value arguments.
    Function {
        /// Function name (clone, avail_locations, avail_images, list_nodes, ...).
        function: String,

        /// Arguments as key=value.
        kwargs: Vec<String>,
    },

    /// Call a driver action on a named VM with key=value arguments.
    Action {
        /// Action name (start, stop, shutdown, reconfigure, show_instance, destroy).
        action: String,

        /// VM name.
        name: String,

        /// Arguments as key=value.
        kwargs: Vec<String>,
    },

    /// Create a VM from a profile.
    Create {
        /// Profile name from the config file.
        #[arg(long)]
        profile: String,

        /// Name of the new VM.
        #[arg(long)]
        name: String,

        /// Wait for SSH and pipe this script to the guest.
        #[arg(long)]
        deploy_script: Option<PathBuf>,

        /// Skip waiting for SSH.
        #[arg(long, default_value = "false")]
        no_bootstrap: bool,
    },

    /// Destroy a VM.
    Destroy {
        /// VM name.
        name: String,
    },

    /// List managed VMs.
    List {
        /// Include config and inventory record (JSON).
        #[arg(long, default_value = "false")]
        full: bool,
    },

    /// Show details of a VM.
    Show {
        /// VM name.
        name: String,
    },

    /// List online cluster nodes.
    Locations,

    /// List templates, disk images and ISOs.
    Images {
        /// Storage to search.
        #[arg(long, default_value = "local")]
        storage: String,
    },
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to render output")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = CloudConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let provider = config
        .provider(&cli.provider)
        .context("Failed to select provider")?;
    let client = ProxmoxClient::new(provider).context("Failed to create Proxmox client")?;
    let driver = ProxmoxDriver::new(client);

    match cli.command {
        Commands::Function { function, kwargs } => {
            let params = parse_kwargs(&kwargs)?;
            let result = driver.call_function(&function, params).await?;
            print_json(&result)?;
        }

        Commands::Action {
            action,
            name,
            kwargs,
        } => {
            let params = parse_kwargs(&kwargs)?;
            let result = driver.call_action(&action, &name, params).await?;
            print_json(&result)?;
        }

        Commands::Create {
            profile,
            name,
            deploy_script,
            no_bootstrap,
        } => {
            let profile = config.profile(&profile, &name)?;
            let driver = if no_bootstrap {
                driver
            } else {
                let mut bootstrap = SshBootstrap::default();
                if let Some(script) = deploy_script {
                    bootstrap = bootstrap.with_deploy_script(script);
                }
                driver.with_bootstrapper(Arc::new(bootstrap))
            };

            info!("Creating VM: {name}");
            let result = driver.create(&profile).await?;
            print_json(&Value::Object(result))?;
        }

        Commands::Destroy { name } => {
            driver.destroy(CallKind::Action, &name, Params::new()).await?;
            info!("Destroyed VM: {name}");
        }

        Commands::List { full } => {
            if full {
                print_json(&driver.list_nodes_full(CallKind::Function).await?)?;
            } else {
                let nodes = driver.list_nodes(CallKind::Function).await?;
                println!(
                    "\n{:<24} {:<8} {:<10} {:<18} {:<18}",
                    "NAME", "ID", "STATE", "PRIVATE IP", "PUBLIC IP"
                );
                println!("{}", "-".repeat(80));
                for (name, node) in nodes {
                    println!(
                        "{:<24} {:<8} {:<10} {:<18} {:<18}",
                        name,
                        node.id,
                        node.state,
                        node.private_ips.first().map_or("", String::as_str),
                        node.public_ips.first().map_or("", String::as_str),
                    );
                }
            }
        }

        Commands::Show { name } => {
            let details = driver.show_instance(CallKind::Action, &name).await?;
            println!("\nVM Details:");
            println!("  Name:        {name}");
            println!("  ID:          {}", details.id);
            println!("  Node:        {}", details.resource.node);
            println!("  Technology:  {}", details.resource.technology);
            println!("  State:       {}", details.state);
            println!("  Private IPs: {}", details.private_ips.join(", "));
            println!("  Public IPs:  {}", details.public_ips.join(", "));
        }

        Commands::Locations => {
            let nodes = driver.avail_locations(CallKind::Function).await?;
            println!("\n{:<24} {:<10}", "NODE", "STATUS");
            println!("{}", "-".repeat(36));
            for (name, node) in nodes {
                println!("{:<24} {:<10}", name, node.status.unwrap_or_default());
            }
        }

        Commands::Images { storage } => {
            let mut params = Params::new();
            params.insert("storage".into(), Value::String(storage));
            let images = driver.avail_images(CallKind::Function, &params).await?;
            println!("\n{:<16} {:<8} {:<60}", "NODE", "CONTENT", "VOLID");
            println!("{}", "-".repeat(86));
            for (location, volumes) in images {
                for (volid, volume) in volumes {
                    println!("{:<16} {:<8} {:<60}", location, volume.content, volid);
                }
            }
        }
    }

    Ok(())
}
