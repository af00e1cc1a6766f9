//! cloudnode CLI - power control and provisioning against a cloud
//! application VM API.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloudnode::api::{ApplicationApi, CloudClient};
use cloudnode::nodes::{NodeRecord, NodesFile, PowerCredentials};
use cloudnode::power::{boot_device, BootDevice, PowerManager};
use cloudnode::provision::{NodeSpec, Provisioner};
use cloudnode::retry::AttemptState;
use cloudnode::Config;

/// cloudnode CLI - manage provisioning-manager nodes on a cloud VM API.
#[derive(Parser)]
#[command(name = "cloudnode")]
#[command(about = "Provision and power-control nodes backed by cloud VMs")]
struct Cli {
    /// API username (or set `CLOUDNODE_USERNAME` env var).
    #[arg(long, env = "CLOUDNODE_USERNAME")]
    username: String,

    /// API password (or set `CLOUDNODE_PASSWORD` env var).
    #[arg(long, env = "CLOUDNODE_PASSWORD")]
    password: String,

    /// Application name (or set `CLOUDNODE_APPLICATION` env var).
    #[arg(long, env = "CLOUDNODE_APPLICATION")]
    application: String,

    /// API base URL override.
    #[arg(long, env = "CLOUDNODE_API_URL")]
    api_url: Option<String>,

    /// Minimum remaining runtime in minutes before power actions.
    #[arg(long, default_value = "120")]
    min_runtime: u64,

    /// Path of the node-description file.
    #[arg(long, default_value = "nodes.json")]
    nodes_file: PathBuf,

    /// Private key file dumped as the nodes' power-management password.
    #[arg(long)]
    ssh_key_file: Option<PathBuf>,

    /// Base image id attached to new nodes' CDROM drives.
    #[arg(long)]
    iso_image_id: Option<u64>,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List running nodes (--all lists every node).
    List {
        /// List all nodes instead of only running ones.
        #[arg(long, default_value = "false")]
        all: bool,

        /// Read the node-description file instead of the API.
        #[arg(long, default_value = "false")]
        cached: bool,
    },

    /// Create new nodes.
    Create {
        /// Number of CPUs per node.
        #[arg(short, long, default_value = "2")]
        cpus: u32,

        /// Memory per node in MB.
        #[arg(short, long, default_value = "8192")]
        memory: u64,

        /// Disk size per node in GB.
        #[arg(short = 'D', long, default_value = "60")]
        disk: u64,

        /// Number of nodes to create.
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,
    },

    /// Dump node definitions to the node-description file.
    Dump,

    /// Start a node (power-cycles it when already running).
    Start {
        /// Node name.
        node: String,
    },

    /// Stop a node.
    Stop {
        /// Node name.
        node: String,
    },

    /// Reboot a node.
    Reboot {
        /// Node name.
        node: String,
    },

    /// Print the boot device of a node (`hd` or `network`).
    GetBootDevice {
        /// Node name.
        node: String,
    },

    /// Set the boot device of a node.
    SetBootDevice {
        /// Node name.
        node: String,

        /// Boot device: `hd` or `network`.
        device: String,
    },

    /// Print the MAC addresses of a node.
    GetMacs {
        /// Node name.
        node: String,

        /// Read the node-description file instead of the API.
        #[arg(long, default_value = "false")]
        cached: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config {
        username: cli.username.clone(),
        password: cli.password.clone(),
        application: cli.application.clone(),
        api_url: cli.api_url.clone(),
        min_runtime: Duration::from_secs(cli.min_runtime * 60),
        nodes_file: cli.nodes_file.clone(),
        ssh_key_file: cli.ssh_key_file.clone(),
        iso_image_id: cli.iso_image_id,
    };

    let mut client = CloudClient::new(&config.username, &config.password)
        .context("Failed to create API client")?;
    if let Some(url) = &config.api_url {
        client = client.with_base_url(url);
    }

    match cli.command {
        Commands::List { all, cached } => {
            // The provisioning manager polls this constantly; answer from
            // the dumped file when allowed so the API is left alone.
            if all && cached && config.nodes_file.exists() {
                let file = NodesFile::load(&config.nodes_file)?;
                for node in file.nodes {
                    println!("{}", node.name);
                }
                return Ok(());
            }

            let app = client.find_application(&config.application).await?;
            for vm in app.managed_nodes() {
                if all || vm.state.is_some_and(cloudnode::api::VmState::is_running) {
                    println!("{}", vm.name);
                }
            }
        }

        Commands::Create {
            cpus,
            memory,
            disk,
            count,
        } => {
            let app = client.find_application(&config.application).await?;
            let mut state = AttemptState::new(app);

            let provisioner = Provisioner::new(&client, config.min_runtime, config.iso_image_id);
            let created = provisioner
                .create_nodes(
                    &mut state,
                    NodeSpec {
                        cpus,
                        memory_mb: memory,
                        disk_gb: disk,
                        count,
                    },
                )
                .await?;

            println!(
                "Created {} node{}: {}.",
                created.len(),
                if created.len() > 1 { "s" } else { "" },
                created.join(", ")
            );
        }

        Commands::Dump => {
            let key_file = config
                .ssh_key_file
                .as_ref()
                .context("--ssh-key-file is required for dump")?;
            let key = std::fs::read_to_string(key_file).with_context(|| {
                format!("cannot read key file `{}`", key_file.display())
            })?;
            let credentials = PowerCredentials {
                user: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
                key,
            };

            let app = client.find_application(&config.application).await?;
            let file = NodesFile {
                nodes: app
                    .managed_nodes()
                    .iter()
                    .map(|vm| NodeRecord::from_vm(vm, &credentials))
                    .collect(),
            };
            file.save(&config.nodes_file)?;

            println!(
                "Wrote {} nodes to `{}`.",
                file.nodes.len(),
                config.nodes_file.display()
            );
        }

        Commands::Start { node } => {
            info!("Starting node: {node}");
            let app = client.find_application(&config.application).await?;
            let mut state = AttemptState::new(app);
            PowerManager::new(&client, config.min_runtime)
                .start(&mut state, &node)
                .await?;
            println!("Node `{node}` started.");
        }

        Commands::Stop { node } => {
            info!("Stopping node: {node}");
            let app = client.find_application(&config.application).await?;
            let mut state = AttemptState::new(app);
            PowerManager::new(&client, config.min_runtime)
                .stop(&mut state, &node)
                .await?;
            println!("Node `{node}` stopped.");
        }

        Commands::Reboot { node } => {
            info!("Rebooting node: {node}");
            let app = client.find_application(&config.application).await?;
            let mut state = AttemptState::new(app);
            PowerManager::new(&client, config.min_runtime)
                .reboot(&mut state, &node)
                .await?;
            println!("Node `{node}` rebooted.");
        }

        Commands::GetBootDevice { node } => {
            let app = client.find_application(&config.application).await?;
            println!("{}", boot_device(&app, &node)?);
        }

        Commands::SetBootDevice { node, device } => {
            let device: BootDevice = device.parse()?;
            info!("Setting boot device for node `{node}` to `{device}`");
            let app = client.find_application(&config.application).await?;
            let mut state = AttemptState::new(app);
            PowerManager::new(&client, config.min_runtime)
                .set_boot_device(&mut state, &node, device)
                .await?;
            println!("Boot device for `{node}` set to `{device}`.");
        }

        Commands::GetMacs { node, cached } => {
            if cached && config.nodes_file.exists() {
                let file = NodesFile::load(&config.nodes_file)?;
                if let Some(macs) = file.macs_for(&node) {
                    for mac in macs {
                        println!("{mac}");
                    }
                    return Ok(());
                }
            }

            let app = client.find_application(&config.application).await?;
            let vm = app.vm_by_name(cloudnode::api::AppScope::Deployment, &node)?;
            for mac in vm.macs() {
                println!("{mac}");
            }
        }
    }

    Ok(())
}
