use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nook::{Config, Result, Store, schema};

#[derive(Parser)]
#[command(name = "nook")]
#[command(author, version, about = "Network and IP lease store for VM metadata", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "nook.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    ShowConfig,
    Migrate,
    ListNetworks,
    ListRanges {
        /// Only ranges of this network
        #[arg(long)]
        network: Option<String>,
    },
    ListLeases,
    ListMachines,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::ShowConfig) {
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Migrate => {
            let store = Store::open(&config).await?;
            let version = schema::current_version(store.database().pool()).await?;
            info!("Database {} is at schema version {}", config.database_path, version);
            println!("Schema version {}.", version);
            store.close().await;
            Ok(())
        }
        Commands::ListNetworks => {
            let store = Store::open(&config).await?;
            let networks = store.networks().find_all().await?;

            if networks.is_empty() {
                println!("No networks.");
            } else {
                println!(
                    "{:<6} {:<16} {:<10} {:<20} {:<16}",
                    "ID", "Name", "Bridge", "Subnet", "Gateway"
                );
                println!("{}", "-".repeat(72));

                for network in networks {
                    let gateway = network
                        .gateway
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{:<6} {:<16} {:<10} {:<20} {:<16}",
                        network.id, network.name, network.bridge, network.subnet, gateway
                    );
                }
            }

            store.close().await;
            Ok(())
        }
        Commands::ListRanges { network } => {
            let store = Store::open(&config).await?;
            let ranges = match network {
                Some(name) => {
                    let network = store.networks().find_by_name(&name).await?;
                    store.networks().dhcp_ranges(network.id).await?
                }
                None => store.dhcp_ranges().find_all().await?,
            };

            if ranges.is_empty() {
                println!("No DHCP ranges.");
            } else {
                println!(
                    "{:<6} {:<8} {:<16} {:<16} {:<10} {:<8}",
                    "ID", "Network", "Start", "End", "Lease", "Size"
                );
                println!("{}", "-".repeat(68));

                for range in ranges {
                    println!(
                        "{:<6} {:<8} {:<16} {:<16} {:<10} {:<8}",
                        range.id,
                        range.network_id,
                        range.start_ip,
                        range.end_ip,
                        range.lease_time,
                        range.size()
                    );
                }
            }

            store.close().await;
            Ok(())
        }
        Commands::ListLeases => {
            let store = Store::open(&config).await?;
            let leases = store.leases().find_all().await?;

            if leases.is_empty() {
                println!("No active leases.");
            } else {
                println!(
                    "{:<8} {:<8} {:<16} {:<10} {:<24}",
                    "Machine", "Network", "IP Address", "Lease", "Expires At"
                );
                println!("{}", "-".repeat(70));

                for lease in leases {
                    let expires = match lease.expires_at()? {
                        Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        None => "never".to_string(),
                    };
                    println!(
                        "{:<8} {:<8} {:<16} {:<10} {:<24}",
                        lease.machine_id,
                        lease.network_id,
                        lease.ip_address,
                        lease.lease_time,
                        expires
                    );
                }
            }

            store.close().await;
            Ok(())
        }
        Commands::ListMachines => {
            let store = Store::open(&config).await?;
            let machines = store.machines().list().await?;

            if machines.is_empty() {
                println!("No machines.");
            } else {
                println!(
                    "{:<6} {:<20} {:<24} {:<16} {:<8}",
                    "ID", "Name", "Hostname", "IPv4", "Network"
                );
                println!("{}", "-".repeat(78));

                for machine in machines {
                    let ipv4 = machine
                        .ipv4
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    let network = machine
                        .network_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "static".to_string());
                    println!(
                        "{:<6} {:<20} {:<24} {:<16} {:<8}",
                        machine.id, machine.name, machine.hostname, ipv4, network
                    );
                }
            }

            store.close().await;
            Ok(())
        }
    }
}
