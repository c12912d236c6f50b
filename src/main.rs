// vpcctl - host-local VPC control plane over Linux kernel networking.
// Thin command dispatcher; all topology work happens in the reconciler.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::deploy::WorkloadKind;
use crate::error::{Result, VpcError};
use crate::lock::StateLock;
use crate::model::SubnetKind;
use crate::net::ShellDriver;
use crate::reconcile::Reconciler;
use crate::store::Store;

mod alloc;
mod deploy;
mod error;
mod lock;
mod logging;
mod model;
mod net;
mod policy;
mod reconcile;
mod routing;
mod store;

#[derive(Parser, Debug)]
#[clap(name = "vpcctl", version, about = "Virtual Private Cloud control tool")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Seconds to wait for the state lock (0 = fail immediately)
    #[clap(long, global = true, default_value_t = 10)]
    lock_timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new VPC backed by a Linux bridge
    CreateVpc {
        #[clap(long, help = "VPC name")]
        name: String,
        #[clap(long, help = "CIDR block (e.g. 10.0.0.0/16)")]
        cidr: String,
    },

    /// Create a subnet (a namespace attached to the VPC bridge)
    CreateSubnet {
        #[clap(long, help = "VPC name")]
        vpc: String,
        #[clap(long, help = "Subnet name")]
        name: String,
        #[clap(long, help = "Subnet CIDR, contained in the VPC CIDR")]
        cidr: String,
        #[clap(long = "type", value_enum, default_value = "private")]
        kind: SubnetKind,
    },

    /// Establish peering between two VPCs
    Peer {
        #[clap(long, help = "First VPC name")]
        vpc1: String,
        #[clap(long, help = "Second VPC name")]
        vpc2: String,
    },

    /// Apply a firewall policy to a subnet
    ApplyFirewall {
        #[clap(long, help = "VPC name")]
        vpc: String,
        #[clap(long, help = "Subnet name")]
        subnet: String,
        #[clap(long, help = "Policy JSON file")]
        policy: PathBuf,
    },

    /// Deploy a test workload in a subnet
    Deploy {
        #[clap(long, help = "VPC name")]
        vpc: String,
        #[clap(long, help = "Subnet name")]
        subnet: String,
        #[clap(long = "type", value_enum, default_value = "nginx")]
        kind: WorkloadKind,
        #[clap(long, default_value_t = 80)]
        port: u16,
    },

    /// Delete a subnet
    DeleteSubnet {
        #[clap(long, help = "VPC name")]
        vpc: String,
        #[clap(long, help = "Subnet name")]
        name: String,
    },

    /// Delete a VPC and everything in it
    DeleteVpc {
        #[clap(long, help = "VPC name")]
        name: String,
    },

    /// List VPCs, their subnets and peerings
    List,
}

fn main() {
    let cli = Cli::parse();
    logging::init(Path::new(store::LOG_FILE));

    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&interrupted)) {
            tracing::warn!("cannot install signal handler: {}", e);
        }
    }

    match run(cli, interrupted) {
        Ok(()) => tracing::info!("command completed"),
        Err(e) => {
            tracing::error!("command failed: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn run(cli: Cli, interrupted: Arc<AtomicBool>) -> Result<()> {
    let store = Store::new();
    let mutating = !matches!(cli.command, Commands::List);

    if mutating {
        ensure_root()?;
    }
    let _lock = if mutating {
        Some(StateLock::acquire(
            Path::new(store::LOCK_FILE),
            Duration::from_secs(cli.lock_timeout),
        )?)
    } else {
        None
    };

    let driver = ShellDriver::new();
    let reconciler = Reconciler::new(&store, &driver, interrupted);

    match cli.command {
        Commands::CreateVpc { name, cidr } => reconciler.create_vpc(&name, &cidr),
        Commands::CreateSubnet {
            vpc,
            name,
            cidr,
            kind,
        } => reconciler.create_subnet(&vpc, &name, &cidr, kind),
        Commands::Peer { vpc1, vpc2 } => reconciler.peer(&vpc1, &vpc2),
        Commands::ApplyFirewall {
            vpc,
            subnet,
            policy,
        } => reconciler.apply_firewall(&vpc, &subnet, &policy),
        Commands::Deploy {
            vpc,
            subnet,
            kind,
            port,
        } => reconciler.deploy(&vpc, &subnet, kind, port),
        Commands::DeleteSubnet { vpc, name } => reconciler.delete_subnet(&vpc, &name),
        Commands::DeleteVpc { name } => reconciler.delete_vpc(&name),
        Commands::List => {
            print_vpcs(&reconciler.list()?);
            Ok(())
        }
    }
}

fn ensure_root() -> Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(VpcError::Validation(
            "this command must be run as root".to_string(),
        ))
    }
}

fn print_vpcs(records: &[model::VpcRecord]) {
    if records.is_empty() {
        println!("no VPCs");
        return;
    }
    for record in records {
        println!("VPC: {}  ({})", record.name, record.cidr);
        println!("  bridge: {}  gateway: {}", record.bridge, record.gateway);
        if !record.subnets.is_empty() {
            println!("  subnets:");
            for subnet in &record.subnets {
                println!(
                    "    {}  {}  [{}]  endpoint {}",
                    subnet.name,
                    subnet.cidr,
                    subnet.kind.as_str(),
                    subnet.endpoint
                );
            }
        }
        if !record.peerings.is_empty() {
            println!("  peerings:");
            for peering in &record.peerings {
                println!("    {}  (block {})", peering.peer, peering.block);
            }
        }
    }
}
