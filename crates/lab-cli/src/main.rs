//! Network emulation lab CLI
//!
//! Command-line driver for netns-lab sessions: numbered-port validation,
//! multiplexed per-host monitoring, and shaped-link bandwidth tests.
//! Every subcommand except `clean --dry-run` needs CAP_NET_ADMIN.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cmd_clean, cmd_monitor, cmd_perf, cmd_ports, SchedArg};
use tracing::Level;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate port numbering: five hosts on one switch, the fifth link
    /// pinned to switch port 9, checked against the kernel record
    Ports,

    /// Monitor a ring of pings across CPU-limited hosts, output multiplexed
    /// live as `<hN>: line`
    Monitor {
        /// Number of hosts on the switch
        #[arg(long, default_value_t = 5)]
        hosts: usize,

        /// Scheduler class for the CPU quota
        #[arg(long, value_enum, default_value_t = SchedArg::Cfs)]
        sched: SchedArg,

        /// How many pings each host sends
        #[arg(long, default_value_t = 10)]
        count: u32,
    },

    /// UDP bandwidth test across shaped links (10 Mbit, 5 ms, 10% loss, HTB)
    Perf {
        /// Zero the configured loss for deterministic automated runs
        #[arg(long)]
        testmode: bool,

        /// Seconds of traffic to offer
        #[arg(long, default_value_t = 5)]
        duration: u32,
    },

    /// Remove namespaces left behind by crashed sessions
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Ports => {
            cmd_ports().await?;
        }
        Commands::Monitor {
            hosts,
            sched,
            count,
        } => {
            cmd_monitor(hosts, sched, count).await?;
        }
        Commands::Perf { testmode, duration } => {
            cmd_perf(testmode, duration).await?;
        }
        Commands::Clean => {
            cmd_clean().await?;
        }
    }

    Ok(())
}
