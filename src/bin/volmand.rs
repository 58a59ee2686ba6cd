//! volmand daemon binary

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use volmand::Daemon;

#[derive(Parser)]
#[command(name = "volmand")]
#[command(about = "Management daemon for a distributed storage cluster")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the management daemon
    Serve {
        /// Hostname this node advertises to its peers
        #[arg(long)]
        hostname: String,

        /// Bind address for the admin HTTP API
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Bind address for peer gRPC
        #[arg(long)]
        grpc: Option<SocketAddr>,

        /// Working directory (metadata store)
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Multiplex several bricks into one worker process
        #[arg(long)]
        brick_mux: bool,

        /// Worker program launched per brick process
        #[arg(long)]
        brick_program: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            hostname,
            bind,
            grpc,
            workdir,
            brick_mux,
            brick_program,
        } => {
            // File/env config first, CLI flags take priority
            let mut config = volmand::Config::load().daemon;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            if let Some(grpc) = grpc {
                config.grpc_addr = grpc;
            }
            if let Some(workdir) = workdir {
                config.workdir = workdir;
            }
            if brick_mux {
                config.brick_mux_enabled = true;
            }
            if let Some(program) = brick_program {
                config.brick_program = program;
            }

            Daemon::new(config, hostname).serve().await?;
        }
    }

    Ok(())
}
