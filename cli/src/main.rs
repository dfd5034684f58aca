mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{config::ConfigCommand, server::ServerCommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "tablesnap",
    about = "Database backup archives on remote object storage",
    long_about = "Tablesnap moves backup archives between local disk and S3, GCS, COS or a shared \
                  directory, behind a REST control API"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "TABLESNAP_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the REST control API")]
    Server(ServerCommand),

    #[command(name = "default-config", about = "Print the default configuration")]
    DefaultConfig,

    #[command(name = "print-config", about = "Print the effective configuration")]
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Server(ref cmd) => {
            info!("Starting Tablesnap");
            cmd.run(&cli).await
        }
        Commands::DefaultConfig => ConfigCommand::print_default(),
        Commands::PrintConfig => ConfigCommand::print_effective(&cli),
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tablesnap={level},tower_http={level}")));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
