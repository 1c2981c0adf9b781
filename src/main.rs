use std::path::PathBuf;

use clap::{Parser, Subcommand};
use sealdrop::utils::PartyId;
use sealdrop::{DEFAULT_RELAY_ADDR, DEFAULT_RELAY_PORT};

#[derive(Parser)]
#[command(name = "sealdrop")]
#[command(about = "End-to-end encrypted file drop through an untrusted relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to another party
    Send {
        /// Path to the file to send
        file: PathBuf,
        /// 6-digit id of the receiving party
        #[arg(short, long)]
        to: String,
        /// Relay server address
        #[arg(short, long, default_value = DEFAULT_RELAY_ADDR)]
        relay: String,
        /// Additionally lock the file with a passphrase
        #[arg(short, long)]
        passphrase: Option<String>,
    },
    /// Wait for a file from another party
    Receive {
        /// Relay server address
        #[arg(short, long, default_value = DEFAULT_RELAY_ADDR)]
        relay: String,
        /// Passphrase to try first (prompted when needed otherwise)
        #[arg(short, long)]
        passphrase: Option<String>,
        /// Directory to save the file in
        #[arg(short, long, default_value = ".")]
        output_dir: PathBuf,
        /// Accept the first request without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Run as a relay server
    Relay {
        /// Port to bind to
        #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,
        /// Interface to bind to
        #[arg(short, long, default_value = "0.0.0.0")]
        bind: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let result = match cli.command {
        Commands::Send { file, to, relay, passphrase } => {
            sealdrop::commands::send::run(&file, PartyId::new(to), &relay, passphrase).await
        }
        Commands::Receive { relay, passphrase, output_dir, yes } => {
            sealdrop::commands::receive::run(&relay, passphrase, &output_dir, yes).await
        }
        Commands::Relay { port, bind } => sealdrop::commands::relay::run(&bind, port).await,
    };

    if let Err(e) = result {
        log::debug!("{:?}", e);
        eprintln!("{}", e.status_message());
        std::process::exit(1);
    }
}
