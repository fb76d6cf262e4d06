//! TinyCoin node CLI
//!
//! A command-line interface for mining, wallets and chain inspection.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tinycoin::cli::{self, AppState};
use tinycoin::config::NodeConfig;

#[derive(Parser)]
#[command(name = "tinycoin")]
#[command(version = "0.1.0")]
#[command(about = "A small proof-of-work cryptocurrency node", long_about = None)]
struct Cli {
    /// Data directory for chain and wallet storage
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// JSON node configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the low-difficulty local test network
    #[arg(long)]
    regtest: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mine new blocks
    Mine {
        /// Address receiving the block rewards
        #[arg(short, long)]
        address: String,

        /// Number of blocks to mine; mines until stopped if omitted
        #[arg(short, long)]
        count: Option<usize>,
    },

    /// Wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Show the balance of an address
    Balance {
        #[arg(short, long)]
        address: String,
    },

    /// Send coins from a stored wallet
    Send {
        /// Sender's wallet address
        #[arg(short, long)]
        from: String,

        /// Recipient's address
        #[arg(short, long)]
        to: String,

        /// Value to send, in minor units
        #[arg(short, long)]
        value: u64,

        /// Fee per serialized byte
        #[arg(long, default_value = "1")]
        fee_per_byte: u64,

        /// Mine a block holding the payment before exiting
        #[arg(long)]
        confirm: bool,
    },

    /// Show where a transaction is
    TxStatus {
        #[arg(short, long)]
        tx_id: String,
    },

    /// Print node information as JSON
    Info,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a new wallet
    New {
        /// Optional label for the wallet
        #[arg(short, long)]
        label: Option<String>,
    },

    /// List all wallets
    List,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = NodeConfig::load_or_default(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    if cli.regtest {
        config.network = "regtest".to_string();
    }

    let state = AppState::new(config)?;

    match cli.command {
        Commands::Mine { address, count } => {
            cli::cmd_mine(&state, &address, count)?;
        }

        Commands::Wallet { action } => match action {
            WalletCommands::New { label } => {
                cli::cmd_wallet_new(&state, label.as_deref())?;
            }
            WalletCommands::List => {
                cli::cmd_wallet_list(&state)?;
            }
        },

        Commands::Balance { address } => {
            cli::cmd_balance(&state, &address)?;
        }

        Commands::Send {
            from,
            to,
            value,
            fee_per_byte,
            confirm,
        } => {
            cli::cmd_send(&state, &from, &to, value, fee_per_byte, confirm)?;
        }

        Commands::TxStatus { tx_id } => {
            cli::cmd_tx_status(&state, &tx_id)?;
        }

        Commands::Info => {
            cli::cmd_info(&state)?;
        }
    }

    Ok(())
}
