//! Palisade key management binary.
//!
//! # Usage
//!
//! ```bash
//! export PALISADE_PASSPHRASE='correct horse battery staple'
//!
//! # Identity, signed pre-key and 100 one-time pre-keys
//! palisade keygen --out keys.bin --one-time-keys 100
//!
//! # Summarize a backup without printing secrets
//! palisade inspect --backup keys.bin
//!
//! # Public bundle for the key directory
//! palisade bundle --backup keys.bin --out bundle.json
//! ```

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Palisade key management
#[derive(Parser, Debug)]
#[command(name = "palisade")]
#[command(about = "Palisade key generation and encrypted backup tooling")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Environment variable holding the backup passphrase
    #[arg(long, default_value = "PALISADE_PASSPHRASE", global = true)]
    passphrase_env: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new key set into an encrypted backup
    Keygen {
        /// Backup file to write
        #[arg(long)]
        out: PathBuf,

        /// Number of one-time pre-keys
        #[arg(long, default_value_t = 100)]
        one_time_keys: u32,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Decrypt a backup and log a summary of its keys
    Inspect {
        /// Backup file to read
        #[arg(long)]
        backup: PathBuf,
    },

    /// Write the publishable key bundle of a backup
    Bundle {
        /// Backup file to read
        #[arg(long)]
        backup: PathBuf,

        /// Bundle JSON file to write
        #[arg(long)]
        out: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let passphrase = commands::read_passphrase(&args.passphrase_env)?;

    match args.command {
        Command::Keygen { out, one_time_keys, force } => {
            commands::keygen(&out, one_time_keys, force, &passphrase)?;
        },
        Command::Inspect { backup } => {
            commands::inspect(&backup, &passphrase)?;
        },
        Command::Bundle { backup, out, force } => {
            commands::bundle(&backup, &out, force, &passphrase)?;
        },
    }

    Ok(())
}
