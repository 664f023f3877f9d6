//! pasdb CLI
//!
//! Command-line tools for pasdb schema maintenance.
//!
//! # Commands
//!
//! - `apply-schema` - Bring entity schemas to their declared versions
//! - `status` - Show the recorded schema version per entity
//! - `version` - Show version information

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// pasdb command-line schema tools.
#[derive(Parser)]
#[command(name = "pasdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Data directory containing `settings/pas_database.json`
    #[arg(global = true, short, long, default_value = "data")]
    data: PathBuf,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema upgrades
    ApplySchema {
        /// Only upgrade these entity classes (default: all versioned ones)
        #[arg(short, long)]
        class: Vec<String>,
    },

    /// Show recorded schema versions
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::ApplySchema { class } => {
            commands::schema::apply(&cli.data, &class)?;
        }
        Commands::Status { format } => {
            commands::schema::status(&cli.data, &format)?;
        }
        Commands::Version => {
            println!("pasdb CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("pasdb Core v{}", pasdb_core::VERSION);
            println!("pasdb Session v{}", pasdb_session::VERSION);
        }
    }

    Ok(())
}
