use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// The command line interface for acm serial.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[clap(subcommand)]
    Examples(Examples),

    /// Show the line coding bytes sent for some options.
    Encode {
        /// Baud rate. Uses the configured default if not given.
        #[arg(long)]
        baud_rate: Option<u32>,

        /// Data bits.
        #[arg(long)]
        data_bits: Option<u8>,

        /// Stop bits, 1 or 2.
        #[arg(long)]
        stop_bits: Option<u8>,

        /// Parity: none, even, odd, mark or space.
        #[arg(long)]
        parity: Option<String>,
    },

    /// Open an in-memory loopback device, write a message and read it back.
    Demo {
        /// What to write.
        #[arg(default_value = "Hello from a mock CDC-ACM device")]
        message: String,
    },
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example of serial options as JSON.
    Options,
}
