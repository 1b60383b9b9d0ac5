//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

/// brickwire - talk to Bricks and Bricklets through a Brick Daemon
#[derive(Debug, Parser)]
#[command(name = "brickwire")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "BRICKWIRE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Format of diagnostic output on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Daemon host (overrides the configuration)
    #[arg(long, env = "BRICKWIRE_HOST")]
    pub host: Option<String>,

    /// Daemon port (overrides the configuration)
    #[arg(long, short, env = "BRICKWIRE_PORT")]
    pub port: Option<u16>,

    /// Response timeout in milliseconds (overrides the configuration)
    #[arg(long)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the devices attached to the daemon
    Enumerate {
        /// Output one JSON object per device
        #[arg(long)]
        json: bool,

        /// How long to collect enumerate callbacks, in milliseconds
        #[arg(long, default_value = "1000")]
        wait: u64,
    },

    /// Call a function of a device
    Call {
        /// Device UID (base58)
        uid: String,

        /// Function ID
        function_id: u8,

        /// Request payload format, e.g. "H 3B"
        #[arg(long, short = 'f', default_value = "")]
        request_format: String,

        /// Request value (repeat once per field); arrays are comma separated
        #[arg(long = "arg", short, action = clap::ArgAction::Append, allow_hyphen_values = true)]
        args: Vec<String>,

        /// Response payload format
        #[arg(long, short = 'r', default_value = "")]
        response_format: String,

        /// Send without waiting for a response
        #[arg(long)]
        no_response: bool,

        /// Output the response as JSON
        #[arg(long)]
        json: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}
