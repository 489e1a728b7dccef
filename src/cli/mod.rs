//! CLI interface for volcast
//!
//! Provides subcommands for:
//! - `run`: Start live stream processing
//! - `calibrate`: Calibrate the volatility threshold against history
//! - `status`: Show current state
//! - `config`: Show effective configuration

mod calibrate;
mod run;

pub use calibrate::CalibrateArgs;
pub use run::RunArgs;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "volcast")]
#[command(about = "Real-time options volatility analytics for Deribit")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start live stream processing
    Run(RunArgs),
    /// Calibrate the volatility threshold on historical trades
    Calibrate(CalibrateArgs),
    /// Show current state
    Status,
    /// Show effective configuration
    Config,
}
