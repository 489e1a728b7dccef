use clap::Parser;
use volcast::cli::{Cli, Commands};
use volcast::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Could not load config from {}: {}", cli.config, e);
        eprintln!("Using default configuration");
        toml::from_str(include_str!("../config.toml.example")).expect("Invalid default config")
    });

    // Initialize telemetry
    let _guard = volcast::telemetry::init_telemetry(&config.telemetry)?;

    match cli.command {
        Commands::Run(args) => {
            tracing::info!("Starting live stream processing");
            args.execute(config).await?;
        }
        Commands::Calibrate(args) => {
            tracing::info!("Starting threshold calibration");
            args.execute(&config).await?;
        }
        Commands::Status => {
            println!("volcast status");
            println!("  Status: Not running");
        }
        Commands::Config => {
            println!("Current configuration:");
            println!(
                "  Feed: {} {} / {}",
                config.feed.exchange, config.feed.underlying, config.feed.trade_instrument
            );
            println!(
                "  Filter: window={} threshold={}",
                config.filter.window_size, config.filter.vol_threshold
            );
            println!(
                "  Tracker: strikes +-{}% horizon={}d",
                config.tracker.strike_range_pct * 100.0,
                config.tracker.expiry_horizon_days
            );
            println!(
                "  Capture: enabled={} dir={:?}",
                config.storage.capture_enabled, config.storage.output_dir
            );
        }
    }

    Ok(())
}
