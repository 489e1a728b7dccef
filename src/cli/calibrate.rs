//! Calibrate command implementation

use crate::config::Config;
use crate::feed::{DeribitRest, InstrumentSource};
use crate::optimizer;
use chrono::Utc;
use clap::Args;
use std::time::Duration;

#[derive(Args, Debug)]
pub struct CalibrateArgs {
    /// Hours of trade history to replay (overrides config)
    #[arg(short, long)]
    pub lookback_hours: Option<i64>,
}

impl CalibrateArgs {
    pub async fn execute(&self, config: &Config) -> anyhow::Result<()> {
        let mut optimizer_config = config.optimizer.clone();
        if let Some(hours) = self.lookback_hours {
            optimizer_config.lookback_hours = hours;
        }

        let rest = DeribitRest::new(Duration::from_secs(config.tracker.fetch_timeout_secs))?;
        let end_ms = Utc::now().timestamp_millis();
        let start_ms = end_ms - optimizer_config.lookback_hours * 3600 * 1000;

        tracing::info!(
            instrument = %config.feed.trade_instrument,
            hours = optimizer_config.lookback_hours,
            "Fetching trade history"
        );
        let trades = rest
            .fetch_trade_history(&config.feed.trade_instrument, start_ms, end_ms)
            .await?;
        tracing::info!(trades = trades.len(), "History fetched, replaying");

        match optimizer::optimize(&trades, &config.filter, &optimizer_config) {
            Some(report) => {
                println!("{}", report.format_table());
                Ok(())
            }
            None => anyhow::bail!(
                "history too short to calibrate ({} trades)",
                trades.len()
            ),
        }
    }
}
