//! Market data feeds
//!
//! Streaming trade/ticker feeds over WebSocket plus a REST source for
//! the instrument universe and batch Greeks refreshes.

mod deribit;
mod types;

pub use deribit::{DeribitFeed, DeribitRest};
pub use types::{
    parse_instrument_name, Direction, GreeksSnapshot, Instrument, InstrumentKind, TickerUpdate,
    Trade,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Streaming trade feed for one or more instruments
#[async_trait]
pub trait TradeFeed: Send + Sync {
    /// Subscribe to trades; the stream reconnects internally
    async fn subscribe_trades(&self, instruments: &[String])
        -> anyhow::Result<mpsc::Receiver<Trade>>;
}

/// Streaming ticker feed (mark price, IVs, Greeks)
#[async_trait]
pub trait TickerFeed: Send + Sync {
    async fn subscribe_tickers(
        &self,
        instruments: &[String],
    ) -> anyhow::Result<mpsc::Receiver<TickerUpdate>>;
}

/// REST source for the option universe and batch state refreshes
#[async_trait]
pub trait InstrumentSource: Send + Sync {
    /// All instruments for an underlying currency
    async fn fetch_instruments(&self, currency: &str) -> anyhow::Result<Vec<Instrument>>;

    /// Current ticker state (mark IV, Greeks) for one instrument
    async fn fetch_greeks(&self, instrument: &str) -> anyhow::Result<GreeksSnapshot>;

    /// Spot index price for an underlying
    async fn fetch_index_price(&self, currency: &str) -> anyhow::Result<f64>;

    /// Historical trades for an instrument, oldest first
    async fn fetch_trade_history(
        &self,
        instrument: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> anyhow::Result<Vec<Trade>>;
}
