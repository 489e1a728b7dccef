//! Trade-stream volatility filter
//!
//! Maintains a rolling window of trades and log-returns for a single
//! instrument, refits an AR(1) model per trade, and raises threshold
//! breach events when the residual volatility exceeds the configured
//! threshold.

mod ar;
mod stream;
mod window;

pub use ar::{ar1_volatility, fit_ar1, Ar1Model, FitError};
pub use stream::{FilterOutput, FilterState, FilterStats, StreamFilter};
pub use window::{ReturnsWindow, RollingWindow};

use serde::{Deserialize, Serialize};

/// A volatility threshold breach
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityEvent {
    pub timestamp_ms: i64,
    pub instrument: String,
    /// Trade price at detection, as string to preserve precision
    pub price: String,
    /// Instantaneous AR(1) residual volatility
    pub volatility: f64,
    /// Configured threshold that was breached
    pub threshold: f64,
    pub window_size: usize,
    pub ar_lag: usize,
    /// volatility / threshold, always > 1 for an emitted event
    pub excess_ratio: f64,
}
