//! StreamFilter state machine

use super::ar::{ar1_volatility, FitError};
use super::window::{ReturnsWindow, RollingWindow};
use super::VolatilityEvent;
use crate::config::FilterConfig;
use crate::feed::Trade;
use serde::Serialize;

/// Filter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterState {
    /// No trade observed yet
    Idle,
    /// Collecting returns until the minimum sample is reached
    Warming,
    /// Refitting the AR(1) model on every trade
    Active,
    /// Explicitly stopped; trades are ignored
    Stopped,
}

/// Result of processing one trade
#[derive(Debug, Clone)]
pub struct FilterOutput {
    pub state: FilterState,
    /// Instantaneous volatility estimate; present whenever Active.
    /// A failed model fit yields 0.0, never an absent estimate.
    pub volatility: Option<f64>,
    /// Threshold breach, when `volatility > threshold`
    pub event: Option<VolatilityEvent>,
}

/// Cumulative counters exposed for polling
#[derive(Debug, Clone, Serialize)]
pub struct FilterStats {
    pub instrument: String,
    pub state: FilterState,
    pub trades_processed: u64,
    pub events_detected: u64,
    pub last_volatility: f64,
}

/// Per-instrument trade-stream volatility filter.
///
/// `Idle -> Warming` on the first trade, `Warming -> Active` once the
/// returns window holds `min_returns` samples, any state `-> Stopped`
/// on [`StreamFilter::stop`].
pub struct StreamFilter {
    instrument: String,
    config: FilterConfig,
    trades: RollingWindow<Trade>,
    returns: ReturnsWindow,
    state: FilterState,
    trades_processed: u64,
    events_detected: u64,
    last_volatility: f64,
}

impl StreamFilter {
    pub fn new(instrument: impl Into<String>, config: FilterConfig) -> Self {
        let window_size = config.window_size;
        Self {
            instrument: instrument.into(),
            config,
            trades: RollingWindow::new(window_size),
            returns: ReturnsWindow::new(window_size),
            state: FilterState::Idle,
            trades_processed: 0,
            events_detected: 0,
            last_volatility: 0.0,
        }
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn stats(&self) -> FilterStats {
        FilterStats {
            instrument: self.instrument.clone(),
            state: self.state,
            trades_processed: self.trades_processed,
            events_detected: self.events_detected,
            last_volatility: self.last_volatility,
        }
    }

    /// Stop processing; subsequent trades are ignored
    pub fn stop(&mut self) {
        self.state = FilterState::Stopped;
    }

    /// Process one trade in arrival order.
    ///
    /// Malformed trades (non-positive price or amount) are dropped with
    /// a warning and do not advance the window.
    pub fn on_trade(&mut self, trade: &Trade) -> FilterOutput {
        if self.state == FilterState::Stopped {
            return FilterOutput {
                state: self.state,
                volatility: None,
                event: None,
            };
        }

        if !trade.is_valid() {
            tracing::warn!(
                instrument = %trade.instrument,
                trade_id = %trade.trade_id,
                "Dropping malformed trade"
            );
            return FilterOutput {
                state: self.state,
                volatility: None,
                event: None,
            };
        }

        if self.state == FilterState::Idle {
            self.state = FilterState::Warming;
        }

        self.trades.push(trade.clone());
        self.returns.observe(trade);
        self.trades_processed += 1;

        if self.state == FilterState::Warming && self.returns.len() >= self.config.min_returns {
            tracing::info!(
                instrument = %self.instrument,
                returns = self.returns.len(),
                "Filter warmed up, model active"
            );
            self.state = FilterState::Active;
        }

        if self.state != FilterState::Active {
            return FilterOutput {
                state: self.state,
                volatility: None,
                event: None,
            };
        }

        let volatility = match ar1_volatility(&self.returns.as_vec(), self.config.residual_window)
        {
            Ok(vol) => vol,
            Err(e) => {
                // Recoverable: this tick reads as zero volatility
                self.log_fit_failure(&e);
                0.0
            }
        };
        self.last_volatility = volatility;

        let event = if volatility > self.config.vol_threshold {
            self.events_detected += 1;
            Some(VolatilityEvent {
                timestamp_ms: trade.timestamp_ms,
                instrument: self.instrument.clone(),
                price: trade.price.to_string(),
                volatility,
                threshold: self.config.vol_threshold,
                window_size: self.config.window_size,
                ar_lag: 1,
                excess_ratio: volatility / self.config.vol_threshold,
            })
        } else {
            None
        };

        FilterOutput {
            state: self.state,
            volatility: Some(volatility),
            event,
        }
    }

    fn log_fit_failure(&self, error: &FitError) {
        tracing::debug!(
            instrument = %self.instrument,
            error = %error,
            "AR(1) fit failed, volatility reads 0"
        );
    }
}
