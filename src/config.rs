//! Configuration types for volcast

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub feed: FeedConfig,
    pub filter: FilterConfig,
    pub tracker: TrackerConfig,
    pub surface: SurfaceConfig,
    pub hub: HubConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
}

/// Market data feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Exchange name (currently only "deribit")
    pub exchange: String,
    /// Underlying currency for the option universe (e.g. "BTC")
    pub underlying: String,
    /// Instrument whose trade stream drives the volatility filter
    /// (e.g. "BTC-PERPETUAL")
    pub trade_instrument: String,
}

/// StreamFilter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Rolling trade window capacity
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Residual volatility threshold for breach events
    #[serde(default = "default_vol_threshold")]
    pub vol_threshold: f64,
    /// Returns required before the AR(1) model starts fitting
    #[serde(default = "default_min_returns")]
    pub min_returns: usize,
    /// Residuals used for the instantaneous volatility estimate
    #[serde(default = "default_residual_window")]
    pub residual_window: usize,
}

fn default_window_size() -> usize {
    100
}
fn default_vol_threshold() -> f64 {
    0.01
}
fn default_min_returns() -> usize {
    20
}
fn default_residual_window() -> usize {
    10
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            vol_threshold: 0.01,
            min_returns: 20,
            residual_window: 10,
        }
    }
}

/// Option universe tracker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Strike window around spot as a fraction (0.15 = +-15%)
    #[serde(default = "default_strike_range_pct")]
    pub strike_range_pct: f64,
    /// Expiry horizon in days; instruments beyond it are not tracked
    #[serde(default = "default_expiry_horizon_days")]
    pub expiry_horizon_days: i64,
    /// Z-score threshold for IV anomaly events
    #[serde(default = "default_iv_threshold_std")]
    pub iv_threshold_std: f64,
    /// Relative IV move threshold for IV change events
    #[serde(default = "default_iv_change_threshold")]
    pub iv_change_threshold: f64,
    /// Per-instrument IV history capacity
    #[serde(default = "default_iv_history_len")]
    pub iv_history_len: usize,
    /// Minimum IV history before anomaly detection engages
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    /// Greeks batch refresh interval in seconds
    #[serde(default = "default_greeks_refresh_secs")]
    pub greeks_refresh_secs: u64,
    /// Full chain snapshot interval in seconds
    #[serde(default = "default_chain_refresh_secs")]
    pub chain_refresh_secs: u64,
    /// Per-request timeout for REST batch fetches, in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Minimum valid option points before a surface fit is attempted
    #[serde(default = "default_min_surface_points")]
    pub min_surface_points: usize,
}

fn default_strike_range_pct() -> f64 {
    0.15
}
fn default_expiry_horizon_days() -> i64 {
    90
}
fn default_iv_threshold_std() -> f64 {
    2.0
}
fn default_iv_change_threshold() -> f64 {
    0.1
}
fn default_iv_history_len() -> usize {
    100
}
fn default_min_history() -> usize {
    20
}
fn default_greeks_refresh_secs() -> u64 {
    60
}
fn default_chain_refresh_secs() -> u64 {
    300
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_min_surface_points() -> usize {
    20
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            strike_range_pct: 0.15,
            expiry_horizon_days: 90,
            iv_threshold_std: 2.0,
            iv_change_threshold: 0.1,
            iv_history_len: 100,
            min_history: 20,
            greeks_refresh_secs: 60,
            chain_refresh_secs: 300,
            fetch_timeout_secs: 30,
            min_surface_points: 20,
        }
    }
}

/// Volatility surface engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SurfaceConfig {
    /// Risk-free rate used for forwards / discounting
    #[serde(default)]
    pub risk_free_rate: f64,
    /// Lower clip for interpolated vols (annualized)
    #[serde(default = "default_vol_floor")]
    pub vol_floor: f64,
    /// Upper clip for interpolated vols (annualized)
    #[serde(default = "default_vol_cap")]
    pub vol_cap: f64,
}

fn default_vol_floor() -> f64 {
    0.05
}
fn default_vol_cap() -> f64 {
    3.0
}

impl Default for SurfaceConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            vol_floor: 0.05,
            vol_cap: 3.0,
        }
    }
}

/// Event broadcast hub configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Per-subscriber send timeout in milliseconds; slower subscribers
    /// are disconnected rather than blocking the publisher
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Per-subscriber channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Interval for logging subscription stats, in seconds
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_send_timeout_ms() -> u64 {
    100
}
fn default_channel_capacity() -> usize {
    256
}
fn default_stats_interval_secs() -> u64 {
    60
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: 100,
            channel_capacity: 256,
            stats_interval_secs: 60,
        }
    }
}

/// Persistence / data capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub capture_enabled: bool,
    pub output_dir: PathBuf,
    #[serde(default = "default_rotation_secs")]
    pub rotation_interval_secs: u64,
}

fn default_rotation_secs() -> u64 {
    3600
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub metrics_port: u16,
    pub log_level: String,
}

/// Threshold optimizer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    /// Run the optimizer at startup and override `filter.vol_threshold`
    #[serde(default)]
    pub run_at_startup: bool,
    /// Hours of trade history to replay
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: i64,
    /// Search strategy: exhaustive grid (default, reproducible) or
    /// golden-section bounded search
    #[serde(default)]
    pub search: SearchStrategy,
    /// Grid resolution over the threshold interval
    #[serde(default = "default_grid_points")]
    pub grid_points: usize,
    /// Threshold interval lower bound
    #[serde(default = "default_threshold_min")]
    pub threshold_min: f64,
    /// Threshold interval upper bound
    #[serde(default = "default_threshold_max")]
    pub threshold_max: f64,
    /// Realized-vol quantile labeled as ground-truth high volatility
    #[serde(default = "default_label_quantile")]
    pub label_quantile: f64,
    /// Rolling window for the realized-vol labeling series
    #[serde(default = "default_realized_window")]
    pub realized_window: usize,
}

/// Threshold search strategy
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchStrategy {
    #[default]
    Grid,
    Bounded,
}

fn default_lookback_hours() -> i64 {
    24
}
fn default_grid_points() -> usize {
    100
}
fn default_threshold_min() -> f64 {
    0.001
}
fn default_threshold_max() -> f64 {
    0.1
}
fn default_label_quantile() -> f64 {
    0.8
}
fn default_realized_window() -> usize {
    20
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            run_at_startup: false,
            lookback_hours: 24,
            search: SearchStrategy::Grid,
            grid_points: 100,
            threshold_min: 0.001,
            threshold_max: 0.1,
            label_quantile: 0.8,
            realized_window: 20,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
