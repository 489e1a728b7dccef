//! volcast: real-time options volatility analytics core
//!
//! This library provides the components for:
//! - Real-time trade/ticker feeds from Deribit
//! - AR(1) residual-volatility filtering of a trade stream
//! - Threshold calibration against historical trades
//! - Option universe tracking with Greeks caching and IV anomaly detection
//! - SSVI volatility surface fitting with an interpolation fallback
//! - Black-Scholes pricing, Greeks and implied volatility
//! - Topic-filtered event broadcast to subscribers
//! - Persistence hooks with Parquet capture
//! - Full observability stack

pub mod cli;
pub mod config;
pub mod events;
pub mod feed;
pub mod filter;
pub mod hub;
pub mod optimizer;
pub mod pricing;
pub mod storage;
pub mod surface;
pub mod telemetry;
pub mod tracker;
pub mod ws;
