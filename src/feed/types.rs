//! Market data types

use crate::pricing::OptionType;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Trade direction (aggressor side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

/// A single executed trade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    /// Exchange timestamp in milliseconds, monotonic per instrument
    pub timestamp_ms: i64,
    /// Instrument name (e.g. "BTC-PERPETUAL", "BTC-27MAR26-50000-C")
    pub instrument: String,
    /// Trade price, strictly positive
    pub price: Decimal,
    /// Trade size, strictly positive
    pub amount: Decimal,
    pub direction: Direction,
    /// Exchange-assigned unique id
    pub trade_id: String,
    /// Implied volatility the exchange reported for the trade; present
    /// on option trades only
    pub iv: Option<f64>,
}

impl Trade {
    /// Basic contract validation; malformed records are dropped upstream
    pub fn is_valid(&self) -> bool {
        self.price > Decimal::ZERO && self.amount > Decimal::ZERO
    }

    /// Price as f64 for model math
    pub fn price_f64(&self) -> f64 {
        self.price.try_into().unwrap_or(0.0)
    }
}

/// A per-instrument ticker push carrying mark price, IVs and Greeks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerUpdate {
    pub timestamp_ms: i64,
    pub instrument: String,
    pub mark_price: f64,
    pub mark_iv: f64,
    pub underlying_price: f64,
    pub bid_iv: Option<f64>,
    pub ask_iv: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub open_interest: f64,
    pub volume: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub rho: f64,
}

/// Instrument kind within the universe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Option,
    Future,
}

/// A derivatives instrument from the exchange universe.
///
/// Strike, option type and expiry never change once created; only
/// `is_active` is refreshed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub underlying: String,
    pub kind: InstrumentKind,
    pub strike: Option<f64>,
    pub option_type: Option<OptionType>,
    pub expiry_ms: Option<i64>,
    pub contract_size: f64,
    pub is_active: bool,
}

impl Instrument {
    /// Time to expiry in year fractions at `now_ms`, if the instrument
    /// has an expiry
    pub fn ttm_years(&self, now_ms: i64) -> Option<f64> {
        let expiry = self.expiry_ms?;
        Some((expiry - now_ms) as f64 / (365.0 * 24.0 * 3600.0 * 1000.0))
    }

    /// Days to expiry at `now_ms`
    pub fn days_to_expiry(&self, now_ms: i64) -> Option<f64> {
        let expiry = self.expiry_ms?;
        Some((expiry - now_ms) as f64 / (24.0 * 3600.0 * 1000.0))
    }
}

/// Latest cached pricing state for one tracked instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreeksSnapshot {
    pub instrument: String,
    pub timestamp_ms: i64,
    pub mark_price: f64,
    pub mark_iv: f64,
    pub underlying_price: f64,
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub rho: f64,
    pub bid_iv: Option<f64>,
    pub ask_iv: Option<f64>,
    pub open_interest: f64,
    pub volume: f64,
}

impl From<&TickerUpdate> for GreeksSnapshot {
    fn from(t: &TickerUpdate) -> Self {
        Self {
            instrument: t.instrument.clone(),
            timestamp_ms: t.timestamp_ms,
            mark_price: t.mark_price,
            mark_iv: t.mark_iv,
            underlying_price: t.underlying_price,
            delta: t.delta,
            gamma: t.gamma,
            vega: t.vega,
            theta: t.theta,
            rho: t.rho,
            bid_iv: t.bid_iv,
            ask_iv: t.ask_iv,
            open_interest: t.open_interest,
            volume: t.volume,
        }
    }
}

/// Parse a Deribit-style option name ("BTC-27MAR26-50000-C") into
/// (expiry, strike, option type). Returns None for futures and
/// malformed names.
pub fn parse_instrument_name(name: &str) -> Option<(DateTime<Utc>, f64, OptionType)> {
    let parts: Vec<&str> = name.split('-').collect();
    if parts.len() != 4 {
        return None;
    }

    let expiry = parse_expiry_code(parts[1])?;
    let strike = parts[2].parse::<f64>().ok()?;
    let option_type = match parts[3] {
        "C" => OptionType::Call,
        "P" => OptionType::Put,
        _ => return None,
    };
    Some((expiry, strike, option_type))
}

/// Parse a "27MAR26"-style expiry code to 08:00 UTC on that date
/// (the exchange settlement time). Single-digit days appear without a
/// leading zero ("1AUG25").
fn parse_expiry_code(code: &str) -> Option<DateTime<Utc>> {
    if code.len() < 6 || code.len() > 7 {
        return None;
    }
    let (day_str, rest) = code.split_at(code.len() - 5);
    let day = day_str.parse::<u32>().ok()?;
    let month = match &rest[0..3] {
        "JAN" => 1,
        "FEB" => 2,
        "MAR" => 3,
        "APR" => 4,
        "MAY" => 5,
        "JUN" => 6,
        "JUL" => 7,
        "AUG" => 8,
        "SEP" => 9,
        "OCT" => 10,
        "NOV" => 11,
        "DEC" => 12,
        _ => return None,
    };
    let year = 2000 + rest[3..5].parse::<i32>().ok()?;

    chrono::NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(8, 0, 0)
        .map(|dt| dt.and_utc())
}
