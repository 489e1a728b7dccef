//! Option chain snapshots and the smoothed per-strike IV curve

use crate::feed::{GreeksSnapshot, Instrument};
use crate::pricing::OptionType;
use crate::surface::SurfacePoint;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One instrument in a chain snapshot, with its latest cached Greeks
/// when available
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub instrument: String,
    pub strike: Option<f64>,
    pub option_type: Option<OptionType>,
    pub expiry_ms: Option<i64>,
    pub greeks: Option<GreeksSnapshot>,
}

/// A call/put-averaged IV observation at one (expiry, strike)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SmoothedIvPoint {
    pub expiry_ms: i64,
    pub strike: f64,
    pub iv: f64,
}

/// Full chain rebuilt once per refresh cycle. Superseded, never
/// mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub timestamp_ms: i64,
    pub underlying: String,
    pub spot_price: f64,
    pub entries: Vec<ChainEntry>,
    pub smoothed_curve: Vec<SmoothedIvPoint>,
}

impl ChainSnapshot {
    /// Merge the tracked universe with the cached Greeks and compute
    /// the smoothed curve
    pub fn build(
        timestamp_ms: i64,
        underlying: impl Into<String>,
        spot_price: f64,
        instruments: &[Instrument],
        greeks: &HashMap<String, GreeksSnapshot>,
    ) -> Self {
        let entries: Vec<ChainEntry> = instruments
            .iter()
            .map(|inst| ChainEntry {
                instrument: inst.name.clone(),
                strike: inst.strike,
                option_type: inst.option_type,
                expiry_ms: inst.expiry_ms,
                greeks: greeks.get(&inst.name).cloned(),
            })
            .collect();
        let smoothed_curve = smoothed_curve(&entries);

        Self {
            timestamp_ms,
            underlying: underlying.into(),
            spot_price,
            entries,
            smoothed_curve,
        }
    }

    /// Entries with a usable (strike, expiry, positive mark IV)
    pub fn valid_points(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                e.strike.is_some()
                    && e.expiry_ms.is_some()
                    && e.greeks.as_ref().is_some_and(|g| g.mark_iv > 0.0)
            })
            .count()
    }

    /// Fit inputs for the surface engine, one per smoothed-curve point
    pub fn surface_points(&self, now_ms: i64) -> Vec<SurfacePoint> {
        self.smoothed_curve
            .iter()
            .filter_map(|p| {
                let ttm = (p.expiry_ms - now_ms) as f64 / (365.0 * 24.0 * 3600.0 * 1000.0);
                (ttm > 0.0 && p.iv > 0.0).then_some(SurfacePoint {
                    strike: p.strike,
                    ttm,
                    iv: p.iv,
                })
            })
            .collect()
    }
}

/// Average call and put IV at each (expiry, strike); a missing side is
/// skipped rather than zero-filled
fn smoothed_curve(entries: &[ChainEntry]) -> Vec<SmoothedIvPoint> {
    // BTreeMap keys give a deterministic, expiry-then-strike order
    let mut buckets: BTreeMap<(i64, u64), Vec<f64>> = BTreeMap::new();

    for entry in entries {
        let (Some(strike), Some(expiry)) = (entry.strike, entry.expiry_ms) else {
            continue;
        };
        let Some(greeks) = &entry.greeks else { continue };
        if greeks.mark_iv <= 0.0 {
            continue;
        }
        buckets
            .entry((expiry, strike.to_bits()))
            .or_default()
            .push(greeks.mark_iv);
    }

    buckets
        .into_iter()
        .map(|((expiry_ms, strike_bits), ivs)| SmoothedIvPoint {
            expiry_ms,
            strike: f64::from_bits(strike_bits),
            iv: ivs.iter().sum::<f64>() / ivs.len() as f64,
        })
        .collect()
}
