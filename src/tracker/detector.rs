//! IV anomaly and change detection

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Which detector fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IvEventType {
    /// Z-score outlier against the rolling IV history
    IvAnomaly,
    /// Jump against the immediately preceding observation
    IvChange,
}

/// Threshold semantics carried on the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    /// Standard deviations from the rolling mean
    ZScore,
    /// Relative move vs the previous observation
    RelativeChange,
}

/// An IV anomaly or jump on a tracked option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvEvent {
    pub timestamp_ms: i64,
    pub instrument: String,
    pub event_type: IvEventType,
    /// Observed implied vol that triggered the event
    pub implied_vol: f64,
    /// Rolling mean (anomaly) or previous observation (change)
    pub reference_vol: f64,
    pub delta_vol: f64,
    pub strike: Option<f64>,
    pub days_to_expiry: Option<f64>,
    pub threshold_type: ThresholdType,
    pub threshold_value: f64,
    /// Present on anomaly events only
    pub z_score: Option<f64>,
}

/// Fixed-capacity rolling IV history for one instrument
#[derive(Debug, Clone)]
pub struct IvHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl IvHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, iv: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(iv);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation
    pub fn std(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self
            .values
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / self.values.len() as f64;
        var.sqrt()
    }
}

/// Z-score check of `iv` against the history.
///
/// The caller pushes `iv` into the history only after this check, so
/// an observation never dampens its own z-score. Requires
/// `min_history` samples and a non-degenerate std; otherwise no
/// anomaly ever fires.
pub fn check_anomaly(
    history: &IvHistory,
    iv: f64,
    threshold_std: f64,
    min_history: usize,
) -> Option<(f64, f64)> {
    if history.len() < min_history {
        return None;
    }
    let std = history.std();
    if std <= 0.0 {
        return None;
    }
    let mean = history.mean();
    let z = (iv - mean).abs() / std;
    (z > threshold_std).then_some((z, mean))
}

/// Relative jump check of `iv` against the previous observation.
/// Returns the relative move when it exceeds the threshold.
pub fn check_change(iv: f64, prev_iv: f64, threshold: f64) -> Option<f64> {
    if prev_iv <= 0.0 {
        return None;
    }
    let rel = (iv - prev_iv) / prev_iv;
    (rel.abs() > threshold).then_some(rel)
}
