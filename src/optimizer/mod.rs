//! Threshold calibration against historical trades
//!
//! Replays the AR(1) volatility estimator over historical data, labels
//! high-volatility periods by a realized-vol quantile rule, and
//! searches for the threshold that maximizes F1 against those labels.

mod report;
mod search;

pub use report::OptimizerReport;
pub use search::{golden_section_search, grid_search};

use crate::config::{FilterConfig, OptimizerConfig, SearchStrategy};
use crate::feed::Trade;
use crate::filter::ar1_volatility;

/// Classification score for one candidate threshold
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Score {
    pub f1: f64,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
}

/// Replayed series: aligned AR(1) estimates and ground-truth labels
pub struct Backtest {
    /// AR(1) estimate per sample; None where the fit was undefined
    estimates: Vec<Option<f64>>,
    /// Ground-truth high-volatility labels
    labels: Vec<bool>,
}

impl Backtest {
    /// Replay historical trades into estimate/label series.
    ///
    /// Returns None when the history is too short to produce a single
    /// aligned sample.
    pub fn replay(
        trades: &[Trade],
        filter_config: &FilterConfig,
        optimizer_config: &OptimizerConfig,
    ) -> Option<Self> {
        let returns = log_returns(trades);
        let realized = rolling_std(&returns, optimizer_config.realized_window);

        // Both series are indexed by return position; evaluation starts
        // where the AR window and the realized window are both full
        let start = filter_config
            .window_size
            .max(optimizer_config.realized_window);
        if returns.len() <= start {
            return None;
        }

        let label_cutoff = quantile(
            &realized[start..]
                .iter()
                .flatten()
                .copied()
                .collect::<Vec<_>>(),
            optimizer_config.label_quantile,
        )?;

        let mut estimates = Vec::new();
        let mut labels = Vec::new();
        for i in start..returns.len() {
            let window = &returns[i - filter_config.window_size..i];
            estimates.push(ar1_volatility(window, filter_config.residual_window).ok());
            labels.push(realized[i].map(|rv| rv > label_cutoff).unwrap_or(false));
        }

        Some(Self { estimates, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Score a candidate threshold by F1 against the ground truth.
    ///
    /// Samples where the AR(1) estimate was undefined are excluded.
    /// Fewer than 2 distinct truth labels in the evaluated set scores
    /// worst-possible rather than erroring.
    pub fn score(&self, threshold: f64) -> Score {
        let mut tp = 0u64;
        let mut fp = 0u64;
        let mut tn = 0u64;
        let mut fn_ = 0u64;
        let mut saw_positive = false;
        let mut saw_negative = false;

        for (estimate, &label) in self.estimates.iter().zip(self.labels.iter()) {
            let Some(estimate) = estimate else { continue };
            if label {
                saw_positive = true;
            } else {
                saw_negative = true;
            }
            match (*estimate > threshold, label) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, true) => fn_ += 1,
                (false, false) => tn += 1,
            }
        }

        if !(saw_positive && saw_negative) {
            return Score::default();
        }

        let precision = if tp + fp > 0 {
            tp as f64 / (tp + fp) as f64
        } else {
            0.0
        };
        let recall = if tp + fn_ > 0 {
            tp as f64 / (tp + fn_) as f64
        } else {
            0.0
        };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let total = tp + fp + tn + fn_;
        let accuracy = if total > 0 {
            (tp + tn) as f64 / total as f64
        } else {
            0.0
        };

        Score {
            f1,
            precision,
            recall,
            accuracy,
        }
    }
}

/// Run the configured search over the replayed history
pub fn optimize(
    trades: &[Trade],
    filter_config: &FilterConfig,
    optimizer_config: &OptimizerConfig,
) -> Option<OptimizerReport> {
    let backtest = Backtest::replay(trades, filter_config, optimizer_config)?;
    if backtest.is_empty() {
        return None;
    }

    let report = match optimizer_config.search {
        SearchStrategy::Grid => grid_search(&backtest, optimizer_config),
        SearchStrategy::Bounded => golden_section_search(&backtest, optimizer_config),
    };

    tracing::info!(
        threshold = report.best_threshold,
        f1 = report.score.f1,
        samples = backtest.len(),
        "Threshold calibration complete"
    );
    Some(report)
}

fn log_returns(trades: &[Trade]) -> Vec<f64> {
    let mut returns = Vec::with_capacity(trades.len().saturating_sub(1));
    let mut last: Option<f64> = None;
    for trade in trades {
        let price = trade.price_f64();
        if price <= 0.0 {
            continue;
        }
        if let Some(prev) = last {
            returns.push((price / prev).ln());
        }
        last = Some(price);
    }
    returns
}

/// Rolling standard deviation of the trailing `window` samples;
/// None until the window fills
fn rolling_std(values: &[f64], window: usize) -> Vec<Option<f64>> {
    values
        .iter()
        .enumerate()
        .map(|(i, _)| {
            if i + 1 < window {
                return None;
            }
            let slice = &values[i + 1 - window..=i];
            let n = slice.len() as f64;
            let mean = slice.iter().sum::<f64>() / n;
            let var = slice.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
            Some(var.sqrt())
        })
        .collect()
}

/// Empirical quantile (linear interpolation between order statistics)
fn quantile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        Some(sorted[lo])
    } else {
        Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Direction;
    use rust_decimal::Decimal;

    pub(crate) fn synthetic_trades(n: usize) -> Vec<Trade> {
        // Calm noise with a burst of large moves in the middle third
        let mut price = 100.0_f64;
        let mut trades = Vec::with_capacity(n);
        for i in 0..n {
            let burst = i >= n / 3 && i < 2 * n / 3;
            let scale = if burst { 0.004 } else { 0.0004 };
            let step = scale * (((i * 2654435761) % 17) as f64 - 8.0) / 8.0;
            price *= 1.0 + step;
            trades.push(Trade {
                timestamp_ms: 1_700_000_000_000 + i as i64 * 1000,
                instrument: "BTC-PERPETUAL".to_string(),
                price: Decimal::try_from(price).unwrap(),
                amount: Decimal::ONE,
                direction: Direction::Buy,
                trade_id: format!("t-{}", i),
                iv: None,
            });
        }
        trades
    }

    fn configs() -> (FilterConfig, OptimizerConfig) {
        (
            FilterConfig {
                window_size: 40,
                vol_threshold: 0.01,
                min_returns: 20,
                residual_window: 10,
            },
            OptimizerConfig::default(),
        )
    }

    #[test]
    fn test_rolling_std_alignment() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        let stds = rolling_std(&values, 3);
        assert_eq!(stds.len(), 4);
        assert!(stds[0].is_none());
        assert!(stds[1].is_none());
        assert!(stds[2].is_some());
    }

    #[test]
    fn test_quantile() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&values, 0.0), Some(1.0));
        assert_eq!(quantile(&values, 1.0), Some(5.0));
        assert_eq!(quantile(&values, 0.5), Some(3.0));
        assert_eq!(quantile(&[], 0.5), None);
    }

    #[test]
    fn test_replay_too_short() {
        let (fc, oc) = configs();
        let trades = synthetic_trades(10);
        assert!(Backtest::replay(&trades, &fc, &oc).is_none());
    }

    #[test]
    fn test_score_degenerate_labels() {
        let backtest = Backtest {
            estimates: vec![Some(0.01), Some(0.02), Some(0.03)],
            labels: vec![true, true, true],
        };
        assert_eq!(backtest.score(0.015), Score::default());
    }

    #[test]
    fn test_score_perfect_separation() {
        let backtest = Backtest {
            estimates: vec![Some(0.001), Some(0.002), Some(0.05), Some(0.06)],
            labels: vec![false, false, true, true],
        };
        let score = backtest.score(0.01);
        assert_eq!(score.f1, 1.0);
        assert_eq!(score.precision, 1.0);
        assert_eq!(score.recall, 1.0);
        assert_eq!(score.accuracy, 1.0);
    }

    #[test]
    fn test_undefined_estimates_excluded() {
        let backtest = Backtest {
            estimates: vec![None, Some(0.05), Some(0.001), None],
            labels: vec![true, true, false, false],
        };
        let score = backtest.score(0.01);
        // Only samples 1 and 2 count; both classified correctly
        assert_eq!(score.accuracy, 1.0);
    }

    #[test]
    fn test_optimize_finds_separating_threshold() {
        let (fc, oc) = configs();
        let trades = synthetic_trades(600);
        let report = optimize(&trades, &fc, &oc).expect("history long enough");
        assert!(report.best_threshold >= oc.threshold_min);
        assert!(report.best_threshold <= oc.threshold_max);
        // The burst regime is separable, F1 should be well above chance
        assert!(report.score.f1 > 0.3, "f1 {}", report.score.f1);
        assert_eq!(report.curve.len(), oc.grid_points);
    }
}
