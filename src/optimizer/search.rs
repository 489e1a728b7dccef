//! Threshold search strategies

use super::report::OptimizerReport;
use super::Backtest;
use crate::config::OptimizerConfig;

const GOLDEN_RATIO: f64 = 0.618_033_988_749_894_8;
const GOLDEN_ITERATIONS: usize = 50;

/// Exhaustive grid over the threshold interval. Default strategy:
/// reproducible and yields the full score curve for diagnostics.
pub fn grid_search(backtest: &Backtest, config: &OptimizerConfig) -> OptimizerReport {
    let n = config.grid_points.max(2);
    let mut curve = Vec::with_capacity(n);
    let mut best_threshold = config.threshold_min;
    let mut best = backtest.score(best_threshold);

    for i in 0..n {
        let threshold = config.threshold_min
            + (config.threshold_max - config.threshold_min) * i as f64 / (n - 1) as f64;
        let score = backtest.score(threshold);
        curve.push((threshold, score.f1));
        // Strict improvement keeps ties on the lowest threshold
        if score.f1 > best.f1 {
            best = score;
            best_threshold = threshold;
        }
    }

    OptimizerReport {
        best_threshold,
        score: best,
        n_samples: backtest.len(),
        curve,
    }
}

/// Golden-section maximization of F1 over the threshold interval.
/// No score curve is produced; use the grid for diagnostics.
pub fn golden_section_search(backtest: &Backtest, config: &OptimizerConfig) -> OptimizerReport {
    let mut lo = config.threshold_min;
    let mut hi = config.threshold_max;

    let mut x1 = hi - GOLDEN_RATIO * (hi - lo);
    let mut x2 = lo + GOLDEN_RATIO * (hi - lo);
    let mut f1 = backtest.score(x1).f1;
    let mut f2 = backtest.score(x2).f1;

    for _ in 0..GOLDEN_ITERATIONS {
        if f1 > f2 {
            hi = x2;
            x2 = x1;
            f2 = f1;
            x1 = hi - GOLDEN_RATIO * (hi - lo);
            f1 = backtest.score(x1).f1;
        } else {
            lo = x1;
            x1 = x2;
            f1 = f2;
            x2 = lo + GOLDEN_RATIO * (hi - lo);
            f2 = backtest.score(x2).f1;
        }
        if hi - lo < 1e-7 {
            break;
        }
    }

    let best_threshold = 0.5 * (lo + hi);
    OptimizerReport {
        best_threshold,
        score: backtest.score(best_threshold),
        n_samples: backtest.len(),
        curve: Vec::new(),
    }
}
