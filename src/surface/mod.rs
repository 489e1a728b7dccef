//! Volatility surface engine
//!
//! Fits a parametric SSVI surface across maturity slices, falling back
//! to thin-plate-spline interpolation when the parametric fit is
//! infeasible. Inputs are plain (strike, maturity, IV) observations;
//! the engine holds no state and a failed fit is never published.

mod interp;
mod local_vol;
mod ssvi;
mod types;

pub use interp::fit_interpolated;
pub use local_vol::local_volatility;
pub use ssvi::{fit_ssvi, ssvi_total_variance, SliceFit, SsviFit};
pub use types::{SsviParameters, SurfaceError, SurfaceFit, SurfaceModel, SurfacePoint};

use crate::config::SurfaceConfig;

/// Moneyness grid resolution (K/S ratios)
pub const MONEYNESS_POINTS: usize = 50;
/// Maturity grid resolution
pub const MATURITY_POINTS: usize = 30;

/// Fit the surface: parametric SSVI first, interpolation fallback.
///
/// Returns an error only when neither path can produce a usable
/// surface; callers then retain the previous fit.
pub fn fit_surface(
    points: &[SurfacePoint],
    spot: f64,
    timestamp_ms: i64,
    underlying: &str,
    config: &SurfaceConfig,
) -> Result<SurfaceFit, SurfaceError> {
    match fit_ssvi(points, spot, timestamp_ms, underlying, config) {
        Ok(fit) => Ok(fit),
        Err(e) => {
            tracing::debug!(error = %e, "SSVI fit infeasible, interpolating");
            fit_interpolated(points, spot, timestamp_ms, underlying, config)
        }
    }
}

/// Evenly spaced moneyness grid in [0.5, 2.0]
pub(crate) fn moneyness_grid() -> Vec<f64> {
    let lo = 0.5_f64;
    let hi = 2.0_f64;
    (0..MONEYNESS_POINTS)
        .map(|i| lo + (hi - lo) * i as f64 / (MONEYNESS_POINTS - 1) as f64)
        .collect()
}

/// Evenly spaced maturity grid over the observed time range
pub(crate) fn maturity_grid(t_min: f64, t_max: f64) -> Vec<f64> {
    let lo = t_min.max(1.0 / 365.0);
    let hi = t_max.max(lo * 1.001);
    (0..MATURITY_POINTS)
        .map(|i| lo + (hi - lo) * i as f64 / (MATURITY_POINTS - 1) as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_moneyness_grid_shape() {
        let grid = moneyness_grid();
        assert_eq!(grid.len(), MONEYNESS_POINTS);
        assert_eq!(grid[0], 0.5);
        assert!((grid[MONEYNESS_POINTS - 1] - 2.0).abs() < 1e-12);
        assert!(grid.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_maturity_grid_floor() {
        let grid = maturity_grid(0.0, 0.5);
        assert_eq!(grid.len(), MATURITY_POINTS);
        assert!(grid[0] >= 1.0 / 365.0);
    }
}
