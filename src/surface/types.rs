//! Surface fit input/output types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One observed option quote used for fitting
#[derive(Debug, Clone, Copy)]
pub struct SurfacePoint {
    /// Strike price
    pub strike: f64,
    /// Time to maturity in year fractions
    pub ttm: f64,
    /// Observed implied volatility (annualized)
    pub iv: f64,
}

impl SurfacePoint {
    /// Log-moneyness against the forward
    pub fn log_moneyness(&self, forward: f64) -> f64 {
        (self.strike / forward).ln()
    }

    /// Total implied variance
    pub fn total_variance(&self) -> f64 {
        self.iv * self.iv * self.ttm
    }
}

/// Global SSVI parameters: power-law ATM variance `theta * t^gamma`
/// plus correlation `rho` and curvature `lambda`
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SsviParameters {
    pub theta: f64,
    pub gamma: f64,
    pub rho: f64,
    pub lambda: f64,
}

impl SsviParameters {
    /// ATM total variance at maturity `t` under the power law
    pub fn theta_at(&self, t: f64) -> f64 {
        self.theta * t.powf(self.gamma)
    }

    /// No-calendar-arbitrage check over the observed maturities
    pub fn validate(&self, observed_ttms: &[f64]) -> Result<(), SurfaceError> {
        if self.gamma <= 0.0 {
            return Err(SurfaceError::CalendarArbitrage {
                detail: format!("gamma {} <= 0", self.gamma),
            });
        }
        for &t in observed_ttms {
            let theta_t = self.theta_at(t);
            if theta_t <= 0.0 {
                return Err(SurfaceError::CalendarArbitrage {
                    detail: format!("total variance {} <= 0 at t={}", theta_t, t),
                });
            }
        }
        Ok(())
    }
}

/// Which model produced the surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "lowercase")]
pub enum SurfaceModel {
    Parametric { parameters: SsviParameters },
    Interpolated,
}

/// A complete fitted surface. Superseded by the next fit, never
/// mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurfaceFit {
    pub timestamp_ms: i64,
    pub underlying: String,
    pub spot_price: f64,
    pub model: SurfaceModel,
    /// K/S ratios, ascending
    pub moneyness_grid: Vec<f64>,
    /// Year fractions, ascending
    pub maturity_grid: Vec<f64>,
    /// iv_grid[maturity][moneyness]
    pub iv_grid: Vec<Vec<f64>>,
    /// ATM vol at the shortest observed maturity
    pub atm_vol: f64,
    /// Root-mean-square error of model vs observed IVs
    pub rmse: f64,
    /// Observations used in the fit
    pub n_points: usize,
    /// (maturity, atm_iv) per grid maturity
    pub term_structure: Vec<(f64, f64)>,
    /// (moneyness, iv) at the nearest-term grid maturity
    pub smile: Vec<(f64, f64)>,
}

/// Surface fitting failures
#[derive(Debug, Clone, Error)]
pub enum SurfaceError {
    #[error("insufficient data: need {need}, got {got}")]
    InsufficientData { need: usize, got: usize },
    #[error("calendar arbitrage: {detail}")]
    CalendarArbitrage { detail: String },
    #[error("slice fit diverged (rmse {rmse})")]
    FitDiverged { rmse: f64 },
    #[error("singular interpolation system")]
    SingularSystem,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_conversions() {
        let p = SurfacePoint {
            strike: 110.0,
            ttm: 0.25,
            iv: 0.4,
        };
        assert!((p.log_moneyness(100.0) - (1.1_f64).ln()).abs() < 1e-12);
        assert!((p.total_variance() - 0.04).abs() < 1e-12);
    }

    #[test]
    fn test_validate_rejects_negative_gamma() {
        let params = SsviParameters {
            theta: 0.04,
            gamma: -0.1,
            rho: -0.7,
            lambda: 0.4,
        };
        assert!(params.validate(&[0.1, 0.5]).is_err());
    }

    #[test]
    fn test_validate_rejects_nonpositive_variance() {
        let params = SsviParameters {
            theta: -0.04,
            gamma: 0.7,
            rho: -0.7,
            lambda: 0.4,
        };
        assert!(params.validate(&[0.1]).is_err());
    }

    #[test]
    fn test_validate_accepts_clean_params() {
        let params = SsviParameters {
            theta: 0.04,
            gamma: 0.7,
            rho: -0.7,
            lambda: 0.4,
        };
        assert!(params.validate(&[0.05, 0.25, 1.0]).is_ok());
    }
}
