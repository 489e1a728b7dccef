//! AR(1) model fitting over a returns window

use thiserror::Error;

/// Minimum return pairs for a meaningful OLS fit
const MIN_PAIRS: usize = 3;
/// Regressor variance below this is treated as degenerate
const VARIANCE_FLOOR: f64 = 1e-18;

/// AR(1) fit failures. Callers substitute a zero-volatility sentinel
/// and keep filtering; a failed fit is never fatal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FitError {
    #[error("need at least {need} returns, got {got}")]
    InsufficientData { need: usize, got: usize },
    #[error("regressor variance degenerate ({0:e})")]
    DegenerateVariance(f64),
    #[error("non-finite value in returns")]
    NonFinite,
}

/// A fitted AR(1) model `r_t = c + phi * r_(t-1) + e_t`
#[derive(Debug, Clone, PartialEq)]
pub struct Ar1Model {
    pub constant: f64,
    pub phi: f64,
    /// Residuals in sample order, one per return pair
    pub residuals: Vec<f64>,
}

impl Ar1Model {
    /// Standard deviation of the last `n` residuals; the instantaneous
    /// volatility estimate
    pub fn residual_volatility(&self, n: usize) -> f64 {
        let tail: &[f64] = if self.residuals.len() > n {
            &self.residuals[self.residuals.len() - n..]
        } else {
            &self.residuals
        };
        std_dev(tail)
    }
}

/// Fit an AR(1) model with constant trend on the returns by OLS
pub fn fit_ar1(returns: &[f64]) -> Result<Ar1Model, FitError> {
    if returns.len() < MIN_PAIRS + 1 {
        return Err(FitError::InsufficientData {
            need: MIN_PAIRS + 1,
            got: returns.len(),
        });
    }
    if returns.iter().any(|r| !r.is_finite()) {
        return Err(FitError::NonFinite);
    }

    // Lagged pairs: x = r_(t-1), y = r_t
    let n = (returns.len() - 1) as f64;
    let xs = &returns[..returns.len() - 1];
    let ys = &returns[1..];

    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;

    let mut cov_xy = 0.0;
    let mut var_x = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        cov_xy += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x) * (x - mean_x);
    }

    if var_x < VARIANCE_FLOOR {
        return Err(FitError::DegenerateVariance(var_x));
    }

    let phi = cov_xy / var_x;
    let constant = mean_y - phi * mean_x;

    let residuals = xs
        .iter()
        .zip(ys.iter())
        .map(|(x, y)| y - constant - phi * x)
        .collect();

    Ok(Ar1Model {
        constant,
        phi,
        residuals,
    })
}

/// Fit and reduce to the residual volatility of the last
/// `residual_window` residuals
pub fn ar1_volatility(returns: &[f64], residual_window: usize) -> Result<f64, FitError> {
    let model = fit_ar1(returns)?;
    Ok(model.residual_volatility(residual_window))
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
    variance.sqrt()
}
