//! Parametric SSVI surface fitting
//!
//! Per-maturity slices are fit with theta_t pinned to the slice ATM
//! total variance and (rho, phi) found by damped Gauss-Newton with a
//! finite-difference jacobian. Slices aggregate to a global power law
//! `theta_t = theta * t^gamma`, which is rejected when it admits
//! calendar arbitrage.

use super::types::{SsviParameters, SurfaceError, SurfaceFit, SurfaceModel, SurfacePoint};
use super::{maturity_grid, moneyness_grid};
use crate::config::SurfaceConfig;
use std::collections::BTreeMap;

const MAX_ITERATIONS: usize = 100;
const FD_BUMP: f64 = 1e-5;
const DAMPING: f64 = 1e-4;
const CONVERGENCE: f64 = 1e-14;
/// Global rmse above this marks the fit as diverged
const DIVERGENCE_RMSE: f64 = 0.15;

const RHO_MIN: f64 = -0.99;
const RHO_MAX: f64 = 0.99;
const PHI_MIN: f64 = 0.01;
const PHI_MAX: f64 = 2.0;

/// SSVI total variance at log-moneyness `k` for a slice with ATM total
/// variance `theta_t`
pub fn ssvi_total_variance(theta_t: f64, rho: f64, phi: f64, k: f64) -> f64 {
    let pk = phi * k;
    0.5 * theta_t * (1.0 + rho * pk + ((pk + rho) * (pk + rho) + 1.0 - rho * rho).sqrt())
}

/// A calibrated maturity slice
#[derive(Debug, Clone)]
pub struct SliceFit {
    pub ttm: f64,
    /// ATM total variance, pinned before the (rho, phi) solve
    pub theta_t: f64,
    pub rho: f64,
    pub phi: f64,
    /// In-slice rmse in vol points
    pub rmse: f64,
    pub n_strikes: usize,
}

/// Full parametric fit result prior to grid evaluation
#[derive(Debug, Clone)]
pub struct SsviFit {
    pub parameters: SsviParameters,
    pub slices: Vec<SliceFit>,
    pub rmse: f64,
}

/// Fit the parametric surface and evaluate it onto the output grids
pub fn fit_ssvi(
    points: &[SurfacePoint],
    spot: f64,
    timestamp_ms: i64,
    underlying: &str,
    config: &SurfaceConfig,
) -> Result<SurfaceFit, SurfaceError> {
    let fit = calibrate(points, spot, config)?;

    let ttms: Vec<f64> = fit.slices.iter().map(|s| s.ttm).collect();
    let t_min = ttms.iter().cloned().fold(f64::INFINITY, f64::min);
    let t_max = ttms.iter().cloned().fold(0.0_f64, f64::max);

    let moneyness = moneyness_grid();
    let maturities = maturity_grid(t_min, t_max);
    let p = fit.parameters;

    let clip = |vol: f64| vol.clamp(config.vol_floor, config.vol_cap);

    let mut iv_grid = Vec::with_capacity(maturities.len());
    for &t in &maturities {
        let theta_t = p.theta_at(t);
        let row: Vec<f64> = moneyness
            .iter()
            .map(|&m| {
                let k = m.ln();
                let w = ssvi_total_variance(theta_t, p.rho, p.lambda, k);
                clip((w.max(0.0) / t).sqrt())
            })
            .collect();
        iv_grid.push(row);
    }

    let term_structure: Vec<(f64, f64)> = maturities
        .iter()
        .map(|&t| (t, clip((p.theta_at(t) / t).sqrt())))
        .collect();
    let smile: Vec<(f64, f64)> = moneyness
        .iter()
        .cloned()
        .zip(iv_grid[0].iter().cloned())
        .collect();
    let atm_vol = (p.theta_at(t_min) / t_min).sqrt();

    Ok(SurfaceFit {
        timestamp_ms,
        underlying: underlying.to_string(),
        spot_price: spot,
        model: SurfaceModel::Parametric { parameters: p },
        moneyness_grid: moneyness,
        maturity_grid: maturities,
        iv_grid,
        atm_vol,
        rmse: fit.rmse,
        n_points: points.len(),
        term_structure,
        smile,
    })
}

/// Calibrate slices and aggregate to global parameters
pub fn calibrate(
    points: &[SurfacePoint],
    spot: f64,
    config: &SurfaceConfig,
) -> Result<SsviFit, SurfaceError> {
    let groups = group_by_maturity(points);

    let mut slices = Vec::new();
    for (_, slice_points) in groups {
        if slice_points.len() < 3 {
            continue;
        }
        match fit_slice(&slice_points, spot, config.risk_free_rate) {
            Ok(slice) => slices.push(slice),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unfittable slice");
            }
        }
    }

    if slices.len() < 2 {
        return Err(SurfaceError::InsufficientData {
            need: 2,
            got: slices.len(),
        });
    }

    // Power law theta_t = theta * t^gamma via log-log regression
    let (gamma, ln_theta) = log_log_regression(
        &slices.iter().map(|s| s.ttm).collect::<Vec<_>>(),
        &slices.iter().map(|s| s.theta_t).collect::<Vec<_>>(),
    )?;
    let theta = ln_theta.exp();

    let n = slices.len() as f64;
    let rho = slices.iter().map(|s| s.rho).sum::<f64>() / n;
    let lambda = slices.iter().map(|s| s.phi).sum::<f64>() / n;

    let parameters = SsviParameters {
        theta,
        gamma,
        rho,
        lambda,
    };
    let ttms: Vec<f64> = slices.iter().map(|s| s.ttm).collect();
    parameters.validate(&ttms)?;

    let rmse = global_rmse(points, spot, config.risk_free_rate, &parameters);
    if !rmse.is_finite() || rmse > DIVERGENCE_RMSE {
        return Err(SurfaceError::FitDiverged { rmse });
    }

    Ok(SsviFit {
        parameters,
        slices,
        rmse,
    })
}

/// Fit (rho, phi) for one maturity slice by weighted damped
/// Gauss-Newton on total variance
fn fit_slice(points: &[SurfacePoint], spot: f64, rate: f64) -> Result<SliceFit, SurfaceError> {
    let ttm = points[0].ttm;
    let forward = spot * (rate * ttm).exp();

    let obs: Vec<(f64, f64)> = points
        .iter()
        .map(|p| (p.log_moneyness(forward), p.total_variance()))
        .collect();

    let theta_t = atm_total_variance(&obs)?;
    if theta_t <= 0.0 {
        return Err(SurfaceError::InsufficientData {
            need: 1,
            got: 0,
        });
    }

    let mut rho = -0.3_f64;
    let mut phi = 0.5_f64;

    for _ in 0..MAX_ITERATIONS {
        let mut jtj = [[0.0_f64; 2]; 2];
        let mut jtr = [0.0_f64; 2];

        for &(k, w_obs) in &obs {
            let weight = 1.0 / (1.0 + k * k);
            let w_model = ssvi_total_variance(theta_t, rho, phi, k);
            let residual = w_obs - w_model;

            let d_rho = (ssvi_total_variance(theta_t, rho + FD_BUMP, phi, k)
                - ssvi_total_variance(theta_t, rho - FD_BUMP, phi, k))
                / (2.0 * FD_BUMP);
            let d_phi = (ssvi_total_variance(theta_t, rho, phi + FD_BUMP, k)
                - ssvi_total_variance(theta_t, rho, phi - FD_BUMP, k))
                / (2.0 * FD_BUMP);

            jtj[0][0] += weight * d_rho * d_rho;
            jtj[0][1] += weight * d_rho * d_phi;
            jtj[1][0] += weight * d_phi * d_rho;
            jtj[1][1] += weight * d_phi * d_phi;
            jtr[0] += weight * d_rho * residual;
            jtr[1] += weight * d_phi * residual;
        }

        jtj[0][0] += DAMPING;
        jtj[1][1] += DAMPING;

        let det = jtj[0][0] * jtj[1][1] - jtj[0][1] * jtj[1][0];
        if det.abs() < 1e-18 {
            return Err(SurfaceError::SingularSystem);
        }
        let d_rho = (jtr[0] * jtj[1][1] - jtr[1] * jtj[0][1]) / det;
        let d_phi = (jtr[1] * jtj[0][0] - jtr[0] * jtj[1][0]) / det;

        rho = (rho + d_rho).clamp(RHO_MIN, RHO_MAX);
        phi = (phi + d_phi).clamp(PHI_MIN, PHI_MAX);

        if d_rho * d_rho + d_phi * d_phi < CONVERGENCE {
            break;
        }
    }

    // In-slice rmse in vol points
    let mut sum_sq = 0.0;
    for &(k, w_obs) in &obs {
        let w_model = ssvi_total_variance(theta_t, rho, phi, k);
        let iv_model = (w_model.max(0.0) / ttm).sqrt();
        let iv_obs = (w_obs / ttm).sqrt();
        sum_sq += (iv_model - iv_obs) * (iv_model - iv_obs);
    }
    let rmse = (sum_sq / obs.len() as f64).sqrt();

    Ok(SliceFit {
        ttm,
        theta_t,
        rho,
        phi,
        rmse,
        n_strikes: points.len(),
    })
}

/// ATM total variance for a slice: exact k=0 point when present,
/// linear interpolation between the bracketing strikes otherwise,
/// nearest strike as a last resort
fn atm_total_variance(obs: &[(f64, f64)]) -> Result<f64, SurfaceError> {
    let mut sorted: Vec<(f64, f64)> = obs.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    if let Some(&(_, w)) = sorted.iter().find(|(k, _)| k.abs() < 1e-12) {
        return Ok(w);
    }

    for pair in sorted.windows(2) {
        let (k0, w0) = pair[0];
        let (k1, w1) = pair[1];
        if k0 < 0.0 && k1 > 0.0 {
            return Ok(w0 + (w1 - w0) * (0.0 - k0) / (k1 - k0));
        }
    }

    sorted
        .iter()
        .min_by(|a, b| a.0.abs().total_cmp(&b.0.abs()))
        .map(|&(_, w)| w)
        .ok_or(SurfaceError::InsufficientData { need: 1, got: 0 })
}

/// Least-squares `ln y = intercept + slope * ln x`
fn log_log_regression(xs: &[f64], ys: &[f64]) -> Result<(f64, f64), SurfaceError> {
    let pairs: Vec<(f64, f64)> = xs
        .iter()
        .zip(ys.iter())
        .filter(|(&x, &y)| x > 0.0 && y > 0.0)
        .map(|(&x, &y)| (x.ln(), y.ln()))
        .collect();

    if pairs.len() < 2 {
        return Err(SurfaceError::InsufficientData {
            need: 2,
            got: pairs.len(),
        });
    }

    let n = pairs.len() as f64;
    let mean_x = pairs.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pairs.iter().map(|p| p.1).sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var = 0.0;
    for &(x, y) in &pairs {
        cov += (x - mean_x) * (y - mean_y);
        var += (x - mean_x) * (x - mean_x);
    }
    if var < 1e-18 {
        return Err(SurfaceError::SingularSystem);
    }

    let slope = cov / var;
    let intercept = mean_y - slope * mean_x;
    Ok((slope, intercept))
}

fn global_rmse(points: &[SurfacePoint], spot: f64, rate: f64, p: &SsviParameters) -> f64 {
    let mut sum_sq = 0.0;
    for point in points {
        let forward = spot * (rate * point.ttm).exp();
        let k = point.log_moneyness(forward);
        let w = ssvi_total_variance(p.theta_at(point.ttm), p.rho, p.lambda, k);
        let iv_model = (w.max(0.0) / point.ttm).sqrt();
        sum_sq += (iv_model - point.iv) * (iv_model - point.iv);
    }
    (sum_sq / points.len() as f64).sqrt()
}

fn group_by_maturity(points: &[SurfacePoint]) -> BTreeMap<i64, Vec<SurfacePoint>> {
    let mut groups: BTreeMap<i64, Vec<SurfacePoint>> = BTreeMap::new();
    for p in points {
        // Sub-minute ttm resolution is more than enough to bucket expiries
        let key = (p.ttm * 1e6).round() as i64;
        groups.entry(key).or_default().push(*p);
    }
    groups
}
