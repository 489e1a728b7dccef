//! Dupire local volatility from a fitted SSVI surface

use super::ssvi::ssvi_total_variance;
use super::types::SsviParameters;

const DK: f64 = 1e-4;
const DT: f64 = 1e-4;

fn total_variance(p: &SsviParameters, k: f64, t: f64) -> f64 {
    ssvi_total_variance(p.theta_at(t), p.rho, p.lambda, k)
}

/// Dupire local volatility at log-moneyness `k` and maturity `t`,
/// via central finite differences of total variance.
///
/// Falls back to the implied volatility at the same point when the
/// Dupire denominator (or the calendar term) is non-positive, which
/// marks a numerically invalid region of the surface.
pub fn local_volatility(p: &SsviParameters, k: f64, t: f64) -> f64 {
    let w = total_variance(p, k, t);
    let implied = (w.max(0.0) / t).sqrt();
    if w <= 0.0 {
        return implied;
    }

    let dw_dt = (total_variance(p, k, t + DT) - total_variance(p, k, (t - DT).max(1e-6)))
        / (t + DT - (t - DT).max(1e-6));
    let dw_dk = (total_variance(p, k + DK, t) - total_variance(p, k - DK, t)) / (2.0 * DK);
    let d2w_dk2 = (total_variance(p, k + DK, t) - 2.0 * w + total_variance(p, k - DK, t))
        / (DK * DK);

    let denominator = 1.0 - (k / w) * dw_dk
        + 0.25 * (-0.25 - 1.0 / w + (k * k) / (w * w)) * dw_dk * dw_dk
        + 0.5 * d2w_dk2;

    if denominator <= 0.0 || dw_dt <= 0.0 {
        return implied;
    }

    (dw_dt / denominator).sqrt()
}
