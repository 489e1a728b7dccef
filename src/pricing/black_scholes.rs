//! Black-Scholes pricing, Greeks and Newton-Raphson implied volatility

use super::OptionType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Newton-Raphson iteration cap for implied vol
const MAX_IV_ITERATIONS: usize = 100;
/// Price tolerance for implied vol convergence
const IV_TOLERANCE: f64 = 1e-6;
/// Initial vol guess for the Newton-Raphson solve
const IV_SEED: f64 = 0.3;
/// Vega below this is treated as an underflow and aborts the solve
const VEGA_FLOOR: f64 = 1e-12;

/// Pricing errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PricingError {
    /// Newton-Raphson failed to converge within the iteration cap
    #[error("implied vol did not converge after {0} iterations")]
    NoConvergence(usize),
    /// Observed price is below intrinsic value; no vol reprices it
    #[error("price {price} below intrinsic value {intrinsic}")]
    BelowIntrinsic { price: f64, intrinsic: f64 },
    /// Vega underflowed during the solve
    #[error("vega underflow at vol {0}")]
    VegaUnderflow(f64),
}

/// Option price sensitivities.
///
/// `vega` is per 1 vol point (1%), `theta` is per calendar day; the
/// remaining Greeks are in natural units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub rho: f64,
}

/// Standard normal CDF approximation (Abramowitz and Stegun)
pub fn norm_cdf(x: f64) -> f64 {
    let a1 = 0.254829592;
    let a2 = -0.284496736;
    let a3 = 1.421413741;
    let a4 = -1.453152027;
    let a5 = 1.061405429;
    let p = 0.3275911;

    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;

    let t = 1.0 / (1.0 + p * x);
    let y = 1.0 - (((((a5 * t + a4) * t) + a3) * t + a2) * t + a1) * t * (-x * x).exp();

    0.5 * (1.0 + sign * y)
}

/// Standard normal PDF
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn d1_d2(spot: f64, strike: f64, t: f64, rate: f64, vol: f64) -> (f64, f64) {
    let sqrt_t = t.sqrt();
    let d1 = ((spot / strike).ln() + (rate + 0.5 * vol * vol) * t) / (vol * sqrt_t);
    (d1, d1 - vol * sqrt_t)
}

/// Black-Scholes price. Zero or negative time to expiry returns the
/// intrinsic value.
pub fn price(spot: f64, strike: f64, t: f64, rate: f64, vol: f64, kind: OptionType) -> f64 {
    if t <= 0.0 || vol <= 0.0 {
        return kind.intrinsic(spot, strike);
    }

    let (d1, d2) = d1_d2(spot, strike, t, rate, vol);
    let disc = (-rate * t).exp();

    match kind {
        OptionType::Call => spot * norm_cdf(d1) - strike * disc * norm_cdf(d2),
        OptionType::Put => strike * disc * norm_cdf(-d2) - spot * norm_cdf(-d1),
    }
}

/// Dividend-adjusted Black-Scholes price: the spot is replaced by
/// `S * exp(-q * T)` for a continuous yield `q`.
pub fn price_with_dividend(
    spot: f64,
    strike: f64,
    t: f64,
    rate: f64,
    dividend_yield: f64,
    vol: f64,
    kind: OptionType,
) -> f64 {
    let adjusted_spot = if t > 0.0 {
        spot * (-dividend_yield * t).exp()
    } else {
        spot
    };
    price(adjusted_spot, strike, t, rate, vol, kind)
}

/// Cash-or-nothing binary price: pays 1 when the option finishes in the
/// money.
pub fn binary_price(spot: f64, strike: f64, t: f64, rate: f64, vol: f64, kind: OptionType) -> f64 {
    if t <= 0.0 || vol <= 0.0 {
        let itm = match kind {
            OptionType::Call => spot > strike,
            OptionType::Put => spot < strike,
        };
        return if itm { 1.0 } else { 0.0 };
    }

    let (_, d2) = d1_d2(spot, strike, t, rate, vol);
    let disc = (-rate * t).exp();

    match kind {
        OptionType::Call => disc * norm_cdf(d2),
        OptionType::Put => disc * norm_cdf(-d2),
    }
}

/// Full Greeks. At or past expiry delta collapses to {0, +-1} by
/// moneyness and the remaining Greeks are 0.
pub fn greeks(spot: f64, strike: f64, t: f64, rate: f64, vol: f64, kind: OptionType) -> Greeks {
    if t <= 0.0 || vol <= 0.0 {
        let delta = match kind {
            OptionType::Call => {
                if spot > strike {
                    1.0
                } else {
                    0.0
                }
            }
            OptionType::Put => {
                if spot < strike {
                    -1.0
                } else {
                    0.0
                }
            }
        };
        return Greeks {
            delta,
            ..Greeks::default()
        };
    }

    let (d1, d2) = d1_d2(spot, strike, t, rate, vol);
    let sqrt_t = t.sqrt();
    let disc = (-rate * t).exp();
    let pdf_d1 = norm_pdf(d1);

    let delta = match kind {
        OptionType::Call => norm_cdf(d1),
        OptionType::Put => norm_cdf(d1) - 1.0,
    };
    let gamma = pdf_d1 / (spot * vol * sqrt_t);
    // Per 1% vol move
    let vega = spot * pdf_d1 * sqrt_t / 100.0;

    let theta_annual = match kind {
        OptionType::Call => {
            -spot * pdf_d1 * vol / (2.0 * sqrt_t) - rate * strike * disc * norm_cdf(d2)
        }
        OptionType::Put => {
            -spot * pdf_d1 * vol / (2.0 * sqrt_t) + rate * strike * disc * norm_cdf(-d2)
        }
    };
    // Per calendar day
    let theta = theta_annual / 365.0;

    let rho = match kind {
        OptionType::Call => strike * t * disc * norm_cdf(d2) / 100.0,
        OptionType::Put => -strike * t * disc * norm_cdf(-d2) / 100.0,
    };

    Greeks {
        delta,
        gamma,
        vega,
        theta,
        rho,
    }
}

/// Implied volatility via Newton-Raphson on the Black-Scholes price.
///
/// Fails when the observed price sits below intrinsic value, when vega
/// underflows mid-solve, or when the iteration cap is reached.
pub fn implied_vol(
    observed_price: f64,
    spot: f64,
    strike: f64,
    t: f64,
    rate: f64,
    kind: OptionType,
) -> Result<f64, PricingError> {
    let intrinsic = kind.intrinsic(spot, strike);
    if observed_price < intrinsic {
        return Err(PricingError::BelowIntrinsic {
            price: observed_price,
            intrinsic,
        });
    }

    let mut vol = IV_SEED;
    for _ in 0..MAX_IV_ITERATIONS {
        let model_price = price(spot, strike, t, rate, vol, kind);
        let diff = model_price - observed_price;
        if diff.abs() < IV_TOLERANCE {
            return Ok(vol);
        }

        // Raw vega (per unit vol) for the Newton step
        let (d1, _) = d1_d2(spot, strike, t, rate, vol);
        let vega = spot * norm_pdf(d1) * t.sqrt();
        if vega < VEGA_FLOOR {
            return Err(PricingError::VegaUnderflow(vol));
        }

        vol -= diff / vega;
        if vol <= 0.0 {
            vol = IV_TOLERANCE;
        }
    }

    Err(PricingError::NoConvergence(MAX_IV_ITERATIONS))
}
