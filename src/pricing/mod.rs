//! Options pricing module
//!
//! Closed-form Black-Scholes pricing, Greeks and implied volatility.
//! Everything here is a pure function over f64 inputs: deterministic,
//! stateless and safe to call concurrently.

mod black_scholes;

pub use black_scholes::{
    binary_price, greeks, implied_vol, norm_cdf, norm_pdf, price, price_with_dividend, Greeks,
    PricingError,
};

use serde::{Deserialize, Serialize};

/// Option payoff type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Intrinsic value at expiry
    pub fn intrinsic(&self, spot: f64, strike: f64) -> f64 {
        match self {
            OptionType::Call => (spot - strike).max(0.0),
            OptionType::Put => (strike - spot).max(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsic_call() {
        assert_eq!(OptionType::Call.intrinsic(110.0, 100.0), 10.0);
        assert_eq!(OptionType::Call.intrinsic(90.0, 100.0), 0.0);
    }

    #[test]
    fn test_intrinsic_put() {
        assert_eq!(OptionType::Put.intrinsic(90.0, 100.0), 10.0);
        assert_eq!(OptionType::Put.intrinsic(110.0, 100.0), 0.0);
    }
}
