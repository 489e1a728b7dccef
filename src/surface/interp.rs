//! Non-parametric surface fallback
//!
//! Thin-plate-spline radial interpolation over (log-moneyness,
//! time-to-maturity) -> total implied variance, evaluated on the fixed
//! output grid. Used whenever the parametric fit is infeasible.

use super::types::{SurfaceError, SurfaceFit, SurfaceModel, SurfacePoint};
use super::{maturity_grid, moneyness_grid};
use crate::config::SurfaceConfig;

/// Minimum observations for a meaningful interpolation
const MIN_POINTS: usize = 4;

/// Thin-plate radial basis: r^2 * ln(r), zero at r = 0
fn tps_kernel(r: f64) -> f64 {
    if r <= 0.0 {
        0.0
    } else {
        r * r * r.ln()
    }
}

struct TpsSurface {
    /// Interpolation nodes (k, t)
    nodes: Vec<(f64, f64)>,
    /// RBF weights, one per node
    weights: Vec<f64>,
    /// Affine part: a0 + a1 * k + a2 * t
    affine: [f64; 3],
}

impl TpsSurface {
    /// Solve the TPS system for values at scattered nodes
    fn fit(nodes: &[(f64, f64)], values: &[f64]) -> Result<Self, SurfaceError> {
        let n = nodes.len();
        let dim = n + 3;

        // [ K  P ] [w]   [v]
        // [ P' 0 ] [a] = [0]
        let mut a = vec![vec![0.0_f64; dim]; dim];
        let mut b = vec![0.0_f64; dim];

        for i in 0..n {
            for j in 0..n {
                let dk = nodes[i].0 - nodes[j].0;
                let dt = nodes[i].1 - nodes[j].1;
                a[i][j] = tps_kernel((dk * dk + dt * dt).sqrt());
            }
            // Light ridge keeps near-duplicate nodes solvable
            a[i][i] += 1e-10;
            a[i][n] = 1.0;
            a[i][n + 1] = nodes[i].0;
            a[i][n + 2] = nodes[i].1;
            a[n][i] = 1.0;
            a[n + 1][i] = nodes[i].0;
            a[n + 2][i] = nodes[i].1;
            b[i] = values[i];
        }

        // A degenerate span (e.g. a single maturity slice) makes the
        // matching affine column collinear with the constant term; pin
        // that coefficient to zero instead of failing the solve
        for (axis, col) in [(0usize, n + 1), (1usize, n + 2)] {
            let lo = nodes
                .iter()
                .map(|p| if axis == 0 { p.0 } else { p.1 })
                .fold(f64::INFINITY, f64::min);
            let hi = nodes
                .iter()
                .map(|p| if axis == 0 { p.0 } else { p.1 })
                .fold(f64::NEG_INFINITY, f64::max);
            if hi - lo < 1e-9 {
                for i in 0..dim {
                    a[i][col] = 0.0;
                    a[col][i] = 0.0;
                }
                a[col][col] = 1.0;
                b[col] = 0.0;
            }
        }

        let solution = solve_dense(&mut a, &mut b)?;
        Ok(Self {
            nodes: nodes.to_vec(),
            weights: solution[..n].to_vec(),
            affine: [solution[n], solution[n + 1], solution[n + 2]],
        })
    }

    fn evaluate(&self, k: f64, t: f64) -> f64 {
        let mut value = self.affine[0] + self.affine[1] * k + self.affine[2] * t;
        for (node, weight) in self.nodes.iter().zip(self.weights.iter()) {
            let dk = k - node.0;
            let dt = t - node.1;
            value += weight * tps_kernel((dk * dk + dt * dt).sqrt());
        }
        value
    }
}

/// Gaussian elimination with partial pivoting
fn solve_dense(a: &mut [Vec<f64>], b: &mut [f64]) -> Result<Vec<f64>, SurfaceError> {
    let n = b.len();
    for col in 0..n {
        let pivot_row = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .ok_or(SurfaceError::SingularSystem)?;
        if a[pivot_row][col].abs() < 1e-14 {
            return Err(SurfaceError::SingularSystem);
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for c in col..n {
                a[row][c] -= factor * a[col][c];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0_f64; n];
    for row in (0..n).rev() {
        let mut sum = b[row];
        for col in (row + 1)..n {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Ok(x)
}

/// Build an interpolated surface on the fixed output grid
pub fn fit_interpolated(
    points: &[SurfacePoint],
    spot: f64,
    timestamp_ms: i64,
    underlying: &str,
    config: &SurfaceConfig,
) -> Result<SurfaceFit, SurfaceError> {
    if points.len() < MIN_POINTS {
        return Err(SurfaceError::InsufficientData {
            need: MIN_POINTS,
            got: points.len(),
        });
    }

    let nodes: Vec<(f64, f64)> = points
        .iter()
        .map(|p| {
            let forward = spot * (config.risk_free_rate * p.ttm).exp();
            (p.log_moneyness(forward), p.ttm)
        })
        .collect();
    let variances: Vec<f64> = points.iter().map(|p| p.total_variance()).collect();

    let tps = TpsSurface::fit(&nodes, &variances)?;

    let t_min = points.iter().map(|p| p.ttm).fold(f64::INFINITY, f64::min);
    let t_max = points.iter().map(|p| p.ttm).fold(0.0_f64, f64::max);

    let moneyness = moneyness_grid();
    let maturities = maturity_grid(t_min, t_max);
    let clip = |vol: f64| vol.clamp(config.vol_floor, config.vol_cap);

    let mut iv_grid = Vec::with_capacity(maturities.len());
    for &t in &maturities {
        let row: Vec<f64> = moneyness
            .iter()
            .map(|&m| {
                let w = tps.evaluate(m.ln(), t);
                clip((w.max(0.0) / t).sqrt())
            })
            .collect();
        iv_grid.push(row);
    }

    // ATM column: moneyness closest to 1.0
    let atm_col = moneyness
        .iter()
        .enumerate()
        .min_by(|a, b| (a.1 - 1.0).abs().total_cmp(&(b.1 - 1.0).abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);

    let term_structure: Vec<(f64, f64)> = maturities
        .iter()
        .zip(iv_grid.iter())
        .map(|(&t, row)| (t, row[atm_col]))
        .collect();
    let smile: Vec<(f64, f64)> = moneyness
        .iter()
        .cloned()
        .zip(iv_grid[0].iter().cloned())
        .collect();
    let atm_vol = iv_grid[0][atm_col];

    // Fit quality against the inputs
    let mut sum_sq = 0.0;
    for (point, node) in points.iter().zip(nodes.iter()) {
        let w = tps.evaluate(node.0, node.1);
        let iv_model = clip((w.max(0.0) / point.ttm).sqrt());
        sum_sq += (iv_model - point.iv) * (iv_model - point.iv);
    }
    let rmse = (sum_sq / points.len() as f64).sqrt();

    Ok(SurfaceFit {
        timestamp_ms,
        underlying: underlying.to_string(),
        spot_price: spot,
        model: SurfaceModel::Interpolated,
        moneyness_grid: moneyness,
        maturity_grid: maturities,
        iv_grid,
        atm_vol,
        rmse,
        n_points: points.len(),
        term_structure,
        smile,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scattered_points() -> Vec<SurfacePoint> {
        let mut points = Vec::new();
        for &t in &[0.1_f64, 0.3, 0.6] {
            for &m in &[0.85_f64, 0.95, 1.0, 1.05, 1.15] {
                // Smile: base vol plus curvature in log-moneyness
                let k: f64 = m.ln();
                let iv = 0.5 + 0.3 * k * k - 0.1 * k;
                points.push(SurfacePoint {
                    strike: 100.0 * m,
                    ttm: t,
                    iv,
                });
            }
        }
        points
    }

    #[test]
    fn test_interpolation_passes_through_nodes() {
        let points = scattered_points();
        let config = SurfaceConfig::default();
        let fit =
            fit_interpolated(&points, 100.0, 1_700_000_000_000, "BTC", &config).unwrap();
        // TPS interpolates, so input residuals should be tiny
        assert!(fit.rmse < 1e-4, "rmse {}", fit.rmse);
        assert!(matches!(fit.model, SurfaceModel::Interpolated));
    }

    #[test]
    fn test_grid_clipped_to_vol_band() {
        let points = scattered_points();
        let config = SurfaceConfig::default();
        let fit =
            fit_interpolated(&points, 100.0, 1_700_000_000_000, "BTC", &config).unwrap();
        for row in &fit.iv_grid {
            for &iv in row {
                assert!((config.vol_floor..=config.vol_cap).contains(&iv));
            }
        }
        assert_eq!(fit.iv_grid.len(), super::super::MATURITY_POINTS);
        assert_eq!(fit.iv_grid[0].len(), super::super::MONEYNESS_POINTS);
    }

    #[test]
    fn test_single_maturity_slice_solves() {
        let points: Vec<SurfacePoint> = [0.9_f64, 0.95, 1.0, 1.05, 1.1]
            .iter()
            .map(|&m| SurfacePoint {
                strike: 100.0 * m,
                ttm: 0.25,
                iv: 0.5 + 0.2 * m.ln() * m.ln(),
            })
            .collect();
        let config = SurfaceConfig::default();
        let fit = fit_interpolated(&points, 100.0, 0, "BTC", &config).unwrap();
        assert!(fit.atm_vol > 0.0);
        assert!(fit.rmse < 0.05, "rmse {}", fit.rmse);
    }

    #[test]
    fn test_too_few_points() {
        let points = vec![
            SurfacePoint {
                strike: 100.0,
                ttm: 0.1,
                iv: 0.5,
            };
            3
        ];
        let config = SurfaceConfig::default();
        assert!(matches!(
            fit_interpolated(&points, 100.0, 0, "BTC", &config),
            Err(SurfaceError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_solve_dense_known_system() {
        let mut a = vec![vec![2.0, 1.0], vec![1.0, 3.0]];
        let mut b = vec![5.0, 10.0];
        let x = solve_dense(&mut a, &mut b).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-12);
        assert!((x[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_term_structure_and_smile_shapes() {
        let points = scattered_points();
        let config = SurfaceConfig::default();
        let fit =
            fit_interpolated(&points, 100.0, 1_700_000_000_000, "BTC", &config).unwrap();
        assert_eq!(fit.term_structure.len(), fit.maturity_grid.len());
        assert_eq!(fit.smile.len(), fit.moneyness_grid.len());
        assert!(fit.atm_vol > 0.0);
    }
}
