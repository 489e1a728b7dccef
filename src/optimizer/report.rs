//! Calibration reporting

use super::Score;

/// Calibration result plus diagnostics
#[derive(Debug, Clone)]
pub struct OptimizerReport {
    /// Threshold maximizing F1 over the replay
    pub best_threshold: f64,
    /// Scores at the chosen threshold
    pub score: Score,
    /// Aligned samples evaluated
    pub n_samples: usize,
    /// (threshold, f1) per grid candidate; empty for the bounded search
    pub curve: Vec<(f64, f64)>,
}

impl OptimizerReport {
    /// Format as table for CLI output
    pub fn format_table(&self) -> String {
        format!(
            r#"
══════════════════════════════════════════════════════
            THRESHOLD CALIBRATION RESULTS
══════════════════════════════════════════════════════

BEST THRESHOLD
───────────────────────────────────────────────────────
Threshold:        {:.6}
F1 Score:         {:.4}
Precision:        {:.4}
Recall:           {:.4}
Accuracy:         {:.4}

REPLAY
───────────────────────────────────────────────────────
Samples:          {}
Grid Points:      {}
══════════════════════════════════════════════════════
"#,
            self.best_threshold,
            self.score.f1,
            self.score.precision,
            self.score.recall,
            self.score.accuracy,
            self.n_samples,
            self.curve.len(),
        )
    }
}
