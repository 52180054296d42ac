//! Regression detection against a flow's baseline

use serde::{Deserialize, Serialize};

use crate::baseline::PerformanceBaseline;
use crate::trace::ExecutionTrace;

/// Baselines with fewer samples than this never report a regression
pub const MIN_BASELINE_SAMPLES: u64 = 5;
/// Relative increase over the baseline that counts as a regression
pub const REGRESSION_THRESHOLD: f64 = 0.15;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionFinding {
    pub flow_id: String,
    pub execution_id: String,
    pub current_duration_ms: f64,
    pub baseline_duration_ms: f64,
    /// Relative duration change, e.g. 0.16 for 16% slower
    pub duration_regression: f64,
    /// Relative memory peak change; `None` when the baseline has no memory data
    pub memory_regression: Option<f64>,
    pub duration_regressed: bool,
    pub memory_regressed: bool,
}

impl RegressionFinding {
    pub fn regression_percent(&self) -> f64 {
        self.duration_regression * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct RegressionDetector {
    threshold: f64,
    min_samples: u64,
}

impl Default for RegressionDetector {
    fn default() -> Self {
        Self {
            threshold: REGRESSION_THRESHOLD,
            min_samples: MIN_BASELINE_SAMPLES,
        }
    }
}

impl RegressionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compare a completed trace against the baseline it should be judged by.
    ///
    /// Returns `None` when there is not enough data or when neither ratio
    /// exceeds the threshold.
    pub fn detect(&self, trace: &ExecutionTrace, baseline: &PerformanceBaseline) -> Option<RegressionFinding> {
        if baseline.sample_count < self.min_samples {
            return None;
        }
        let current_duration_ms = trace.total_duration_ms?;

        let duration_regression = relative_change(current_duration_ms, baseline.average_duration_ms);
        let memory_regression = relative_change(trace.memory_peak_mb, baseline.average_memory_usage_mb);

        let duration_regressed = duration_regression.map(|r| r > self.threshold).unwrap_or(false);
        let memory_regressed = memory_regression.map(|r| r > self.threshold).unwrap_or(false);

        if !duration_regressed && !memory_regressed {
            return None;
        }

        Some(RegressionFinding {
            flow_id: trace.flow_id.clone(),
            execution_id: trace.execution_id.clone(),
            current_duration_ms,
            baseline_duration_ms: baseline.average_duration_ms,
            duration_regression: duration_regression.unwrap_or(0.0),
            memory_regression,
            duration_regressed,
            memory_regressed,
        })
    }
}

fn relative_change(current: f64, baseline: f64) -> Option<f64> {
    if baseline > 0.0 {
        Some((current - baseline) / baseline)
    } else {
        None
    }
}
