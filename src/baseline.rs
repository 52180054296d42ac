//! Per-flow performance baselines maintained as exponential moving averages

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

use crate::trace::ExecutionTrace;

/// Weight given to the newest sample
pub const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub flow_id: String,
    pub average_duration_ms: f64,
    pub average_memory_usage_mb: f64,
    pub average_cpu_usage: f64,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl PerformanceBaseline {
    fn seed(flow_id: &str, sample: &BaselineSample) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            average_duration_ms: sample.duration_ms,
            average_memory_usage_mb: sample.memory_peak_mb,
            average_cpu_usage: sample.cpu_usage,
            sample_count: 1,
            last_updated: Utc::now(),
        }
    }

    fn absorb(&mut self, sample: &BaselineSample) {
        self.average_duration_ms = ema(self.average_duration_ms, sample.duration_ms);
        self.average_memory_usage_mb = ema(self.average_memory_usage_mb, sample.memory_peak_mb);
        self.average_cpu_usage = ema(self.average_cpu_usage, sample.cpu_usage);
        self.sample_count += 1;
        self.last_updated = Utc::now();
    }
}

fn ema(average: f64, sample: f64) -> f64 {
    average * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA
}

/// Values a completed trace contributes to its flow baseline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BaselineSample {
    pub duration_ms: f64,
    pub memory_peak_mb: f64,
    pub cpu_usage: f64,
}

impl BaselineSample {
    /// `None` for traces that never recorded a total duration
    pub fn from_trace(trace: &ExecutionTrace) -> Option<Self> {
        Some(Self {
            duration_ms: trace.total_duration_ms?,
            memory_peak_mb: trace.memory_peak_mb,
            cpu_usage: trace.cpu_usage,
        })
    }
}

/// Process-wide map of flow baselines.
///
/// Every update happens under one lock, so concurrent completions for the
/// same flow are applied one after another.
#[derive(Debug, Default)]
pub struct BaselineManager {
    baselines: Mutex<FxHashMap<String, PerformanceBaseline>>,
}

impl BaselineManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `sample` into the flow baseline.
    ///
    /// Returns the baseline as it was before this update (`None` for the
    /// first sample) together with the updated baseline.
    pub fn update(
        &self,
        flow_id: &str,
        sample: BaselineSample,
    ) -> (Option<PerformanceBaseline>, PerformanceBaseline) {
        let mut baselines = self.baselines.lock().unwrap_or_else(|e| e.into_inner());

        match baselines.get_mut(flow_id) {
            Some(baseline) => {
                let previous = baseline.clone();
                baseline.absorb(&sample);
                debug!(
                    flow_id,
                    average_duration_ms = baseline.average_duration_ms,
                    sample_count = baseline.sample_count,
                    "Baseline updated"
                );
                (Some(previous), baseline.clone())
            }
            None => {
                let baseline = PerformanceBaseline::seed(flow_id, &sample);
                debug!(flow_id, average_duration_ms = baseline.average_duration_ms, "Baseline created");
                baselines.insert(flow_id.to_string(), baseline.clone());
                (None, baseline)
            }
        }
    }

    pub fn get(&self, flow_id: &str) -> Option<PerformanceBaseline> {
        self.baselines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(flow_id)
            .cloned()
    }

    /// Copy of every baseline, for analytical reads
    pub fn snapshot(&self) -> FxHashMap<String, PerformanceBaseline> {
        self.baselines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn remove(&self, flow_id: &str) -> Option<PerformanceBaseline> {
        self.baselines.lock().unwrap_or_else(|e| e.into_inner()).remove(flow_id)
    }

    pub fn clear(&self) {
        self.baselines.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.baselines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
