//! Bounded trace history and the analyses computed over it

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use crate::bottleneck::{self, Bottleneck};
use crate::config::PerformanceThresholds;
use crate::recommendations;
use crate::trace::ExecutionTrace;

/// Number of most recent samples used for trend fitting
pub const TREND_WINDOW: usize = 10;
/// Trends need at least this many samples to carry any confidence
pub const MIN_TREND_SAMPLES: usize = 3;
/// Change (in percent of the mean) beyond which a trend is not stable
pub const TREND_CHANGE_PERCENT: f64 = 5.0;

pub const NO_HISTORY_MESSAGE: &str = "No execution history available for this flow";

/// FIFO of finished traces shared by all flows
#[derive(Debug)]
pub struct TraceHistory {
    traces: Mutex<VecDeque<ExecutionTrace>>,
    capacity: usize,
}

impl TraceHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            traces: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    /// Append a trace, evicting the oldest entries beyond capacity.
    /// Returns how many traces were evicted.
    pub fn push(&self, trace: ExecutionTrace) -> usize {
        let mut traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        traces.push_back(trace);

        let mut evicted = 0;
        while traces.len() > self.capacity {
            traces.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Copy of the traces for one flow (or all flows), oldest first
    pub fn snapshot(&self, flow_id: Option<&str>) -> Vec<ExecutionTrace> {
        let traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        traces
            .iter()
            .filter(|t| flow_id.map(|f| t.flow_id == f).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Drop history for one flow, or everything when `flow_id` is `None`
    pub fn clear(&self, flow_id: Option<&str>) -> usize {
        let mut traces = self.traces.lock().unwrap_or_else(|e| e.into_inner());
        let before = traces.len();
        match flow_id {
            Some(flow_id) => traces.retain(|t| t.flow_id != flow_id),
            None => traces.clear(),
        }
        before - traces.len()
    }

    pub fn len(&self) -> usize {
        self.traces.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendMetric {
    Duration,
    Memory,
}

impl fmt::Display for TrendMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrendMetric::Duration => f.write_str("duration"),
            TrendMetric::Memory => f.write_str("memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceTrend {
    pub metric: TrendMetric,
    pub direction: TrendDirection,
    /// Slope relative to the mean, in percent per execution
    pub change_percent: f64,
    /// 0.0 - 1.0, grows with the number of samples
    pub confidence: f64,
    pub sample_count: usize,
}

impl PerformanceTrend {
    /// Fit a least-squares line through chronologically ordered values
    pub fn from_series(metric: TrendMetric, values: &[f64]) -> Self {
        let window = &values[values.len().saturating_sub(TREND_WINDOW)..];
        let n = window.len();

        if n < MIN_TREND_SAMPLES {
            return Self {
                metric,
                direction: TrendDirection::Stable,
                change_percent: 0.0,
                confidence: 0.0,
                sample_count: n,
            };
        }

        let nf = n as f64;
        let sum_x: f64 = (0..n).map(|i| i as f64).sum();
        let sum_y: f64 = window.iter().sum();
        let sum_xy: f64 = window.iter().enumerate().map(|(i, y)| i as f64 * y).sum();
        let sum_x2: f64 = (0..n).map(|i| (i * i) as f64).sum();

        let denominator = nf * sum_x2 - sum_x * sum_x;
        let slope = if denominator != 0.0 {
            (nf * sum_xy - sum_x * sum_y) / denominator
        } else {
            0.0
        };

        let mean = sum_y / nf;
        let change_percent = if mean != 0.0 { slope / mean * 100.0 } else { 0.0 };

        let direction = if change_percent > TREND_CHANGE_PERCENT {
            TrendDirection::Degrading
        } else if change_percent < -TREND_CHANGE_PERCENT {
            TrendDirection::Improving
        } else {
            TrendDirection::Stable
        };

        Self {
            metric,
            direction,
            change_percent,
            confidence: (nf / TREND_WINDOW as f64).min(1.0),
            sample_count: n,
        }
    }
}

/// Nearest-rank percentile over an ascending slice: index `floor(n * p)`.
/// Coarse for small `n`; no interpolation is applied.
pub fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64 * p).floor() as usize).min(sorted.len() - 1);
    sorted[index]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowPerformanceAnalysis {
    pub flow_id: String,
    pub execution_count: usize,
    pub average_duration_ms: f64,
    pub median_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub p99_duration_ms: f64,
    pub bottlenecks: Vec<Bottleneck>,
    pub recommendations: Vec<String>,
    pub trends: Vec<PerformanceTrend>,
}

impl FlowPerformanceAnalysis {
    fn empty(flow_id: &str) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            execution_count: 0,
            average_duration_ms: 0.0,
            median_duration_ms: 0.0,
            p95_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            bottlenecks: Vec::new(),
            recommendations: vec![NO_HISTORY_MESSAGE.to_string()],
            trends: Vec::new(),
        }
    }
}

/// Percentile, trend and bottleneck analysis over a flow's history
#[derive(Debug, Clone)]
pub struct HistoricalAnalyzer {
    thresholds: PerformanceThresholds,
}

impl HistoricalAnalyzer {
    pub fn new(thresholds: PerformanceThresholds) -> Self {
        Self { thresholds }
    }

    /// Analyze `traces` (oldest first) belonging to `flow_id`
    pub fn analyze(&self, flow_id: &str, traces: &[ExecutionTrace]) -> FlowPerformanceAnalysis {
        let finished: Vec<&ExecutionTrace> = traces
            .iter()
            .filter(|t| t.flow_id == flow_id && t.total_duration_ms.is_some())
            .collect();

        if finished.is_empty() {
            return FlowPerformanceAnalysis::empty(flow_id);
        }

        let chronological: Vec<f64> = finished.iter().filter_map(|t| t.total_duration_ms).collect();
        let mut sorted = chronological.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sorted.len();
        let average_duration_ms = sorted.iter().sum::<f64>() / n as f64;
        let median_duration_ms = nearest_rank(&sorted, 0.5);
        let p95_duration_ms = nearest_rank(&sorted, 0.95);
        let p99_duration_ms = nearest_rank(&sorted, 0.99);

        let memory_peaks: Vec<f64> = finished.iter().map(|t| t.memory_peak_mb).collect();
        let trends = vec![
            PerformanceTrend::from_series(TrendMetric::Duration, &chronological),
            PerformanceTrend::from_series(TrendMetric::Memory, &memory_peaks),
        ];

        let bottlenecks = bottleneck::aggregate(finished.iter().flat_map(|t| t.bottlenecks.iter()));

        let recommendations =
            recommendations::generate_text_recommendations(p95_duration_ms, &bottlenecks, &trends, &self.thresholds);

        FlowPerformanceAnalysis {
            flow_id: flow_id.to_string(),
            execution_count: n,
            average_duration_ms,
            median_duration_ms,
            p95_duration_ms,
            p99_duration_ms,
            bottlenecks,
            recommendations,
            trends,
        }
    }
}
