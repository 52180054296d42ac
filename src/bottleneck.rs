//! Bottleneck classification
//!
//! Per-step rules run when a step finishes; the trace-level rule runs once at
//! completion. A step that dominates the trace is reported again by the
//! trace-level rule even when a per-step rule already fired for it; the
//! duplicates collapse only in [`aggregate`].

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PerformanceThresholds;
use crate::trace::{ExecutionTrace, StepTrace};

const CPU_THRESHOLD: f64 = 90.0;
const CPU_CRITICAL: f64 = 95.0;
const MEMORY_RATIO: f64 = 0.8;
const VALIDATION_RATIO: f64 = 0.3;
const VALIDATION_HIGH_RATIO: f64 = 0.5;
const RESOURCE_WAIT_RATIO: f64 = 0.2;
const RESOURCE_WAIT_HIGH_RATIO: f64 = 0.4;
const DOMINANT_STEP_RATIO: f64 = 0.5;

/// Aggregated bottleneck lists keep at most this many entries
pub const TOP_BOTTLENECKS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BottleneckType {
    Cpu,
    Memory,
    Io,
    Validation,
    ResourceWait,
}

impl fmt::Display for BottleneckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BottleneckType::Cpu => "cpu",
            BottleneckType::Memory => "memory",
            BottleneckType::Io => "io",
            BottleneckType::Validation => "validation",
            BottleneckType::ResourceWait => "resource-wait",
        };
        f.write_str(name)
    }
}

/// Ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl BottleneckSeverity {
    pub fn is_actionable(&self) -> bool {
        *self >= BottleneckSeverity::High
    }
}

impl fmt::Display for BottleneckSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BottleneckSeverity::Low => "low",
            BottleneckSeverity::Medium => "medium",
            BottleneckSeverity::High => "high",
            BottleneckSeverity::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub bottleneck_type: BottleneckType,
    pub step_id: String,
    pub severity: BottleneckSeverity,
    /// Share of the relevant budget consumed, within [0, 1]
    pub impact: f64,
    pub description: String,
    pub recommendation: String,
}

impl Bottleneck {
    fn new(
        bottleneck_type: BottleneckType,
        step_id: &str,
        severity: BottleneckSeverity,
        impact: f64,
        description: String,
        recommendation: String,
    ) -> Self {
        Self {
            bottleneck_type,
            step_id: step_id.to_string(),
            severity,
            impact: impact.clamp(0.0, 1.0),
            description,
            recommendation,
        }
    }
}

/// Threshold and ratio rules over step and trace records
#[derive(Debug, Clone)]
pub struct BottleneckDetector {
    max_memory_usage_mb: f64,
}

impl BottleneckDetector {
    pub fn new(thresholds: &PerformanceThresholds) -> Self {
        Self {
            max_memory_usage_mb: thresholds.max_memory_usage_mb,
        }
    }

    /// Evaluate every per-step rule; each yields at most one finding
    pub fn detect_step(&self, step: &StepTrace) -> Vec<Bottleneck> {
        [
            self.check_cpu(step),
            self.check_memory(step),
            self.check_validation(step),
            self.check_resource_wait(step),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    fn check_cpu(&self, step: &StepTrace) -> Option<Bottleneck> {
        if step.cpu_usage <= CPU_THRESHOLD {
            return None;
        }
        let severity = if step.cpu_usage > CPU_CRITICAL {
            BottleneckSeverity::Critical
        } else {
            BottleneckSeverity::High
        };
        Some(Bottleneck::new(
            BottleneckType::Cpu,
            &step.step_id,
            severity,
            step.cpu_usage / 100.0,
            format!("High CPU usage: {:.1}%", step.cpu_usage),
            "Optimize CPU-intensive operations or distribute the work across parallel steps".to_string(),
        ))
    }

    fn check_memory(&self, step: &StepTrace) -> Option<Bottleneck> {
        let max = self.max_memory_usage_mb;
        if max <= 0.0 || step.memory_usage_mb <= max * MEMORY_RATIO {
            return None;
        }
        let severity = if step.memory_usage_mb > max {
            BottleneckSeverity::Critical
        } else {
            BottleneckSeverity::High
        };
        Some(Bottleneck::new(
            BottleneckType::Memory,
            &step.step_id,
            severity,
            step.memory_usage_mb / max,
            format!("High memory usage: {:.1}MB of {:.1}MB", step.memory_usage_mb, max),
            "Reduce memory footprint by streaming large payloads or releasing intermediate data earlier".to_string(),
        ))
    }

    fn check_validation(&self, step: &StepTrace) -> Option<Bottleneck> {
        let duration = positive_duration(step)?;
        if step.validation_time_ms <= duration * VALIDATION_RATIO {
            return None;
        }
        let severity = if step.validation_time_ms > duration * VALIDATION_HIGH_RATIO {
            BottleneckSeverity::High
        } else {
            BottleneckSeverity::Medium
        };
        let ratio = step.validation_time_ms / duration;
        Some(Bottleneck::new(
            BottleneckType::Validation,
            &step.step_id,
            severity,
            ratio,
            format!("Validation takes {:.1}% of step time", ratio * 100.0),
            "Cache validation results or simplify validation rules".to_string(),
        ))
    }

    fn check_resource_wait(&self, step: &StepTrace) -> Option<Bottleneck> {
        let duration = positive_duration(step)?;
        if step.resource_wait_time_ms <= duration * RESOURCE_WAIT_RATIO {
            return None;
        }
        let severity = if step.resource_wait_time_ms > duration * RESOURCE_WAIT_HIGH_RATIO {
            BottleneckSeverity::High
        } else {
            BottleneckSeverity::Medium
        };
        let ratio = step.resource_wait_time_ms / duration;
        Some(Bottleneck::new(
            BottleneckType::ResourceWait,
            &step.step_id,
            severity,
            ratio,
            format!("Resource wait takes {:.1}% of step time", ratio * 100.0),
            "Increase resource pool capacity or reorder steps to reduce contention".to_string(),
        ))
    }

    /// Flag every step that accounts for more than half of the trace duration
    pub fn detect_trace(&self, trace: &ExecutionTrace) -> Vec<Bottleneck> {
        let total = match trace.total_duration_ms {
            Some(total) if total > 0.0 => total,
            _ => return Vec::new(),
        };

        trace
            .steps
            .iter()
            .filter_map(|step| {
                let duration = step.duration_ms?;
                let share = duration / total;
                if share <= DOMINANT_STEP_RATIO {
                    return None;
                }
                let percentage = share * 100.0;
                Some(Bottleneck::new(
                    BottleneckType::Cpu,
                    &step.step_id,
                    BottleneckSeverity::High,
                    percentage / 100.0,
                    format!("Step {} accounts for {:.1}% of total execution time", step.step_id, percentage),
                    format!("Split or parallelize step {} to shorten the critical path", step.step_id),
                ))
            })
            .collect()
    }
}

fn positive_duration(step: &StepTrace) -> Option<f64> {
    step.duration_ms.filter(|d| *d > 0.0)
}

/// Merge findings from many traces.
///
/// Groups by `(type, step_id)`, keeps the highest impact and the worst
/// severity seen, sorts by impact descending and keeps the top entries.
pub fn aggregate<'a, I>(bottlenecks: I) -> Vec<Bottleneck>
where
    I: IntoIterator<Item = &'a Bottleneck>,
{
    let mut grouped: FxHashMap<(BottleneckType, &str), Bottleneck> = FxHashMap::default();

    for bottleneck in bottlenecks {
        grouped
            .entry((bottleneck.bottleneck_type, bottleneck.step_id.as_str()))
            .and_modify(|existing| {
                if bottleneck.impact > existing.impact {
                    existing.impact = bottleneck.impact;
                    existing.description = bottleneck.description.clone();
                }
                existing.severity = existing.severity.max(bottleneck.severity);
            })
            .or_insert_with(|| bottleneck.clone());
    }

    let mut merged: Vec<Bottleneck> = grouped.into_values().collect();
    merged.sort_by(|a, b| {
        b.impact
            .partial_cmp(&a.impact)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.step_id.cmp(&b.step_id))
    });
    merged.truncate(TOP_BOTTLENECKS);
    merged
}
