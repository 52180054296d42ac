//! Execution trace data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bottleneck::Bottleneck;

/// Identifier handed back by `start_profiling`. An empty id is the sentinel
/// returned for executions that are not traced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn sentinel() -> Self {
        Self(String::new())
    }

    pub fn is_sentinel(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TraceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Active,
    Completed,
    /// Reaped after sitting idle past the grace period
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// Step description reported by the execution engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub id: String,
    pub validation_time_ms: Option<f64>,
    pub resource_wait_time_ms: Option<f64>,
    /// Derived from the other timings when not reported
    pub execution_time_ms: Option<f64>,
    /// Set when the engine reports the step as failed
    pub failed_with: Option<String>,
}

impl StepDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_validation_time(mut self, ms: f64) -> Self {
        self.validation_time_ms = Some(ms);
        self
    }

    pub fn with_resource_wait_time(mut self, ms: f64) -> Self {
        self.resource_wait_time_ms = Some(ms);
        self
    }

    pub fn with_execution_time(mut self, ms: f64) -> Self {
        self.execution_time_ms = Some(ms);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.failed_with = Some(error.into());
        self
    }
}

/// Per-step record within a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub memory_usage_mb: f64,
    pub cpu_usage: f64,
    pub resource_wait_time_ms: f64,
    pub validation_time_ms: f64,
    pub execution_time_ms: f64,
    pub status: StepStatus,
    pub error: Option<String>,
}

impl StepTrace {
    /// Build a step record from the engine's report and the sampled resources
    pub fn from_report(
        step: &StepDescriptor,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        memory_usage_mb: f64,
        cpu_usage: f64,
    ) -> Self {
        let duration_ms = end_time.map(|end| duration_ms_between(start_time, end));
        let validation_time_ms = step.validation_time_ms.unwrap_or(0.0);
        let resource_wait_time_ms = step.resource_wait_time_ms.unwrap_or(0.0);
        let execution_time_ms = step.execution_time_ms.unwrap_or_else(|| {
            duration_ms
                .map(|d| (d - validation_time_ms - resource_wait_time_ms).max(0.0))
                .unwrap_or(0.0)
        });

        let status = match (end_time, &step.failed_with) {
            (None, _) => StepStatus::Running,
            (Some(_), Some(_)) => StepStatus::Failed,
            (Some(_), None) => StepStatus::Completed,
        };

        Self {
            step_id: step.id.clone(),
            start_time,
            end_time,
            duration_ms,
            memory_usage_mb,
            cpu_usage,
            resource_wait_time_ms,
            validation_time_ms,
            execution_time_ms,
            status,
            error: step.failed_with.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.status != StepStatus::Running
    }
}

/// Profiler record of one flow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: TraceId,
    pub flow_id: String,
    pub execution_id: String,
    /// Caller-supplied correlation data, never interpreted
    pub context: serde_json::Value,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<f64>,
    pub steps: Vec<StepTrace>,
    pub memory_peak_mb: f64,
    /// Last observed CPU sample
    pub cpu_usage: f64,
    pub bottlenecks: Vec<Bottleneck>,
    pub status: TraceStatus,
    pub last_activity: DateTime<Utc>,
}

impl ExecutionTrace {
    pub fn new(
        trace_id: TraceId,
        flow_id: impl Into<String>,
        execution_id: impl Into<String>,
        context: serde_json::Value,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            trace_id,
            flow_id: flow_id.into(),
            execution_id: execution_id.into(),
            context,
            start_time,
            end_time: None,
            total_duration_ms: None,
            steps: Vec::new(),
            memory_peak_mb: 0.0,
            cpu_usage: 0.0,
            bottlenecks: Vec::new(),
            status: TraceStatus::Active,
            last_activity: Utc::now(),
        }
    }

    /// Insert or replace the record for `step.step_id`, keeping its position
    pub fn upsert_step(&mut self, step: StepTrace) {
        self.memory_peak_mb = self.memory_peak_mb.max(step.memory_usage_mb);
        self.cpu_usage = step.cpu_usage;

        match self.steps.iter_mut().find(|s| s.step_id == step.step_id) {
            Some(existing) => *existing = step,
            None => self.steps.push(step),
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepTrace> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Close the trace at `end_time`
    pub fn finish(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.total_duration_ms = Some(duration_ms_between(self.start_time, end_time));
        self.status = TraceStatus::Completed;
    }

    pub fn has_failed_steps(&self) -> bool {
        self.steps.iter().any(|s| s.status == StepStatus::Failed)
    }
}

/// Milliseconds from `start` to `end`, floored at zero
pub fn duration_ms_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let micros = (end - start).num_microseconds().unwrap_or(i64::MAX);
    (micros as f64 / 1000.0).max(0.0)
}
