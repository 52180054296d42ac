//! Profiler notifications
//!
//! Events go out on a tokio broadcast channel. Publishing never blocks and
//! never fails the caller: with no subscribers the event is simply dropped,
//! and a slow subscriber lags instead of applying back-pressure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::trace::TraceId;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProfilerEvent {
    ProfilingStarted {
        trace_id: TraceId,
        flow_id: String,
        execution_id: String,
        timestamp: DateTime<Utc>,
    },
    StepProfiled {
        trace_id: TraceId,
        step_id: String,
        duration_ms: Option<f64>,
        memory_usage_mb: f64,
    },
    ProfilingCompleted {
        trace_id: TraceId,
        flow_id: String,
        total_duration_ms: f64,
        bottleneck_count: usize,
        memory_peak_mb: f64,
    },
    PerformanceRegression {
        flow_id: String,
        execution_id: String,
        current_duration_ms: f64,
        baseline_duration_ms: f64,
        regression_percent: f64,
        timestamp: DateTime<Utc>,
    },
    ProfilingAbandoned {
        trace_id: TraceId,
        flow_id: String,
        idle_secs: i64,
    },
}

impl ProfilerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProfilerEvent::ProfilingStarted { .. } => "profiling_started",
            ProfilerEvent::StepProfiled { .. } => "step_profiled",
            ProfilerEvent::ProfilingCompleted { .. } => "profiling_completed",
            ProfilerEvent::PerformanceRegression { .. } => "performance_regression",
            ProfilerEvent::ProfilingAbandoned { .. } => "profiling_abandoned",
        }
    }
}

/// Publish/subscribe channel for [`ProfilerEvent`]s.
///
/// Subscribers own their receiver; dropping it unsubscribes.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProfilerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProfilerEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of subscribers the event reached
    pub fn publish(&self, event: ProfilerEvent) -> usize {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(event = name, "No subscribers for profiler event");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
