use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use flow_profiler::{
    ExecutionTrace, FlowProfiler, ProfilerConfig, ResourceSampler, SamplerError, StepDescriptor,
};

/// Sampler that replays scripted memory readings, then repeats the last one
pub struct ScriptedSampler {
    memory_mb: Mutex<VecDeque<f64>>,
    last_memory_mb: Mutex<f64>,
    cpu: f64,
}

impl ScriptedSampler {
    pub fn new(memory_mb: &[f64], cpu: f64) -> Self {
        Self {
            memory_mb: Mutex::new(memory_mb.iter().copied().collect()),
            last_memory_mb: Mutex::new(memory_mb.first().copied().unwrap_or(0.0)),
            cpu,
        }
    }

    pub fn constant(memory_mb: f64, cpu: f64) -> Self {
        Self::new(&[memory_mb], cpu)
    }
}

impl ResourceSampler for ScriptedSampler {
    fn current_memory_usage(&self) -> Result<f64, SamplerError> {
        let mut last = self.last_memory_mb.lock().unwrap();
        if let Some(next) = self.memory_mb.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(*last)
    }

    fn current_cpu_usage(&self) -> Result<f64, SamplerError> {
        Ok(self.cpu)
    }
}

/// Sampler whose readings never succeed
pub struct BrokenSampler;

impl ResourceSampler for BrokenSampler {
    fn current_memory_usage(&self) -> Result<f64, SamplerError> {
        Err(SamplerError::Unavailable("sensor offline".to_string()))
    }

    fn current_cpu_usage(&self) -> Result<f64, SamplerError> {
        Err(SamplerError::Unavailable("sensor offline".to_string()))
    }
}

pub fn create_test_profiler(config: ProfilerConfig, sampler: impl ResourceSampler + 'static) -> Arc<FlowProfiler> {
    Arc::new(FlowProfiler::new(config, Arc::new(sampler)).expect("valid test configuration"))
}

pub fn create_default_profiler() -> Arc<FlowProfiler> {
    create_test_profiler(ProfilerConfig::default(), ScriptedSampler::constant(50.0, 20.0))
}

/// Run a whole execution whose steps follow each other back to back.
/// Returns the completed trace.
pub fn run_sequential_flow(
    profiler: &FlowProfiler,
    flow_id: &str,
    execution_id: &str,
    steps: &[(StepDescriptor, i64)],
) -> ExecutionTrace {
    let start = Utc::now();
    let id = profiler.start_profiling_at(flow_id, execution_id, serde_json::json!({ "source": "test" }), start);

    let mut cursor: DateTime<Utc> = start;
    for (step, duration_ms) in steps {
        let end = cursor + Duration::milliseconds(*duration_ms);
        profiler.profile_step(&id, step, cursor, None);
        profiler.profile_step(&id, step, cursor, Some(end));
        cursor = end;
    }

    profiler
        .complete_profiling_at(&id, cursor)
        .expect("trace should still be active")
}

pub fn single_step(duration_ms: i64) -> Vec<(StepDescriptor, i64)> {
    vec![(StepDescriptor::new("work"), duration_ms)]
}
