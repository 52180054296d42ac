//! Flow execution profiler
//!
//! `FlowProfiler` owns the active traces, the bounded history and the flow
//! baselines. The recording calls (`start_profiling`, `profile_step`,
//! `complete_profiling`) never return errors: unknown trace ids are ignored
//! and sampler failures fall back to the last known reading.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::baseline::{BaselineManager, BaselineSample, PerformanceBaseline};
use crate::bottleneck::BottleneckDetector;
use crate::config::ProfilerConfig;
use crate::errors::ProfilerError;
use crate::events::{EventBus, ProfilerEvent};
use crate::history::{FlowPerformanceAnalysis, HistoricalAnalyzer, TraceHistory};
use crate::metrics::ProfilerMetrics;
use crate::recommendations::{self, OptimizationRecommendation};
use crate::regression::RegressionDetector;
use crate::sampler::ResourceSampler;
use crate::trace::{ExecutionTrace, StepDescriptor, StepTrace, TraceId, TraceStatus};

type ActiveTraces = FxHashMap<TraceId, Arc<Mutex<ExecutionTrace>>>;

const MAX_GRACE_SECS: u64 = (i64::MAX / 1000) as u64;

/// Snapshot of everything the profiler holds for offline analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceExport {
    pub traces: Vec<ExecutionTrace>,
    /// Sorted by flow id
    pub baselines: Vec<PerformanceBaseline>,
    pub exported_at: DateTime<Utc>,
    pub config: ProfilerConfig,
}

/// Last successful sampler readings, stored as f64 bits
#[derive(Debug, Default)]
struct LastReadings {
    memory_mb: AtomicU64,
    cpu: AtomicU64,
}

pub struct FlowProfiler {
    config: ProfilerConfig,
    sampler: Arc<dyn ResourceSampler>,
    detector: BottleneckDetector,
    regression_detector: RegressionDetector,
    analyzer: HistoricalAnalyzer,
    active: RwLock<ActiveTraces>,
    history: TraceHistory,
    baselines: BaselineManager,
    events: EventBus,
    last_readings: LastReadings,
    metrics: Option<Arc<ProfilerMetrics>>,
}

impl FlowProfiler {
    pub fn new(config: ProfilerConfig, sampler: Arc<dyn ResourceSampler>) -> Result<Self, ProfilerError> {
        config.validate()?;

        let thresholds = config.performance_thresholds.clone();
        info!(
            sampling_rate = config.sampling_rate,
            max_trace_history = config.max_trace_history,
            bottleneck_detection = config.enable_bottleneck_detection,
            regression_detection = config.enable_regression_detection,
            "🔬 Flow profiler initialized"
        );

        Ok(Self {
            detector: BottleneckDetector::new(&thresholds),
            regression_detector: RegressionDetector::new(),
            analyzer: HistoricalAnalyzer::new(thresholds),
            active: RwLock::new(FxHashMap::default()),
            history: TraceHistory::new(config.max_trace_history),
            baselines: BaselineManager::new(),
            events: EventBus::default(),
            last_readings: LastReadings::default(),
            metrics: None,
            sampler,
            config,
        })
    }

    /// Attach a Prometheus registry that mirrors trace lifecycle counters
    pub fn with_metrics(mut self, metrics: Arc<ProfilerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Option<&Arc<ProfilerMetrics>> {
        self.metrics.as_ref()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProfilerEvent> {
        self.events.subscribe()
    }

    // ---------------------------------------------------------------------
    // Recording
    // ---------------------------------------------------------------------

    pub fn start_profiling(&self, flow_id: &str, execution_id: &str, context: serde_json::Value) -> TraceId {
        self.start_profiling_at(flow_id, execution_id, context, Utc::now())
    }

    /// Open a trace for one execution.
    ///
    /// Returns the sentinel id when tracing is off or the execution falls
    /// outside the sampling rate.
    pub fn start_profiling_at(
        &self,
        flow_id: &str,
        execution_id: &str,
        context: serde_json::Value,
        start_time: DateTime<Utc>,
    ) -> TraceId {
        if !self.config.enable_tracing || !is_sampled(execution_id, self.config.sampling_rate) {
            debug!(flow_id, execution_id, "Execution not traced");
            return TraceId::sentinel();
        }

        let trace_id = TraceId::generate();
        let trace = ExecutionTrace::new(trace_id.clone(), flow_id, execution_id, context, start_time);

        self.active_write().insert(trace_id.clone(), Arc::new(Mutex::new(trace)));

        if let Some(metrics) = &self.metrics {
            metrics.record_trace_started(flow_id);
        }
        debug!(%trace_id, flow_id, execution_id, "Profiling started");

        self.events.publish(ProfilerEvent::ProfilingStarted {
            trace_id: trace_id.clone(),
            flow_id: flow_id.to_string(),
            execution_id: execution_id.to_string(),
            timestamp: start_time,
        });

        trace_id
    }

    /// Record or update one step of an active trace.
    ///
    /// Calling again for the same step id replaces the earlier record, so a
    /// step reported at start and again at end leaves a single entry.
    pub fn profile_step(
        &self,
        trace_id: &TraceId,
        step: &StepDescriptor,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    ) {
        if trace_id.is_sentinel() {
            return;
        }
        let Some(entry) = self.active_entry(trace_id) else {
            debug!(%trace_id, step_id = %step.id, "Step reported for unknown trace, ignoring");
            return;
        };

        let memory_usage_mb = self.memory_usage();
        let cpu_usage = self.cpu_usage();
        let step_trace = StepTrace::from_report(step, start_time, end_time, memory_usage_mb, cpu_usage);

        let findings = if self.config.enable_bottleneck_detection && step_trace.is_finished() {
            self.detector.detect_step(&step_trace)
        } else {
            Vec::new()
        };
        let duration_ms = step_trace.duration_ms;

        let flow_id = {
            let mut trace = entry.lock().unwrap_or_else(|e| e.into_inner());
            // a re-reported step replaces its earlier findings as well
            trace.bottlenecks.retain(|b| b.step_id != step.id);
            trace.bottlenecks.extend(findings.iter().cloned());
            trace.upsert_step(step_trace);
            trace.last_activity = Utc::now();
            trace.flow_id.clone()
        };

        if let Some(metrics) = &self.metrics {
            if let Some(duration_ms) = duration_ms {
                metrics.record_step_duration(&flow_id, duration_ms);
            }
            metrics.record_bottlenecks(&findings);
        }
        debug!(
            %trace_id,
            step_id = %step.id,
            duration_ms = ?duration_ms,
            memory_usage_mb,
            bottlenecks = findings.len(),
            "Step profiled"
        );

        self.events.publish(ProfilerEvent::StepProfiled {
            trace_id: trace_id.clone(),
            step_id: step.id.clone(),
            duration_ms,
            memory_usage_mb,
        });
    }

    pub fn complete_profiling(&self, trace_id: &TraceId) -> Option<ExecutionTrace> {
        self.complete_profiling_at(trace_id, Utc::now())
    }

    /// Close an active trace, fold it into the flow baseline and history,
    /// and check it for a regression. Returns `None` for unknown ids.
    pub fn complete_profiling_at(&self, trace_id: &TraceId, end_time: DateTime<Utc>) -> Option<ExecutionTrace> {
        if trace_id.is_sentinel() {
            return None;
        }
        // The active guard is held until the history push so the trace is
        // always visible in exactly one of the two
        let (trace, previous_baseline) = {
            let mut active = self.active_write();
            let entry = active.remove(trace_id)?;

            let trace = {
                let mut trace = entry.lock().unwrap_or_else(|e| e.into_inner());
                trace.finish(end_time);
                if self.config.enable_bottleneck_detection {
                    let findings = self.detector.detect_trace(&trace);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_bottlenecks(&findings);
                    }
                    trace.bottlenecks.extend(findings);
                }
                trace.clone()
            };

            // Failed executions stay in history but never move the baseline
            let previous_baseline = match BaselineSample::from_trace(&trace) {
                Some(sample) if !trace.has_failed_steps() => self.baselines.update(&trace.flow_id, sample).0,
                _ => {
                    debug!(%trace_id, flow_id = %trace.flow_id, "Trace has failed steps, baseline untouched");
                    None
                }
            };

            let evicted = self.history.push(trace.clone());
            if evicted > 0 {
                debug!(evicted, capacity = self.history.capacity(), "Evicted oldest traces from history");
            }
            drop(active);

            (trace, previous_baseline)
        };

        if self.config.enable_regression_detection {
            if let Some(baseline) = previous_baseline {
                if let Some(finding) = self.regression_detector.detect(&trace, &baseline) {
                    warn!(
                        flow_id = %finding.flow_id,
                        execution_id = %finding.execution_id,
                        current_duration_ms = finding.current_duration_ms,
                        baseline_duration_ms = finding.baseline_duration_ms,
                        regression_percent = finding.regression_percent(),
                        memory_regressed = finding.memory_regressed,
                        "⚠️ Performance regression detected"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_regression(&finding.flow_id);
                    }
                    self.events.publish(ProfilerEvent::PerformanceRegression {
                        flow_id: finding.flow_id.clone(),
                        execution_id: finding.execution_id.clone(),
                        current_duration_ms: finding.current_duration_ms,
                        baseline_duration_ms: finding.baseline_duration_ms,
                        regression_percent: finding.regression_percent(),
                        timestamp: end_time,
                    });
                }
            }
        }

        let total_duration_ms = trace.total_duration_ms.unwrap_or(0.0);
        if let Some(metrics) = &self.metrics {
            metrics.record_trace_completed(&trace.flow_id);
        }
        info!(
            %trace_id,
            flow_id = %trace.flow_id,
            total_duration_ms,
            steps = trace.steps.len(),
            bottlenecks = trace.bottlenecks.len(),
            "✅ Profiling completed"
        );

        self.events.publish(ProfilerEvent::ProfilingCompleted {
            trace_id: trace_id.clone(),
            flow_id: trace.flow_id.clone(),
            total_duration_ms,
            bottleneck_count: trace.bottlenecks.len(),
            memory_peak_mb: trace.memory_peak_mb,
        });

        Some(trace)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn active_trace_count(&self) -> usize {
        self.active_read().len()
    }

    /// Copy of an active trace
    pub fn active_trace(&self, trace_id: &TraceId) -> Option<ExecutionTrace> {
        self.active_entry(trace_id)
            .map(|entry| entry.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn baseline(&self, flow_id: &str) -> Option<PerformanceBaseline> {
        self.baselines.get(flow_id)
    }

    pub fn get_flow_analysis(&self, flow_id: &str) -> FlowPerformanceAnalysis {
        let traces = self.history.snapshot(Some(flow_id));
        self.analyzer.analyze(flow_id, &traces)
    }

    pub fn get_optimization_recommendations(&self, flow_id: &str) -> Vec<OptimizationRecommendation> {
        let analysis = self.get_flow_analysis(flow_id);
        let baseline = self.baselines.get(flow_id);
        recommendations::generate_optimization_recommendations(
            &analysis,
            baseline.as_ref(),
            &self.config.performance_thresholds,
        )
    }

    // ---------------------------------------------------------------------
    // Export and maintenance
    // ---------------------------------------------------------------------

    pub fn export_performance_data(&self, flow_id: Option<&str>) -> PerformanceExport {
        let traces = self.history.snapshot(flow_id);
        let mut baselines: Vec<PerformanceBaseline> = self
            .baselines
            .snapshot()
            .into_values()
            .filter(|b| flow_id.map(|f| b.flow_id == f).unwrap_or(true))
            .collect();
        baselines.sort_by(|a, b| a.flow_id.cmp(&b.flow_id));

        PerformanceExport {
            traces,
            baselines,
            exported_at: Utc::now(),
            config: self.config.clone(),
        }
    }

    pub fn export_json(&self, flow_id: Option<&str>) -> Result<String, ProfilerError> {
        Ok(serde_json::to_string_pretty(&self.export_performance_data(flow_id))?)
    }

    /// Drop history and baselines for one flow, or for every flow
    pub fn clear_history(&self, flow_id: Option<&str>) {
        let removed = self.history.clear(flow_id);
        match flow_id {
            Some(flow_id) => {
                self.baselines.remove(flow_id);
                info!(flow_id, removed, "🧹 Cleared flow history");
            }
            None => {
                self.baselines.clear();
                info!(removed, "🧹 Cleared all profiling history");
            }
        }
    }

    pub fn reap_stale_traces(&self) -> usize {
        self.reap_stale_traces_at(Utc::now())
    }

    /// Move traces idle longer than the grace period into history as
    /// abandoned. They keep no total duration, so they stay out of
    /// percentiles, baselines and regression checks.
    pub fn reap_stale_traces_at(&self, now: DateTime<Utc>) -> usize {
        // chrono durations are bounded by i64::MAX milliseconds
        let grace_secs = self.config.stale_trace_grace_period_secs.min(MAX_GRACE_SECS);
        let grace = chrono::Duration::seconds(grace_secs as i64);

        let reaped: Vec<(TraceId, ExecutionTrace)> = {
            let mut active = self.active_write();
            let ids: Vec<TraceId> = active
                .iter()
                .filter(|(_, entry)| {
                    let trace = entry.lock().unwrap_or_else(|e| e.into_inner());
                    now.signed_duration_since(trace.last_activity) > grace
                })
                .map(|(id, _)| id.clone())
                .collect();

            // pushed to history before the active guard drops
            ids.into_iter()
                .filter_map(|id| {
                    let entry = active.remove(&id)?;
                    let trace = {
                        let mut trace = entry.lock().unwrap_or_else(|e| e.into_inner());
                        trace.status = TraceStatus::Abandoned;
                        trace.clone()
                    };
                    self.history.push(trace.clone());
                    Some((id, trace))
                })
                .collect()
        };

        for (trace_id, trace) in &reaped {
            let idle_secs = now.signed_duration_since(trace.last_activity).num_seconds();

            warn!(%trace_id, flow_id = %trace.flow_id, idle_secs, "🗑️ Reaped abandoned trace");
            if let Some(metrics) = &self.metrics {
                metrics.record_trace_abandoned(&trace.flow_id);
            }

            self.events.publish(ProfilerEvent::ProfilingAbandoned {
                trace_id: trace_id.clone(),
                flow_id: trace.flow_id.clone(),
                idle_secs,
            });
        }

        reaped.len()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn active_read(&self) -> std::sync::RwLockReadGuard<'_, ActiveTraces> {
        self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    fn active_write(&self) -> std::sync::RwLockWriteGuard<'_, ActiveTraces> {
        self.active.write().unwrap_or_else(|e| e.into_inner())
    }

    fn active_entry(&self, trace_id: &TraceId) -> Option<Arc<Mutex<ExecutionTrace>>> {
        self.active_read().get(trace_id).cloned()
    }

    fn memory_usage(&self) -> f64 {
        match self.sampler.current_memory_usage() {
            Ok(value) => {
                self.last_readings.memory_mb.store(value.to_bits(), Ordering::Relaxed);
                value
            }
            Err(e) => {
                debug!("Memory sample failed, using last reading: {}", e);
                f64::from_bits(self.last_readings.memory_mb.load(Ordering::Relaxed))
            }
        }
    }

    fn cpu_usage(&self) -> f64 {
        match self.sampler.current_cpu_usage() {
            Ok(value) => {
                self.last_readings.cpu.store(value.to_bits(), Ordering::Relaxed);
                value
            }
            Err(e) => {
                debug!("CPU sample failed, using last reading: {}", e);
                f64::from_bits(self.last_readings.cpu.load(Ordering::Relaxed))
            }
        }
    }
}

/// Deterministic sampling decision for an execution id.
///
/// Hashes the id with SHA-256 and maps the first eight bytes onto `[0, 1]`,
/// so the same execution is always either traced or not at a given rate.
pub fn is_sampled(execution_id: &str, sampling_rate: f64) -> bool {
    if sampling_rate >= 1.0 {
        return true;
    }
    if sampling_rate <= 0.0 {
        return false;
    }

    let digest = Sha256::digest(execution_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let fraction = u64::from_be_bytes(prefix) as f64 / u64::MAX as f64;
    fraction < sampling_rate
}

/// Handle to the background reaper task
pub struct ReaperHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stop the reaper and wait for the task to finish its current pass
    pub async fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        self.task.abort();
        let _ = self.task.await;
        info!("🛑 Stale trace reaper stopped");
    }
}

/// Run `reap_stale_traces` on a fixed interval until the handle is stopped
pub fn spawn_reaper(profiler: Arc<FlowProfiler>, period: Duration) -> ReaperHandle {
    let running = Arc::new(AtomicBool::new(true));
    let running_flag = running.clone();

    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        // first tick completes immediately
        ticker.tick().await;

        while running_flag.load(Ordering::Relaxed) {
            ticker.tick().await;
            let reaped = profiler.reap_stale_traces();
            if reaped > 0 {
                info!(reaped, active = profiler.active_trace_count(), "Stale trace sweep finished");
            }
        }
    });

    info!("⏰ Stale trace reaper started (every {:?})", period);
    ReaperHandle { running, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottleneck::{BottleneckSeverity, BottleneckType};
    use crate::errors::SamplerError;
    use crate::sampler::MockResourceSampler;
    use crate::trace::StepStatus;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn fixed_sampler(memory_mb: f64, cpu: f64) -> Arc<dyn ResourceSampler> {
        let mut sampler = MockResourceSampler::new();
        sampler.expect_current_memory_usage().returning(move || Ok(memory_mb));
        sampler.expect_current_cpu_usage().returning(move || Ok(cpu));
        Arc::new(sampler)
    }

    fn profiler_with(config: ProfilerConfig) -> FlowProfiler {
        FlowProfiler::new(config, fixed_sampler(64.0, 10.0)).unwrap()
    }

    fn profiler() -> FlowProfiler {
        profiler_with(ProfilerConfig::default())
    }

    /// Run one execution with a single step of `duration_ms`
    fn run_execution(profiler: &FlowProfiler, flow: &str, exec: &str, duration_ms: i64) -> Option<ExecutionTrace> {
        let start = Utc::now();
        let end = start + ChronoDuration::milliseconds(duration_ms);
        let id = profiler.start_profiling_at(flow, exec, json!({}), start);
        profiler.profile_step(&id, &StepDescriptor::new("only"), start, Some(end));
        profiler.complete_profiling_at(&id, end)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ProfilerConfig { sampling_rate: 1.5, ..Default::default() };
        assert!(matches!(
            FlowProfiler::new(config, fixed_sampler(0.0, 0.0)),
            Err(ProfilerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_disabled_tracing_returns_sentinel() {
        let profiler = profiler_with(ProfilerConfig { enable_tracing: false, ..Default::default() });
        let id = profiler.start_profiling("flow", "exec", json!(null));

        assert!(id.is_sentinel());
        assert_eq!(profiler.active_trace_count(), 0);

        // sentinel ids are accepted everywhere and ignored
        profiler.profile_step(&id, &StepDescriptor::new("a"), Utc::now(), None);
        assert!(profiler.complete_profiling(&id).is_none());
        assert_eq!(profiler.history_len(), 0);
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let sampled: Vec<bool> = (0..200).map(|i| is_sampled(&format!("exec-{i}"), 0.5)).collect();
        let again: Vec<bool> = (0..200).map(|i| is_sampled(&format!("exec-{i}"), 0.5)).collect();
        assert_eq!(sampled, again);

        let hits = sampled.iter().filter(|s| **s).count();
        assert!(hits > 50 && hits < 150, "expected roughly half sampled, got {hits}");

        assert!(is_sampled("anything", 1.0));
        assert!(!is_sampled("anything", 0.0));
    }

    #[test]
    fn test_sampled_out_execution_returns_sentinel() {
        let profiler = profiler_with(ProfilerConfig { sampling_rate: 0.0, ..Default::default() });
        assert!(profiler.start_profiling("flow", "exec", json!({})).is_sentinel());
    }

    #[test]
    fn test_unknown_trace_is_ignored() {
        let profiler = profiler();
        let unknown = TraceId::from("not-a-trace");

        profiler.profile_step(&unknown, &StepDescriptor::new("a"), Utc::now(), None);
        assert!(profiler.complete_profiling(&unknown).is_none());
        assert_eq!(profiler.active_trace_count(), 0);
    }

    #[test]
    fn test_step_upsert_is_idempotent() {
        let profiler = profiler();
        let start = Utc::now();
        let id = profiler.start_profiling_at("flow", "exec", json!({"user": 7}), start);

        let step = StepDescriptor::new("fetch");
        profiler.profile_step(&id, &step, start, None);
        profiler.profile_step(&id, &step, start, Some(start + ChronoDuration::milliseconds(40)));

        let trace = profiler.active_trace(&id).unwrap();
        assert_eq!(trace.steps.len(), 1);
        assert_eq!(trace.steps[0].status, StepStatus::Completed);
        assert_eq!(trace.steps[0].duration_ms, Some(40.0));
        assert_eq!(trace.memory_peak_mb, 64.0);
        assert_eq!(trace.context, json!({"user": 7}));
    }

    #[test]
    fn test_sampler_failure_uses_last_reading() {
        let mut sampler = MockResourceSampler::new();
        let mut memory_calls = 0;
        sampler.expect_current_memory_usage().returning(move || {
            memory_calls += 1;
            if memory_calls == 1 {
                Ok(128.0)
            } else {
                Err(SamplerError::Unavailable("gone".to_string()))
            }
        });
        sampler
            .expect_current_cpu_usage()
            .returning(|| Err(SamplerError::ProcessNotFound(1)));

        let profiler = FlowProfiler::new(ProfilerConfig::default(), Arc::new(sampler)).unwrap();
        let start = Utc::now();
        let id = profiler.start_profiling_at("flow", "exec", json!({}), start);
        profiler.profile_step(&id, &StepDescriptor::new("a"), start, None);
        profiler.profile_step(&id, &StepDescriptor::new("b"), start, None);

        let trace = profiler.active_trace(&id).unwrap();
        assert_eq!(trace.step("a").unwrap().memory_usage_mb, 128.0);
        assert_eq!(trace.step("b").unwrap().memory_usage_mb, 128.0);
        // cpu never succeeded, so the initial zero is used
        assert_eq!(trace.cpu_usage, 0.0);
    }

    #[test]
    fn test_dominant_step_scenario() {
        let profiler = profiler();
        let start = Utc::now();
        let id = profiler.start_profiling_at("flow", "exec", json!({}), start);

        let mut cursor = start;
        for (step_id, ms) in [("s1", 10), ("s2", 500), ("s3", 10)] {
            let end = cursor + ChronoDuration::milliseconds(ms);
            profiler.profile_step(&id, &StepDescriptor::new(step_id), cursor, Some(end));
            cursor = end;
        }

        let trace = profiler.complete_profiling_at(&id, cursor).unwrap();
        assert_eq!(trace.total_duration_ms, Some(520.0));

        let dominant: Vec<_> = trace
            .bottlenecks
            .iter()
            .filter(|b| b.bottleneck_type == BottleneckType::Cpu && b.step_id == "s2")
            .collect();
        assert_eq!(dominant.len(), 1);
        assert_eq!(dominant[0].severity, BottleneckSeverity::High);
        assert!((dominant[0].impact - 500.0 / 520.0).abs() < 1e-9);
    }

    #[test]
    fn test_bottleneck_detection_can_be_disabled() {
        let profiler = profiler_with(ProfilerConfig { enable_bottleneck_detection: false, ..Default::default() });
        let trace = run_execution(&profiler, "flow", "exec", 100).unwrap();
        assert!(trace.bottlenecks.is_empty());
    }

    #[test]
    fn test_completion_moves_trace_into_history() {
        let profiler = profiler();
        let trace = run_execution(&profiler, "flow", "exec", 100).unwrap();

        assert_eq!(trace.status, TraceStatus::Completed);
        assert_eq!(profiler.active_trace_count(), 0);
        assert_eq!(profiler.history_len(), 1);
        assert!(profiler.complete_profiling(&trace.trace_id).is_none());
        assert_eq!(profiler.baseline("flow").unwrap().sample_count, 1);
    }

    #[test]
    fn test_trace_stays_visible_across_completion() {
        let profiler = profiler();
        let start = Utc::now();
        let ids: Vec<_> = (0..3)
            .map(|i| profiler.start_profiling_at("flow", &format!("exec-{i}"), json!({}), start))
            .collect();

        for (done, id) in ids.iter().enumerate() {
            assert_eq!(profiler.active_trace_count() + profiler.history_len(), 3);
            profiler.complete_profiling_at(id, start + ChronoDuration::milliseconds(10)).unwrap();
            assert_eq!(profiler.history_len(), done + 1);
            assert_eq!(profiler.active_trace_count() + profiler.history_len(), 3);
        }
    }

    #[test]
    fn test_concurrent_observer_never_loses_a_trace() {
        const WORKERS: usize = 4;
        const PER_WORKER: usize = 50;
        const TOTAL: usize = WORKERS * PER_WORKER;

        let profiler = Arc::new(profiler_with(ProfilerConfig { max_trace_history: TOTAL * 2, ..Default::default() }));
        let start = Utc::now();
        let ids: Vec<TraceId> = (0..TOTAL)
            .map(|i| profiler.start_profiling_at("flow", &format!("exec-{i}"), json!({}), start))
            .collect();

        let finished = Arc::new(AtomicBool::new(false));
        let observer = {
            let profiler = profiler.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                let mut observations = 0usize;
                loop {
                    let done = finished.load(Ordering::Acquire);
                    // active first: a trace can only move from active to history,
                    // so reading in this order can never undercount
                    let active = profiler.active_trace_count();
                    let history = profiler.history_len();
                    assert!(active + history >= TOTAL, "trace missing: {active} active + {history} history");
                    observations += 1;
                    if done {
                        break observations;
                    }
                }
            })
        };

        let workers: Vec<_> = ids
            .chunks(PER_WORKER)
            .map(|chunk| {
                let profiler = profiler.clone();
                let chunk = chunk.to_vec();
                std::thread::spawn(move || {
                    for id in chunk {
                        let end = start + ChronoDuration::milliseconds(25);
                        profiler.profile_step(&id, &StepDescriptor::new("only"), start, Some(end));
                        assert!(profiler.complete_profiling_at(&id, end).is_some());
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        finished.store(true, Ordering::Release);
        assert!(observer.join().unwrap() > 0);

        assert_eq!(profiler.active_trace_count(), 0);
        assert_eq!(profiler.history_len(), TOTAL);
    }

    #[test]
    fn test_history_is_bounded() {
        let profiler = profiler_with(ProfilerConfig { max_trace_history: 5, ..Default::default() });
        for i in 0..12 {
            run_execution(&profiler, "flow", &format!("exec-{i}"), 10 + i);
        }
        assert_eq!(profiler.history_len(), 5);

        let exported = profiler.export_performance_data(None);
        assert_eq!(exported.traces.first().unwrap().execution_id, "exec-7");
    }

    #[test]
    fn test_failed_trace_skips_baseline() {
        let profiler = profiler();
        run_execution(&profiler, "flow", "ok", 100);

        let start = Utc::now();
        let end = start + ChronoDuration::milliseconds(5_000);
        let id = profiler.start_profiling_at("flow", "bad", json!({}), start);
        profiler.profile_step(&id, &StepDescriptor::new("only").failed("boom"), start, Some(end));
        let failed = profiler.complete_profiling_at(&id, end).unwrap();

        assert!(failed.has_failed_steps());
        assert_eq!(profiler.baseline("flow").unwrap().sample_count, 1);
        assert_eq!(profiler.baseline("flow").unwrap().average_duration_ms, 100.0);
        // still part of the latency picture
        assert_eq!(profiler.get_flow_analysis("flow").execution_count, 2);
    }

    #[tokio::test]
    async fn test_regression_event_against_previous_baseline() {
        let profiler = profiler();
        let mut events = profiler.subscribe();

        for i in 0..5 {
            run_execution(&profiler, "flow", &format!("warmup-{i}"), 100);
        }
        run_execution(&profiler, "flow", "slow", 116);

        let mut regression = None;
        while let Ok(event) = events.try_recv() {
            if let ProfilerEvent::PerformanceRegression { .. } = event {
                regression = Some(event);
            }
        }

        match regression {
            Some(ProfilerEvent::PerformanceRegression {
                execution_id,
                regression_percent,
                baseline_duration_ms,
                ..
            }) => {
                assert_eq!(execution_id, "slow");
                assert_eq!(baseline_duration_ms, 100.0);
                assert!((regression_percent - 16.0).abs() < 1e-9);
            }
            other => panic!("expected a regression event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_regression_below_threshold_or_when_disabled() {
        let profiler = profiler();
        for i in 0..5 {
            run_execution(&profiler, "flow", &format!("warmup-{i}"), 100);
        }
        let mut events = profiler.subscribe();
        run_execution(&profiler, "flow", "ok", 114);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ProfilerEvent::PerformanceRegression { .. }));
        }

        let quiet = profiler_with(ProfilerConfig { enable_regression_detection: false, ..Default::default() });
        for i in 0..5 {
            run_execution(&quiet, "flow", &format!("warmup-{i}"), 100);
        }
        let mut events = quiet.subscribe();
        run_execution(&quiet, "flow", "slow", 500);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, ProfilerEvent::PerformanceRegression { .. }));
        }
    }

    #[test]
    fn test_clear_history_per_flow() {
        let profiler = profiler();
        run_execution(&profiler, "a", "1", 10);
        run_execution(&profiler, "b", "2", 10);

        profiler.clear_history(Some("a"));
        assert_eq!(profiler.history_len(), 1);
        assert!(profiler.baseline("a").is_none());
        assert!(profiler.baseline("b").is_some());

        profiler.clear_history(None);
        assert_eq!(profiler.history_len(), 0);
        assert!(profiler.baseline("b").is_none());
    }

    #[test]
    fn test_export_filters_by_flow() {
        let profiler = profiler();
        run_execution(&profiler, "a", "1", 10);
        run_execution(&profiler, "b", "2", 10);

        let export = profiler.export_performance_data(Some("b"));
        assert_eq!(export.traces.len(), 1);
        assert_eq!(export.baselines.len(), 1);
        assert_eq!(export.baselines[0].flow_id, "b");

        let json = profiler.export_json(None).unwrap();
        let parsed: PerformanceExport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.traces.len(), 2);
        assert_eq!(parsed.config, ProfilerConfig::default());
    }

    #[test]
    fn test_reaper_moves_idle_traces_to_history() {
        let profiler = profiler_with(ProfilerConfig { stale_trace_grace_period_secs: 60, ..Default::default() });
        let mut events = profiler.subscribe();
        let stale = profiler.start_profiling("flow", "stale", json!({}));

        assert_eq!(profiler.reap_stale_traces_at(Utc::now()), 0);
        assert_eq!(profiler.active_trace_count() + profiler.history_len(), 1);
        assert_eq!(profiler.reap_stale_traces_at(Utc::now() + ChronoDuration::seconds(120)), 1);
        assert_eq!(profiler.active_trace_count() + profiler.history_len(), 1);

        assert_eq!(profiler.active_trace_count(), 0);
        let exported = profiler.export_performance_data(Some("flow"));
        assert_eq!(exported.traces[0].trace_id, stale);
        assert_eq!(exported.traces[0].status, TraceStatus::Abandoned);
        assert!(exported.traces[0].total_duration_ms.is_none());
        assert!(profiler.baseline("flow").is_none());
        assert_eq!(profiler.get_flow_analysis("flow").execution_count, 0);

        let names: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.name()).collect();
        assert_eq!(names, vec!["profiling_started", "profiling_abandoned"]);
    }

    #[test]
    fn test_metrics_follow_lifecycle() {
        let metrics = Arc::new(ProfilerMetrics::new().unwrap());
        let profiler = profiler().with_metrics(metrics.clone());

        run_execution(&profiler, "flow", "1", 10);
        profiler.start_profiling("flow", "2", json!({}));

        assert_eq!(metrics.traces_started_total.with_label_values(&["flow"]).get(), 2);
        assert_eq!(metrics.traces_completed_total.with_label_values(&["flow"]).get(), 1);
        assert_eq!(metrics.active_traces.get(), 1);
    }

    #[tokio::test]
    async fn test_spawned_reaper_stops() {
        let profiler = Arc::new(profiler());
        let handle = spawn_reaper(profiler.clone(), Duration::from_millis(10));
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.stop().await;
    }
}
