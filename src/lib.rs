//! Performance profiler for flow executions.
//!
//! An execution engine opens a trace per flow execution, reports each step as
//! it runs and closes the trace when the flow finishes. The profiler detects
//! bottlenecks, keeps an exponential-moving-average baseline per flow, flags
//! regressions against it and answers analytical queries over a bounded
//! history of finished traces.

pub mod baseline;
pub mod bottleneck;
pub mod config;
pub mod errors;
pub mod events;
pub mod history;
pub mod logging;
pub mod metrics;
pub mod profiler;
pub mod recommendations;
pub mod regression;
pub mod sampler;
pub mod server;
pub mod trace;

pub use baseline::{BaselineManager, PerformanceBaseline};
pub use bottleneck::{Bottleneck, BottleneckDetector, BottleneckSeverity, BottleneckType};
pub use config::{PerformanceThresholds, ProfilerConfig, ProfilerSettings};
pub use errors::{ProfilerError, SamplerError};
pub use events::{EventBus, ProfilerEvent};
pub use history::{FlowPerformanceAnalysis, PerformanceTrend, TrendDirection, TrendMetric};
pub use profiler::{spawn_reaper, FlowProfiler, PerformanceExport, ReaperHandle};
pub use recommendations::{OptimizationRecommendation, Priority, RecommendationType};
pub use regression::RegressionFinding;
pub use sampler::{BackgroundSampler, ResourceSampler, SystemSampler};
pub use trace::{ExecutionTrace, StepDescriptor, StepStatus, StepTrace, TraceId, TraceStatus};
