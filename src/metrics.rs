/// Prometheus metrics for the profiler itself
///
/// Counts trace lifecycle transitions, bottleneck findings and regressions so
/// the profiler's own activity can be scraped alongside the flows it watches.
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::info;

use crate::bottleneck::Bottleneck;

pub struct ProfilerMetrics {
    registry: Registry,

    // Trace lifecycle
    pub traces_started_total: IntCounterVec,
    pub traces_completed_total: IntCounterVec,
    pub traces_abandoned_total: IntCounterVec,
    pub active_traces: IntGauge,

    // Step timing
    pub step_duration_seconds: HistogramVec,

    // Findings
    pub bottlenecks_total: IntCounterVec,
    pub regressions_total: IntCounterVec,
}

impl ProfilerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let traces_started_total = IntCounterVec::new(
            Opts::new("profiler_traces_started_total", "Total number of traces opened"),
            &["flow_id"],
        )?;

        let traces_completed_total = IntCounterVec::new(
            Opts::new("profiler_traces_completed_total", "Total number of traces completed"),
            &["flow_id"],
        )?;

        let traces_abandoned_total = IntCounterVec::new(
            Opts::new("profiler_traces_abandoned_total", "Total number of stale traces reaped"),
            &["flow_id"],
        )?;

        let active_traces = IntGauge::new("profiler_active_traces", "Number of traces currently open")?;

        let step_duration_seconds = HistogramVec::new(
            HistogramOpts::new("profiler_step_duration_seconds", "Duration of profiled steps")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["flow_id"],
        )?;

        let bottlenecks_total = IntCounterVec::new(
            Opts::new("profiler_bottlenecks_total", "Total bottlenecks detected"),
            &["type", "severity"],
        )?;

        let regressions_total = IntCounterVec::new(
            Opts::new("profiler_regressions_total", "Total performance regressions detected"),
            &["flow_id"],
        )?;

        registry.register(Box::new(traces_started_total.clone()))?;
        registry.register(Box::new(traces_completed_total.clone()))?;
        registry.register(Box::new(traces_abandoned_total.clone()))?;
        registry.register(Box::new(active_traces.clone()))?;
        registry.register(Box::new(step_duration_seconds.clone()))?;
        registry.register(Box::new(bottlenecks_total.clone()))?;
        registry.register(Box::new(regressions_total.clone()))?;

        info!("Prometheus profiler metrics registry initialized with 7 metrics");

        Ok(Self {
            registry,
            traces_started_total,
            traces_completed_total,
            traces_abandoned_total,
            active_traces,
            step_duration_seconds,
            bottlenecks_total,
            regressions_total,
        })
    }

    /// Export metrics in Prometheus text format
    pub fn export_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder.encode(&metric_families, &mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("UTF-8 encoding error: {}", e)))
    }

    pub fn record_trace_started(&self, flow_id: &str) {
        self.traces_started_total.with_label_values(&[flow_id]).inc();
        self.active_traces.inc();
    }

    pub fn record_trace_completed(&self, flow_id: &str) {
        self.traces_completed_total.with_label_values(&[flow_id]).inc();
        self.active_traces.dec();
    }

    pub fn record_trace_abandoned(&self, flow_id: &str) {
        self.traces_abandoned_total.with_label_values(&[flow_id]).inc();
        self.active_traces.dec();
    }

    pub fn record_step_duration(&self, flow_id: &str, duration_ms: f64) {
        self.step_duration_seconds
            .with_label_values(&[flow_id])
            .observe(duration_ms / 1000.0);
    }

    pub fn record_bottlenecks(&self, bottlenecks: &[Bottleneck]) {
        for bottleneck in bottlenecks {
            self.bottlenecks_total
                .with_label_values(&[
                    &bottleneck.bottleneck_type.to_string(),
                    &bottleneck.severity.to_string(),
                ])
                .inc();
        }
    }

    pub fn record_regression(&self, flow_id: &str) {
        self.regressions_total.with_label_values(&[flow_id]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bottleneck::{BottleneckSeverity, BottleneckType};

    #[test]
    fn test_lifecycle_counters() {
        let metrics = ProfilerMetrics::new().unwrap();
        metrics.record_trace_started("flow-a");
        metrics.record_trace_started("flow-a");
        metrics.record_trace_completed("flow-a");

        assert_eq!(metrics.traces_started_total.with_label_values(&["flow-a"]).get(), 2);
        assert_eq!(metrics.active_traces.get(), 1);
    }

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = ProfilerMetrics::new().unwrap();
        metrics.record_bottlenecks(&[Bottleneck {
            bottleneck_type: BottleneckType::ResourceWait,
            step_id: "s".to_string(),
            severity: BottleneckSeverity::High,
            impact: 0.5,
            description: String::new(),
            recommendation: String::new(),
        }]);
        metrics.record_regression("flow-a");

        let text = metrics.export_metrics().unwrap();
        assert!(text.contains("profiler_bottlenecks_total"));
        assert!(text.contains("type=\"resource-wait\""));
        assert!(text.contains("profiler_regressions_total{flow_id=\"flow-a\"} 1"));
    }
}
