use std::sync::Arc;

use flow_profiler::config::ProfilerSettings;
use flow_profiler::events::ProfilerEvent;
use flow_profiler::logging::{cleanup_old_logs, init_dual_logging, log_system_info, LoggingConfig};
use flow_profiler::metrics::ProfilerMetrics;
use flow_profiler::profiler::{spawn_reaper, FlowProfiler};
use flow_profiler::sampler::{BackgroundSampler, ResourceSampler, SystemSampler};
use flow_profiler::server::start_report_server;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Pre-load configuration to get logging settings
    let settings = match ProfilerSettings::from_toml("config.toml") {
        Ok(settings) => {
            // Simple print until logging is initialized
            println!("✅ Loaded configuration from config.toml");
            settings
        }
        Err(e) => {
            println!("⚠️ Failed to load config.toml: {}. Using default configuration", e);
            ProfilerSettings::default()
        }
    };

    let logging_config = LoggingConfig::from(&settings.logging);
    let _logging_guard = match init_dual_logging(logging_config.clone()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("❌ Failed to initialize logging system: {}", e);
            tracing_subscriber::fmt()
                .with_env_filter("info,flow_profiler=info")
                .init();
            error!("⚠️ Using fallback console-only logging due to error: {}", e);
            None
        }
    };

    match cleanup_old_logs(&logging_config.log_dir, settings.logging.cleanup_days) {
        Ok(removed) if removed > 0 => info!("🧹 Removed {} old log files", removed),
        Ok(_) => {}
        Err(e) => warn!("⚠️ Failed to clean up old log files: {}", e),
    }

    log_system_info();

    info!(
        sampling_rate = settings.profiler.sampling_rate,
        max_trace_history = settings.profiler.max_trace_history,
        server_enabled = settings.service.server_enabled,
        server_port = settings.service.server_port,
        log_dir = %logging_config.log_dir,
        "🔧 Profiler configuration"
    );

    info!("🚀 Starting Flow Profiler");

    let sampler = Arc::new(BackgroundSampler::new(SystemSampler::new()));
    if let Err(e) = sampler.refresh_now() {
        warn!("⚠️ Initial resource sample failed: {}", e);
    }
    sampler.start(settings.service.sampler_interval());

    let metrics = match ProfilerMetrics::new() {
        Ok(metrics) => Some(Arc::new(metrics)),
        Err(e) => {
            error!("❌ Failed to initialize metrics registry: {}", e);
            None
        }
    };

    let shared_sampler: Arc<dyn ResourceSampler> = sampler.clone();
    let profiler = match FlowProfiler::new(settings.profiler.clone(), shared_sampler) {
        Ok(profiler) => match metrics {
            Some(metrics) => profiler.with_metrics(metrics),
            None => profiler,
        },
        Err(e) => {
            error!("❌ Failed to start profiler: {}", e);
            return;
        }
    };
    let profiler = Arc::new(profiler);

    // Surface regressions and abandoned traces in the service log
    let mut events = profiler.subscribe();
    let event_logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ProfilerEvent::PerformanceRegression { flow_id, regression_percent, .. }) => {
                    info!("📉 Regression in flow {}: {:.1}% slower than baseline", flow_id, regression_percent);
                }
                Ok(ProfilerEvent::ProfilingAbandoned { flow_id, idle_secs, .. }) => {
                    info!("🗑️ Trace for flow {} abandoned after {}s idle", flow_id, idle_secs);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("⚠️ Event logger lagged, skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let reaper = spawn_reaper(profiler.clone(), settings.service.reaper_interval());

    let server = if settings.service.server_enabled {
        Some(tokio::spawn(start_report_server(settings.service.server_port, profiler.clone())))
    } else {
        info!("Report server disabled");
        None
    };

    info!("⏹️  Press Ctrl+C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Failed to listen for shutdown signal: {}", e);
    }
    info!("🛑 Shutdown signal received");

    reaper.stop().await;
    sampler.stop();
    event_logger.abort();
    if let Some(server) = server {
        server.abort();
    }

    info!(
        active_traces = profiler.active_trace_count(),
        history = profiler.history_len(),
        "🏁 Graceful shutdown completed"
    );
}
