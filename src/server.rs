//! Read-only HTTP report endpoints
//!
//! - GET /health - liveness check
//! - GET /flows/{flow_id}/analysis - historical analysis for a flow
//! - GET /flows/{flow_id}/recommendations - structured optimization advice
//! - GET /export[?flow_id=..] - traces, baselines and config as JSON
//! - GET /metrics - Prometheus text format

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info};
use warp::http::StatusCode;
use warp::Filter;

use crate::profiler::FlowProfiler;

#[derive(Debug, Clone, Deserialize)]
pub struct ExportQuery {
    pub flow_id: Option<String>,
}

fn with_profiler(
    profiler: Arc<FlowProfiler>,
) -> impl Filter<Extract = (Arc<FlowProfiler>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || Arc::clone(&profiler))
}

/// All report routes combined
pub fn routes(
    profiler: Arc<FlowProfiler>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let health = warp::path("health").and(warp::path::end()).and(warp::get()).map(|| {
        debug!("Health check requested");
        warp::reply::json(&json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "flow-profiler"
        }))
    });

    let analysis = warp::path!("flows" / String / "analysis")
        .and(warp::get())
        .and(with_profiler(profiler.clone()))
        .map(|flow_id: String, profiler: Arc<FlowProfiler>| {
            warp::reply::json(&profiler.get_flow_analysis(&flow_id))
        });

    let recommendations = warp::path!("flows" / String / "recommendations")
        .and(warp::get())
        .and(with_profiler(profiler.clone()))
        .map(|flow_id: String, profiler: Arc<FlowProfiler>| {
            warp::reply::json(&profiler.get_optimization_recommendations(&flow_id))
        });

    let export = warp::path("export")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<ExportQuery>())
        .and(with_profiler(profiler.clone()))
        .map(|query: ExportQuery, profiler: Arc<FlowProfiler>| {
            warp::reply::json(&profiler.export_performance_data(query.flow_id.as_deref()))
        });

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_profiler(profiler))
        .map(|profiler: Arc<FlowProfiler>| {
            let (body, status) = match profiler.metrics().map(|m| m.export_metrics()) {
                Some(Ok(text)) => (text, StatusCode::OK),
                Some(Err(e)) => {
                    error!("Failed to export metrics: {}", e);
                    (format!("Failed to export metrics: {}", e), StatusCode::INTERNAL_SERVER_ERROR)
                }
                None => ("Metrics registry not attached".to_string(), StatusCode::SERVICE_UNAVAILABLE),
            };
            warp::reply::with_header(
                warp::reply::with_status(body, status),
                "content-type",
                "text/plain; version=0.0.4; charset=utf-8",
            )
        });

    health.or(analysis).or(recommendations).or(export).or(metrics)
}

/// Serve the report routes until the task is dropped
pub async fn start_report_server(port: u16, profiler: Arc<FlowProfiler>) {
    info!("📊 Starting profiler report server on port {}", port);
    warp::serve(routes(profiler)).run(([0, 0, 0, 0], port)).await;
}
