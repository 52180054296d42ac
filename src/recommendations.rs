//! Optimization recommendations
//!
//! Two outputs: a short ranked list of human-readable strings attached to a
//! flow analysis, and structured [`OptimizationRecommendation`]s built from
//! fixed rules. Both are advisory; nothing is applied automatically.

use serde::{Deserialize, Serialize};

use crate::baseline::PerformanceBaseline;
use crate::bottleneck::{Bottleneck, BottleneckType};
use crate::config::PerformanceThresholds;
use crate::history::{FlowPerformanceAnalysis, PerformanceTrend, TrendDirection};

pub const MAX_TEXT_RECOMMENDATIONS: usize = 5;
/// Degrading trends below this confidence are not reported
pub const TREND_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Ranked textual recommendations: slow p95 first, then actionable
/// bottlenecks, then confident degrading trends. At most five.
pub fn generate_text_recommendations(
    p95_duration_ms: f64,
    bottlenecks: &[Bottleneck],
    trends: &[PerformanceTrend],
    thresholds: &PerformanceThresholds,
) -> Vec<String> {
    let mut recommendations = Vec::new();

    if p95_duration_ms > thresholds.max_execution_time_ms {
        recommendations.push(format!(
            "P95 execution time ({:.0}ms) exceeds the {:.0}ms limit; parallelize independent steps or optimize the slowest ones",
            p95_duration_ms, thresholds.max_execution_time_ms
        ));
    }

    recommendations.extend(
        bottlenecks
            .iter()
            .filter(|b| b.severity.is_actionable())
            .map(|b| b.recommendation.clone()),
    );

    recommendations.extend(
        trends
            .iter()
            .filter(|t| t.direction == TrendDirection::Degrading && t.confidence > TREND_CONFIDENCE_THRESHOLD)
            .map(|t| {
                format!(
                    "Performance is degrading ({} +{:.1}% per execution); investigate recent changes to this flow",
                    t.metric, t.change_percent
                )
            }),
    );

    recommendations.truncate(MAX_TEXT_RECOMMENDATIONS);
    recommendations
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecommendationType {
    Caching,
    Parallelization,
    ResourceOptimization,
    StepReordering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub recommendation_type: RecommendationType,
    pub priority: Priority,
    pub title: String,
    pub description: String,
    /// Rough estimate of the achievable improvement, in percent
    pub expected_improvement_percent: f64,
    pub implementation_complexity: Complexity,
    pub steps: Vec<String>,
}

/// Structured recommendations for a flow, highest priority first
pub fn generate_optimization_recommendations(
    analysis: &FlowPerformanceAnalysis,
    baseline: Option<&PerformanceBaseline>,
    thresholds: &PerformanceThresholds,
) -> Vec<OptimizationRecommendation> {
    let mut recommendations = Vec::new();

    let validation_steps = steps_with(analysis, BottleneckType::Validation);
    if !validation_steps.is_empty() {
        recommendations.push(OptimizationRecommendation {
            recommendation_type: RecommendationType::Caching,
            priority: Priority::High,
            title: "Cache validation results".to_string(),
            description: format!(
                "Validation dominates steps {}; caching results for repeated inputs avoids re-validating",
                validation_steps.join(", ")
            ),
            expected_improvement_percent: 30.0,
            implementation_complexity: Complexity::Medium,
            steps: vec![
                "Identify validation inputs that repeat across executions".to_string(),
                "Key a validation cache on a hash of those inputs".to_string(),
                "Invalidate cached entries when validation rules change".to_string(),
                "Compare validation time before and after rollout".to_string(),
            ],
        });
    }

    let average_duration_ms = baseline
        .map(|b| b.average_duration_ms)
        .unwrap_or(analysis.average_duration_ms);
    if average_duration_ms > thresholds.max_execution_time_ms {
        recommendations.push(OptimizationRecommendation {
            recommendation_type: RecommendationType::Parallelization,
            priority: Priority::High,
            title: "Parallelize independent steps".to_string(),
            description: format!(
                "Average execution time {:.0}ms exceeds the {:.0}ms limit",
                average_duration_ms, thresholds.max_execution_time_ms
            ),
            expected_improvement_percent: 40.0,
            implementation_complexity: Complexity::High,
            steps: vec![
                "Map data dependencies between steps".to_string(),
                "Group steps without mutual dependencies into parallel stages".to_string(),
                "Bound concurrency to the available worker capacity".to_string(),
                "Verify results match the sequential execution".to_string(),
            ],
        });
    }

    if let Some(baseline) = baseline {
        if baseline.average_cpu_usage > thresholds.max_cpu_usage {
            recommendations.push(OptimizationRecommendation {
                recommendation_type: RecommendationType::ResourceOptimization,
                priority: Priority::Medium,
                title: "Reduce CPU consumption".to_string(),
                description: format!(
                    "Average CPU usage {:.1}% is above the {:.1}% limit",
                    baseline.average_cpu_usage, thresholds.max_cpu_usage
                ),
                expected_improvement_percent: 20.0,
                implementation_complexity: Complexity::Medium,
                steps: vec![
                    "Profile the CPU-heavy steps individually".to_string(),
                    "Replace repeated computation with precomputed or cached values".to_string(),
                    "Move heavy transforms to dedicated workers".to_string(),
                ],
            });
        }
    }

    let waiting_steps = steps_with(analysis, BottleneckType::ResourceWait);
    if !waiting_steps.is_empty() {
        recommendations.push(OptimizationRecommendation {
            recommendation_type: RecommendationType::StepReordering,
            priority: Priority::Medium,
            title: "Reorder steps to reduce resource contention".to_string(),
            description: format!("Steps {} spend a large share of time waiting for resources", waiting_steps.join(", ")),
            expected_improvement_percent: 15.0,
            implementation_complexity: Complexity::Low,
            steps: vec![
                "Find which resources the waiting steps contend for".to_string(),
                "Schedule contending steps apart from each other".to_string(),
                "Acquire shared resources as late as possible".to_string(),
            ],
        });
    }

    recommendations.sort_by(|a, b| b.priority.cmp(&a.priority));
    recommendations
}

fn steps_with(analysis: &FlowPerformanceAnalysis, kind: BottleneckType) -> Vec<&str> {
    analysis
        .bottlenecks
        .iter()
        .filter(|b| b.bottleneck_type == kind)
        .map(|b| b.step_id.as_str())
        .collect()
}
