//! Profiler configuration
//!
//! All options carry serde defaults so a partial `config.toml` is enough to
//! start the service. `ProfilerConfig::validate` is the single gate used by
//! `FlowProfiler::new`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::errors::ProfilerError;
use crate::logging::{LogRotation, LoggingConfig};

/// Thresholds consumed by the bottleneck rules and the recommendation generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceThresholds {
    /// Upper bound for an acceptable execution, in milliseconds
    pub max_execution_time_ms: f64,
    /// Memory ceiling per step, in megabytes
    pub max_memory_usage_mb: f64,
    /// CPU percentage above which a flow is considered resource hungry
    pub max_cpu_usage: f64,
    /// Minimum executions per second expected from a flow
    pub min_throughput: f64,
    /// Maximum acceptable latency, in milliseconds
    pub max_latency_ms: f64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_execution_time_ms: 30_000.0,
            max_memory_usage_mb: 512.0,
            max_cpu_usage: 80.0,
            min_throughput: 10.0,
            max_latency_ms: 1_000.0,
        }
    }
}

/// Profiler behaviour switches and limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Master on/off switch
    pub enable_tracing: bool,
    /// Gates per-step and trace-level bottleneck rules
    pub enable_bottleneck_detection: bool,
    /// Gates baseline comparison and regression events
    pub enable_regression_detection: bool,
    /// Fraction of executions traced (0.0 - 1.0)
    pub sampling_rate: f64,
    /// Completed traces retained across all flows (FIFO)
    pub max_trace_history: usize,
    /// Idle time after which an active trace is reaped as abandoned
    pub stale_trace_grace_period_secs: u64,
    pub performance_thresholds: PerformanceThresholds,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enable_tracing: true,
            enable_bottleneck_detection: true,
            enable_regression_detection: true,
            sampling_rate: 1.0,
            max_trace_history: 1000,
            stale_trace_grace_period_secs: 3600,
            performance_thresholds: PerformanceThresholds::default(),
        }
    }
}

impl ProfilerConfig {
    /// Reject values the profiler cannot operate with
    pub fn validate(&self) -> Result<(), ProfilerError> {
        if !self.sampling_rate.is_finite() || !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ProfilerError::InvalidConfig(format!(
                "sampling_rate must be within [0, 1], got {}",
                self.sampling_rate
            )));
        }
        if self.max_trace_history == 0 {
            return Err(ProfilerError::InvalidConfig(
                "max_trace_history must be greater than zero".to_string(),
            ));
        }

        let t = &self.performance_thresholds;
        for (name, value) in [
            ("max_execution_time_ms", t.max_execution_time_ms),
            ("max_memory_usage_mb", t.max_memory_usage_mb),
            ("max_latency_ms", t.max_latency_ms),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ProfilerError::InvalidConfig(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }
        for (name, value) in [("max_cpu_usage", t.max_cpu_usage), ("min_throughput", t.min_throughput)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ProfilerError::InvalidConfig(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

/// Logging configuration from config.toml
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingTomlConfig {
    pub log_dir: String,
    pub level_filter: String,
    /// "daily" or "hourly"
    pub rotation: String,
    pub console_timestamps: bool,
    pub file_json_format: bool,
    pub cleanup_days: u32,
}

impl Default for LoggingTomlConfig {
    fn default() -> Self {
        let defaults = LoggingConfig::default();
        Self {
            log_dir: defaults.log_dir,
            level_filter: defaults.level_filter,
            rotation: "daily".to_string(),
            console_timestamps: defaults.console_timestamps,
            file_json_format: defaults.file_json_format,
            cleanup_days: 30,
        }
    }
}

impl From<&LoggingTomlConfig> for LoggingConfig {
    fn from(toml_config: &LoggingTomlConfig) -> Self {
        let rotation = match toml_config.rotation.to_ascii_lowercase().as_str() {
            "hourly" => LogRotation::Hourly,
            _ => LogRotation::Daily,
        };
        Self {
            log_dir: toml_config.log_dir.clone(),
            level_filter: toml_config.level_filter.clone(),
            rotation,
            console_timestamps: toml_config.console_timestamps,
            file_json_format: toml_config.file_json_format,
        }
    }
}

/// Report server and background task settings from config.toml
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceTomlConfig {
    pub server_enabled: bool,
    pub server_port: u16,
    /// How often the resource sampler refreshes its readings
    pub sampler_interval_ms: u64,
    /// How often stale active traces are reaped
    pub reaper_interval_secs: u64,
}

impl Default for ServiceTomlConfig {
    fn default() -> Self {
        Self {
            server_enabled: true,
            server_port: 9877,
            sampler_interval_ms: 500,
            reaper_interval_secs: 60,
        }
    }
}

impl ServiceTomlConfig {
    /// Sampler refresh period; zero is raised to one millisecond since a
    /// tokio interval cannot have a zero period
    pub fn sampler_interval(&self) -> Duration {
        Duration::from_millis(self.sampler_interval_ms.max(1))
    }

    /// Reaper sweep period, at least one second
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}

/// Complete service settings as read from config.toml
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProfilerSettings {
    pub profiler: ProfilerConfig,
    pub logging: LoggingTomlConfig,
    pub service: ServiceTomlConfig,
}

impl ProfilerSettings {
    /// Load configuration from a TOML file
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ProfilerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let settings = Self::from_toml_str(&content)?;
        info!(path = %path.as_ref().display(), "📋 Loaded profiler configuration");
        Ok(settings)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ProfilerError> {
        let settings: ProfilerSettings = toml::from_str(content)?;
        settings.profiler.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = ProfilerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_trace_history, 1000);
        assert_eq!(config.sampling_rate, 1.0);
        assert_eq!(config.performance_thresholds.max_memory_usage_mb, 512.0);
    }

    #[test]
    fn test_sampling_rate_out_of_range_rejected() {
        let config = ProfilerConfig { sampling_rate: 1.5, ..Default::default() };
        assert!(matches!(config.validate(), Err(ProfilerError::InvalidConfig(_))));

        let config = ProfilerConfig { sampling_rate: f64::NAN, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_history_rejected() {
        let config = ProfilerConfig { max_trace_history: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_non_positive_threshold_rejected() {
        let mut config = ProfilerConfig::default();
        config.performance_thresholds.max_memory_usage_mb = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings = ProfilerSettings::from_toml_str(
            r#"
            [profiler]
            sampling_rate = 0.25
            max_trace_history = 50

            [profiler.performance_thresholds]
            max_execution_time_ms = 5000.0

            [logging]
            rotation = "hourly"
            "#,
        )
        .unwrap();

        assert_eq!(settings.profiler.sampling_rate, 0.25);
        assert_eq!(settings.profiler.max_trace_history, 50);
        assert!(settings.profiler.enable_tracing);
        assert_eq!(settings.profiler.performance_thresholds.max_execution_time_ms, 5000.0);
        assert_eq!(settings.profiler.performance_thresholds.max_cpu_usage, 80.0);
        assert_eq!(settings.service.server_port, 9877);

        let logging: LoggingConfig = (&settings.logging).into();
        assert!(matches!(logging.rotation, LogRotation::Hourly));
    }

    #[test]
    fn test_zero_service_intervals_are_clamped() {
        let settings = ProfilerSettings::from_toml_str(
            r#"
            [service]
            sampler_interval_ms = 0
            reaper_interval_secs = 0
            "#,
        )
        .unwrap();

        assert_eq!(settings.service.sampler_interval(), Duration::from_millis(1));
        assert_eq!(settings.service.reaper_interval(), Duration::from_secs(1));
        assert_eq!(ServiceTomlConfig::default().sampler_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_invalid_toml_values_rejected() {
        let result = ProfilerSettings::from_toml_str("[profiler]\nsampling_rate = 2.0\n");
        assert!(matches!(result, Err(ProfilerError::InvalidConfig(_))));

        let result = ProfilerSettings::from_toml_str("[profiler\n");
        assert!(matches!(result, Err(ProfilerError::ConfigParse(_))));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[profiler]\nenable_regression_detection = false\n").unwrap();

        let settings = ProfilerSettings::from_toml(&path).unwrap();
        assert!(!settings.profiler.enable_regression_detection);

        let missing = ProfilerSettings::from_toml(temp_dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ProfilerError::Io(_))));
    }
}
