use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Failures reported by a resource sampler. The recording path never
/// propagates these; they degrade to the last known reading.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplerError {
    #[error("Process not found: {0}")]
    ProcessNotFound(u32),
    #[error("Resource reading unavailable: {0}")]
    Unavailable(String),
}
