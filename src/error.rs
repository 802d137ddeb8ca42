use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File not found or could not be read: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse scenario JSON: {0}")]
    DeserializationError(#[from] serde_json::Error),

    #[error("Unit '{0}' is not registered")]
    UnitNotFound(String),

    #[error("Fusion '{0}' is not registered")]
    UnknownFusion(String),

    #[error("Unit '{unit_id}' exceeded its timeout of {timeout_ms} ms")]
    Timeout { unit_id: String, timeout_ms: i64 },

    #[error("Simulated network failure on hop {source_region} -> {target_region}")]
    NetworkFailure { source_region: String, target_region: String },

    #[error("Unit '{unit_id}' failed during execution: {cause}")]
    ExecutionError { unit_id: String, cause: String },

    #[error("Optimization unavailable: {0}")]
    OptimizationUnavailable(String),

    #[error("Failed to build internal fusion model: {0}")]
    ModelConstructionError(String),
}

impl Error {
    /// Error kind tag recorded on failed trace nodes.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::IoError(_) => "io",
            Error::DeserializationError(_) => "deserialization",
            Error::UnitNotFound(_) => "unit_not_found",
            Error::UnknownFusion(_) => "unknown_fusion",
            Error::Timeout { .. } => "timeout",
            Error::NetworkFailure { .. } => "network_failure",
            Error::ExecutionError { .. } => "execution_error",
            Error::OptimizationUnavailable(_) => "optimization_unavailable",
            Error::ModelConstructionError(_) => "model_construction",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
