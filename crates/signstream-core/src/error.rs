//! Error types for Signstream

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("server is shutting down")]
    ShuttingDown,

    #[error("client not found: {0}")]
    ClientNotFound(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("pipeline error: {0}")]
    Pipeline(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stable wire code for client-visible errors.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            Error::ShuttingDown => "SERVER_SHUTTING_DOWN",
            Error::ClientNotFound(_) => "CLIENT_NOT_FOUND",
            Error::ConnectionClosed(_) => "CONNECTION_CLOSED",
            Error::Pipeline(_) => "PROCESSING_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Json(_) => "INVALID_JSON",
            Error::Internal(_) => "SERVER_ERROR",
        }
    }
}
