//! Error types for the vector store access layer

use thiserror::Error;

/// Result type alias for vector store operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Main error type for the vector store access layer
///
/// Every variant carries owned string payloads so the error is `Clone`:
/// a deduplicated in-flight request hands the same error to every waiter.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("Vector database error: {0}")]
    VectorDb(#[from] VectorDbError),

    #[error("Offline queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Operation '{operation}' timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Service not initialized: {0}")]
    NotInitialized(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors reported by the remote vector database
#[derive(Error, Debug, Clone)]
pub enum VectorDbError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Server error ({status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Request rejected ({status}): {message}")]
    RequestRejected { status: u16, message: String },

    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    #[error("Server unreachable: {0}")]
    Unavailable(String),
}

/// Errors related to the offline queue
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    #[error("A flush is already in progress")]
    FlushInProgress,

    #[error("Persistence failed: {0}")]
    Persistence(String),
}

/// Input validation failures; never retried, never queued
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Missing record ID")]
    MissingId,

    #[error("Missing vector for record {0}")]
    MissingVector(String),

    #[error("Vector for record {id} contains a non-finite value at index {index}")]
    NonFiniteVector { id: String, index: usize },

    #[error("Dimension mismatch in {collection}: expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("Batch contains vectors of different dimensions ({first} and {other})")]
    MixedDimensions { first: usize, other: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl ServiceError {
    /// Network-level failure worth retrying or queueing
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Timeout { .. } | ServiceError::CircuitOpen => true,
            ServiceError::VectorDb(e) => matches!(
                e,
                VectorDbError::ConnectionError(_)
                    | VectorDbError::Unavailable(_)
                    | VectorDbError::ServerError { .. }
            ),
            ServiceError::NotInitialized(_) => true,
            _ => false,
        }
    }

    /// The remote reports a collection or resource that no longer exists
    pub fn is_not_found(&self) -> bool {
        match self {
            ServiceError::VectorDb(VectorDbError::CollectionNotFound(_)) => true,
            ServiceError::VectorDb(VectorDbError::RequestRejected { status, message }) => {
                *status == 404 || looks_like_not_found(message)
            }
            ServiceError::VectorDb(VectorDbError::ServerError { message, .. }) => {
                looks_like_not_found(message)
            }
            _ => false,
        }
    }

    /// Bad input: retrying cannot fix it
    pub fn is_validation(&self) -> bool {
        matches!(self, ServiceError::Validation(_))
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ServiceError::CircuitOpen)
    }
}

/// Chroma reports stale collection ids and missing tenants with varying
/// status codes, so the message text is the reliable signal.
fn looks_like_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("notfounderror")
        || lower.contains("no such collection")
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for ServiceError {
    fn from(err: config::ConfigError) -> Self {
        ServiceError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for VectorDbError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            VectorDbError::Unavailable(err.to_string())
        } else if err.is_decode() {
            VectorDbError::InvalidResponse(err.to_string())
        } else {
            VectorDbError::ConnectionError(err.to_string())
        }
    }
}
