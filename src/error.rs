//! Error types for webai.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Task(#[from] TaskError),

    #[error("{0}")]
    Trust(#[from] TrustError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("{0}")]
    Proxy(#[from] ProxyError),

    #[error("Service not ready: {0}")]
    NotReady(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Background write failed: {0}")]
    Join(String),
}

/// Task lifecycle errors surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Task {id} cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },
}

/// Trust and assertion errors.
///
/// `Display` for the verification variants is deliberately generic; the
/// underlying reason is only logged.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("Missing or malformed authorization")]
    Missing,

    #[error("Invalid assertion")]
    Rejected { reason: String },

    #[error("No trusted keys configured")]
    NoTrustedKeys,

    #[error("Enrollment is not enabled on this node")]
    EnrollmentDisabled,

    #[error("Invalid enrollment token")]
    EnrollmentDenied,

    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("Key material error on {path}: {reason}")]
    KeyMaterial { path: String, reason: String },

    #[error("Failed to sign assertion: {0}")]
    Signing(String),
}

/// Token relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Failed to write relay token file {path}: {reason}")]
    Write { path: String, reason: String },
}

/// Agent runner failures. A run failure is recorded on the task, it never
/// propagates out of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Runner is not available: {0}")]
    Unavailable(String),

    #[error("Failed to start runner: {0}")]
    Spawn(String),

    #[error("Runner protocol error: {0}")]
    Protocol(String),

    #[error("Run failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Head → node proxy errors.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    #[error("node_id is required when multiple nodes are configured")]
    NodeRequired,

    #[error("Node {node_id} is unreachable: {reason}")]
    Unreachable { node_id: String, reason: String },

    #[error("Node {node_id} rejected the request as unauthorized")]
    Unauthorized { node_id: String, status: u16 },

    #[error("Node {node_id} returned {status}: {detail}")]
    Upstream {
        node_id: String,
        status: u16,
        detail: String,
    },

    #[error("Invalid response from node {node_id}: {reason}")]
    InvalidResponse { node_id: String, reason: String },

    #[error("Enrollment token not configured")]
    EnrollmentNotConfigured,

    #[error("Invalid task id: {0:?}")]
    InvalidTaskId(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("{0}")]
    Trust(#[from] TrustError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
