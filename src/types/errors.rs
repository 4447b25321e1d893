//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error raised by external collaborators (parsers, sinks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error enum for the routing core.
#[derive(Error, Debug)]
pub enum Error {
    /// No parser is registered for the content-type token.
    #[error("invalid content type: no parser registered for '{0}'")]
    InvalidContentType(String),

    /// The registered parser rejected the raw payload.
    #[error("parse error ({content_type}): {source}")]
    Parse {
        content_type: String,
        #[source]
        source: BoxError,
    },

    /// Validation errors (non-fatal when recorded on an envelope).
    #[error("validation error: {0}")]
    Validation(String),

    /// `reject_new` overflow: the queue is at capacity.
    #[error("queue full: {item} (capacity {capacity})")]
    QueueFull { item: String, capacity: usize },

    /// `block` overflow: no space freed before the timeout.
    #[error("queue timeout: {item} still full after {waited:?}")]
    QueueTimeout { item: String, waited: Duration },

    /// Delivery refused preemptively by the target's breaker.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Sync pattern deadline exceeded.
    #[error("delivery timeout: {target} did not complete within {timeout:?}")]
    DeliveryTimeout { target: String, timeout: Duration },

    /// Routing misconfiguration.
    #[error("unknown target: {0}")]
    UnknownTarget(String),

    /// The supervisor gave up on a host.
    #[error("restart exhausted: {item} after {restarts} restarts")]
    RestartExhausted { item: String, restarts: u32 },

    /// Hard stop lost an in-flight envelope.
    #[error("abandoned message {message_id} on {item}")]
    AbandonedMessage { item: String, message_id: String },

    /// Host is not accepting enqueues (initializing, draining, stopped, failed).
    #[error("host not accepting: {item} is {state}")]
    NotAccepting { item: String, state: String },

    /// Rate limiter refused admission.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// A processing hook raised.
    #[error("processing error: {0}")]
    Processing(String),

    /// Invalid state transition.
    #[error("state transition error: {0}")]
    StateTransition(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic timeout (startup, drain).
    #[error("timeout: {0}")]
    Timeout(String),

    /// Cancellation (evicted entries, dropped completions).
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// JSON serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary codec errors.
    #[error("codec error: {0}")]
    Codec(String),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this outcome is charged against the target's circuit breaker.
    ///
    /// Refusals that never reached the target (breaker, limiter, routing)
    /// say nothing about the target's health.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            Error::CircuitOpen(_)
                | Error::UnknownTarget(_)
                | Error::RateLimited(_)
                | Error::InvalidContentType(_)
                | Error::Validation(_)
        )
    }

    /// Short machine-readable code, used in audit details and worker frames.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidContentType(_) => "INVALID_CONTENT_TYPE",
            Error::Parse { .. } => "PARSE",
            Error::Validation(_) => "VALIDATION",
            Error::QueueFull { .. } => "QUEUE_FULL",
            Error::QueueTimeout { .. } => "QUEUE_TIMEOUT",
            Error::CircuitOpen(_) => "CIRCUIT_OPEN",
            Error::DeliveryTimeout { .. } => "DELIVERY_TIMEOUT",
            Error::UnknownTarget(_) => "UNKNOWN_TARGET",
            Error::RestartExhausted { .. } => "RESTART_EXHAUSTED",
            Error::AbandonedMessage { .. } => "ABANDONED",
            Error::NotAccepting { .. } => "NOT_ACCEPTING",
            Error::RateLimited(_) => "RATE_LIMITED",
            Error::Processing(_) => "PROCESSING",
            Error::StateTransition(_) => "STATE_TRANSITION",
            Error::Config(_) => "CONFIG",
            Error::Timeout(_) => "TIMEOUT",
            Error::Cancelled(_) => "CANCELLED",
            Error::Internal(_) => "INTERNAL",
            Error::Serialization(_) => "SERIALIZATION",
            Error::Codec(_) => "CODEC",
            Error::Io(_) => "IO",
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    pub fn state_transition(msg: impl Into<String>) -> Self {
        Self::StateTransition(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}
