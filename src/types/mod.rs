//! Core types for the routing engine.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (MessageId, CorrelationId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Engine configuration and per-item (host) configuration

mod config;
mod errors;
mod ids;
mod item;

pub use config::{
    BreakerSettings, Config, EngineDefaults, IsolationConfig, ObservabilityConfig,
    ProductionConfig,
};
pub use errors::{BoxError, Error, Result};
pub use ids::{CorrelationId, MessageId};
pub use item::{
    Backoff, ExecutionMode, ItemConfig, MessagingPattern, OverflowStrategy, QueueKind,
    QueueSettings, RateLimitSettings, RestartMode, RestartPolicy, WorkerCommand,
};
