//! Host hook contract.
//!
//! The supervisor drives these hooks around every dequeued envelope:
//!
//! ```text
//! before_process -> process_envelope -> after_process
//!        \________________/
//!          on_error (when either raises)
//! ```
//!
//! Hooks never touch other hosts directly; forwards are returned as data and
//! dispatched by the router.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::pipeline::PipelineOutcome;
use crate::envelope::{Envelope, ParserRegistry};
use crate::types::{Error, ItemConfig, Result};

/// What `before_process` decided.
#[derive(Debug, Clone, PartialEq)]
pub enum BeforeAction {
    Continue,
    /// Process this envelope instead.
    Replace(Envelope),
    /// Acknowledge without processing.
    Skip,
}

/// One envelope bound for a named target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    pub target: String,
    pub envelope: Envelope,
}

impl Forward {
    pub fn new(target: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            target: target.into(),
            envelope,
        }
    }
}

/// What `on_error` decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Re-enqueue with an incremented retry count (bounded, TTL honoured).
    Retry,
    /// Route to the dead-letter target.
    DeadLetter(String),
    /// Mark the envelope failed.
    Fail,
}

/// Everything a hook may consult about the host it runs in.
#[derive(Debug, Clone)]
pub struct HostContext {
    config: Arc<ItemConfig>,
    parsers: Arc<ParserRegistry>,
}

impl HostContext {
    pub fn new(config: Arc<ItemConfig>, parsers: Arc<ParserRegistry>) -> Self {
        Self { config, parsers }
    }

    pub fn item(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ItemConfig {
        &self.config
    }

    pub fn parsers(&self) -> &ParserRegistry {
        &self.parsers
    }

    /// One readdressed copy of `envelope` per configured target.
    pub fn forward_to_targets(&self, envelope: &Envelope) -> Vec<Forward> {
        self.config
            .targets
            .iter()
            .map(|target| Forward::new(target, envelope.readdressed(&self.config.name, target)))
            .collect()
    }
}

/// Business behavior of a host.
#[async_trait]
pub trait HostHooks: Send + Sync + fmt::Debug {
    /// Runs once before the host accepts traffic. An error fails the host.
    async fn on_init(&self, _ctx: &HostContext) -> Result<()> {
        Ok(())
    }

    /// Runs once after the last envelope.
    async fn on_teardown(&self, _ctx: &HostContext) -> Result<()> {
        Ok(())
    }

    async fn before_process(&self, _ctx: &HostContext, _envelope: &Envelope) -> Result<BeforeAction> {
        Ok(BeforeAction::Continue)
    }

    /// The core business step. Returns zero, one or many forwards.
    async fn process_envelope(&self, ctx: &HostContext, envelope: &Envelope) -> Result<Vec<Forward>>;

    /// Observation only; errors are logged and dropped.
    async fn after_process(
        &self,
        _ctx: &HostContext,
        _envelope: &Envelope,
        _outcome: &PipelineOutcome,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when `before_process`, `process_envelope` or dispatch raised.
    async fn on_error(&self, _ctx: &HostContext, _envelope: &Envelope, _error: &Error) -> ErrorAction {
        ErrorAction::Retry
    }
}
