//! Host catalog: `host_type` → hook implementation.
//!
//! Built at startup (and in every isolated worker process) and never mutated
//! afterwards.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::hooks::{Forward, HostContext, HostHooks};
use crate::envelope::Envelope;
use crate::types::{Error, ItemConfig, Result};

/// Builds hooks for one item.
pub type HostFactory = Arc<dyn Fn(&ItemConfig) -> Result<Arc<dyn HostHooks>> + Send + Sync>;

/// Registered host types.
#[derive(Clone, Default)]
pub struct HostCatalog {
    factories: HashMap<String, HostFactory>,
}

impl fmt::Debug for HostCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("HostCatalog").field("host_types", &types).finish()
    }
}

impl HostCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with `passthrough` and `sink`.
    pub fn with_builtins() -> Self {
        Self::new()
            .register("passthrough", |config: &ItemConfig| {
                Ok(Arc::new(PassthroughHost::from_config(config)) as Arc<dyn HostHooks>)
            })
            .register("sink", |_: &ItemConfig| {
                Ok(Arc::new(SinkHost::default()) as Arc<dyn HostHooks>)
            })
    }

    pub fn register<F>(mut self, host_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ItemConfig) -> Result<Arc<dyn HostHooks>> + Send + Sync + 'static,
    {
        self.factories.insert(host_type.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, host_type: &str) -> bool {
        self.factories.contains_key(host_type)
    }

    pub fn build(&self, config: &ItemConfig) -> Result<Arc<dyn HostHooks>> {
        let factory = self.factories.get(&config.host_type).ok_or_else(|| {
            Error::config(format!(
                "{}: unknown host_type '{}'",
                config.name, config.host_type
            ))
        })?;
        factory(config)
    }
}

// =============================================================================
// Built-in hosts
// =============================================================================

/// Forwards every envelope to every configured target.
///
/// Setting `validate = true` rejects envelopes that fail validation.
#[derive(Debug, Default)]
pub struct PassthroughHost {
    validate: bool,
}

impl PassthroughHost {
    pub fn from_config(config: &ItemConfig) -> Self {
        Self {
            validate: config
                .settings
                .get("validate")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    }
}

#[async_trait]
impl HostHooks for PassthroughHost {
    async fn process_envelope(&self, ctx: &HostContext, envelope: &Envelope) -> Result<Vec<Forward>> {
        if self.validate {
            envelope.ensure_valid(ctx.parsers())?;
        }
        Ok(ctx.forward_to_targets(envelope))
    }
}

/// Terminal host: accepts and counts.
#[derive(Debug, Default)]
pub struct SinkHost {
    received: AtomicU64,
}

impl SinkHost {
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl HostHooks for SinkHost {
    async fn process_envelope(&self, ctx: &HostContext, envelope: &Envelope) -> Result<Vec<Forward>> {
        let total = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            item = ctx.item(),
            message_id = %envelope.message_id(),
            total,
            "sink received"
        );
        Ok(Vec::new())
    }
}
