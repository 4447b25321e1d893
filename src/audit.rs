//! Audit sink contract.
//!
//! Durable audit/persistence lives outside the core. The core notifies an
//! [`AuditSink`] of envelope lifecycle transitions and never waits on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// Envelope lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Received,
    Queued,
    Processing,
    Delivered,
    Failed,
    DeadLettered,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleStage::Received => "received",
            LifecycleStage::Queued => "queued",
            LifecycleStage::Processing => "processing",
            LifecycleStage::Delivered => "delivered",
            LifecycleStage::Failed => "failed",
            LifecycleStage::DeadLettered => "dead_lettered",
        };
        f.write_str(s)
    }
}

/// One lifecycle transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub stage: LifecycleStage,
    pub item: String,
    pub message_id: String,
    pub correlation_id: String,
    pub at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    pub fn for_envelope(stage: LifecycleStage, item: &str, envelope: &Envelope) -> Self {
        Self {
            stage,
            item: item.to_string(),
            message_id: envelope.message_id().to_string(),
            correlation_id: envelope.correlation_id().to_string(),
            at: Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receives lifecycle transitions. Must not block.
pub trait AuditSink: Send + Sync + fmt::Debug {
    fn record(&self, event: AuditEvent);
}

/// Default sink: one structured log line per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::debug!(
            stage = %event.stage,
            item = %event.item,
            message_id = %event.message_id,
            correlation_id = %event.correlation_id,
            detail = event.detail.as_deref().unwrap_or(""),
            "audit"
        );
    }
}

/// Hands events to an async persistence consumer over a bounded channel.
///
/// When the consumer falls behind, events are dropped and counted rather
/// than blocking the engine.
#[derive(Debug)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped = total, "audit event dropped: {}", err);
        }
    }
}
