//! Host: one item's queue, hooks and lifecycle.
//!
//! A [`Host`] is passive. It owns the state machine, the queue and the
//! limiters; the supervisor owns the workers that drain it and the router
//! owns the path into it.

pub mod catalog;
pub mod hooks;
pub mod pipeline;

pub use catalog::{HostCatalog, HostFactory, PassthroughHost, SinkHost};
pub use hooks::{BeforeAction, ErrorAction, Forward, HostContext, HostHooks};
pub use pipeline::{run_hooks, PipelineOutcome};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::audit::{AuditEvent, AuditSink, LifecycleStage};
use crate::envelope::{Envelope, ParserRegistry};
use crate::events::{EngineEvent, EventBus};
use crate::queue::{Completion, MessageQueue, QueueStats};
use crate::resilience::TokenBucket;
use crate::types::{Error, ExecutionMode, ItemConfig, Result};

// =============================================================================
// State machine
// =============================================================================

/// Host lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Initializing,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl HostState {
    pub fn can_transition_to(self, to: HostState) -> bool {
        match (self, to) {
            // INITIALIZING
            (HostState::Initializing, HostState::Running) => true,
            (HostState::Initializing, HostState::Failed) => true, // on_init raised
            (HostState::Initializing, HostState::Stopped) => true, // stopped before start
            // RUNNING
            (HostState::Running, HostState::Draining) => true,
            (HostState::Running, HostState::Failed) => true,
            // DRAINING
            (HostState::Draining, HostState::Stopped) => true,
            (HostState::Draining, HostState::Failed) => true,
            // STOPPED and FAILED are terminal
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HostState::Stopped | HostState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HostState::Initializing => "initializing",
            HostState::Running => "running",
            HostState::Draining => "draining",
            HostState::Stopped => "stopped",
            HostState::Failed => "failed",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Host
// =============================================================================

#[derive(Debug, Default)]
struct HostCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    live_workers: AtomicU32,
    restarts: AtomicU32,
}

/// Host statistics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostStats {
    pub name: String,
    pub state: HostState,
    pub execution: ExecutionMode,
    pub workers: u32,
    pub live_workers: u32,
    pub restarts: u32,
    pub queue: QueueStats,
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

/// Runtime unit for one item.
pub struct Host {
    config: Arc<ItemConfig>,
    hooks: Arc<dyn HostHooks>,
    ctx: HostContext,
    queue: Arc<MessageQueue>,
    state: watch::Sender<HostState>,
    limiter: Option<TokenBucket>,
    outbound: Option<TokenBucket>,
    events: Arc<EventBus>,
    audit: Arc<dyn AuditSink>,
    counters: HostCounters,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.config.name)
            .field("host_type", &self.config.host_type)
            .field("state", &self.state())
            .field("depth", &self.queue.len())
            .finish()
    }
}

impl Host {
    pub fn new(
        config: ItemConfig,
        hooks: Arc<dyn HostHooks>,
        parsers: Arc<ParserRegistry>,
        events: Arc<EventBus>,
        audit: Arc<dyn AuditSink>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let queue = Arc::new(MessageQueue::new(config.name.clone(), config.queue.clone()));
        let limiter = config
            .rate_limit
            .map(|settings| TokenBucket::new(format!("{}:inbound", config.name), settings));
        let outbound = config
            .outbound_rate_limit
            .map(|settings| TokenBucket::new(format!("{}:outbound", config.name), settings));
        let (state, _) = watch::channel(HostState::Initializing);

        Arc::new(Self {
            ctx: HostContext::new(config.clone(), parsers),
            config,
            hooks,
            queue,
            state,
            limiter,
            outbound,
            events,
            audit,
            counters: HostCounters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &Arc<ItemConfig> {
        &self.config
    }

    pub fn hooks(&self) -> &Arc<dyn HostHooks> {
        &self.hooks
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<MessageQueue> {
        &self.queue
    }

    /// Worker admission bucket.
    pub fn limiter(&self) -> Option<&TokenBucket> {
        self.limiter.as_ref()
    }

    /// Dispatch bucket.
    pub fn outbound_limiter(&self) -> Option<&TokenBucket> {
        self.outbound.as_ref()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn audit(&self, stage: LifecycleStage, envelope: &Envelope, detail: Option<&str>) {
        let mut event = AuditEvent::for_envelope(stage, self.name(), envelope);
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.audit.record(event);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    /// Move to `to`, publishing the change.
    pub fn transition(&self, to: HostState) -> Result<()> {
        let mut from = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(to) {
                from = Some(*current);
                *current = to;
                true
            } else {
                false
            }
        });

        let Some(from) = from else {
            return Err(Error::state_transition(format!(
                "{}: {} -> {} not allowed",
                self.name(),
                self.state(),
                to
            )));
        };

        tracing::info!(item = self.name(), from = %from, to = %to, "host state changed");
        self.events.publish(EngineEvent::HostStateChanged {
            item: self.name().to_string(),
            from,
            to,
            at: Utc::now(),
        });
        Ok(())
    }

    /// Mark the host failed and notify operators. No-op when already terminal.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.transition(HostState::Failed).is_err() {
            return;
        }
        tracing::error!(item = self.name(), reason = %reason, "host failed");
        self.events.publish(EngineEvent::HostFailed {
            item: self.name().to_string(),
            reason,
        });
    }

    /// Wait until the host leaves `Initializing`.
    pub async fn wait_started(&self, timeout: Duration) -> Result<HostState> {
        let mut rx = self.subscribe_state();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| *state != HostState::Initializing),
        )
        .await
        .map_err(|_| Error::timeout(format!("{} did not start within {:?}", self.name(), timeout)))?;
        match waited {
            Ok(state) => Ok(*state),
            Err(_) => Err(Error::internal(format!("{}: state channel closed", self.name()))),
        }
    }

    // =========================================================================
    // Intake
    // =========================================================================

    /// Admit an envelope. Only a `Running` host accepts traffic.
    pub async fn enqueue(&self, envelope: Envelope, completion: Option<Completion>) -> Result<()> {
        let state = self.state();
        if state != HostState::Running {
            return Err(Error::NotAccepting {
                item: self.name().to_string(),
                state: state.to_string(),
            });
        }
        let message_id = envelope.message_id().clone();
        let audit = AuditEvent::for_envelope(LifecycleStage::Queued, self.name(), &envelope);
        self.queue.enqueue(envelope, completion).await?;
        tracing::debug!(item = self.name(), message_id = %message_id, "queued");
        self.audit.record(audit);
        Ok(())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    pub(crate) fn note_processed(&self) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_failed(&self) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_retried(&self) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_dead_lettered(&self) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_restart(&self) {
        self.counters.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_live_workers(&self, n: u32) {
        self.counters.live_workers.store(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> HostStats {
        HostStats {
            name: self.name().to_string(),
            state: self.state(),
            execution: self.config.execution,
            workers: self.config.effective_workers(),
            live_workers: self.counters.live_workers.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            queue: self.queue.stats(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::envelope::CONTENT_TYPE_TEXT;
    use crate::events::EventKind;

    fn host(events: Arc<EventBus>) -> Arc<Host> {
        Host::new(
            ItemConfig::new("adt-in", "sink"),
            Arc::new(SinkHost::default()),
            Arc::new(ParserRegistry::with_builtins()),
            events,
            Arc::new(TracingAuditSink),
        )
    }

    fn envelope() -> Envelope {
        Envelope::builder(CONTENT_TYPE_TEXT, "x")
            .build(&ParserRegistry::with_builtins())
            .unwrap()
    }

    #[test]
    fn test_state_transitions() {
        assert!(HostState::Initializing.can_transition_to(HostState::Running));
        assert!(HostState::Initializing.can_transition_to(HostState::Failed));
        assert!(HostState::Running.can_transition_to(HostState::Draining));
        assert!(HostState::Draining.can_transition_to(HostState::Stopped));
        assert!(!HostState::Running.can_transition_to(HostState::Stopped));
        assert!(!HostState::Failed.can_transition_to(HostState::Running));
        assert!(!HostState::Stopped.can_transition_to(HostState::Running));
        assert!(HostState::Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_enqueue_only_while_running() {
        let host = host(Arc::new(EventBus::new()));
        let err = host.enqueue(envelope(), None).await.unwrap_err();
        assert!(matches!(err, Error::NotAccepting { ref state, .. } if state == "initializing"));

        host.transition(HostState::Running).unwrap();
        host.enqueue(envelope(), None).await.unwrap();
        assert_eq!(host.queue().len(), 1);

        host.transition(HostState::Draining).unwrap();
        assert!(matches!(
            host.enqueue(envelope(), None).await,
            Err(Error::NotAccepting { .. })
        ));
    }

    #[tokio::test]
    async fn test_transition_publishes_and_rejects_invalid() {
        let events = Arc::new(EventBus::new());
        let (_sub, mut rx) = events.subscribe(&[EventKind::HostStateChanged]);
        let host = host(events);

        host.transition(HostState::Running).unwrap();
        match rx.recv().await.unwrap() {
            EngineEvent::HostStateChanged { from, to, .. } => {
                assert_eq!(from, HostState::Initializing);
                assert_eq!(to, HostState::Running);
            }
            other => panic!("unexpected event {:?}", other),
        }

        let err = host.transition(HostState::Stopped).unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
        assert_eq!(host.state(), HostState::Running);
    }

    #[tokio::test]
    async fn test_fail_is_idempotent() {
        let events = Arc::new(EventBus::new());
        let (_sub, mut rx) = events.subscribe(&[EventKind::HostFailed]);
        let host = host(events);
        host.transition(HostState::Running).unwrap();

        host.fail("boom");
        host.fail("again");
        assert_eq!(host.state(), HostState::Failed);
        assert!(matches!(rx.recv().await, Some(EngineEvent::HostFailed { reason, .. }) if reason == "boom"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_started() {
        let host = host(Arc::new(EventBus::new()));
        let waiter = {
            let host = host.clone();
            tokio::spawn(async move { host.wait_started(Duration::from_secs(5)).await })
        };
        host.transition(HostState::Running).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), HostState::Running);
    }
}
