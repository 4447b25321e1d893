//! Router: destination name → live host queue.
//!
//! Every delivery goes through the destination's circuit breaker. The
//! messaging pattern decides whether the caller waits for processing to
//! complete and whether fan-out is serial or parallel:
//!
//! | Pattern            | Waits for completion | Fan-out  |
//! |--------------------|----------------------|----------|
//! | `async_reliable`   | no                   | serial   |
//! | `sync_reliable`    | yes                  | serial   |
//! | `concurrent_async` | no                   | parallel |
//! | `concurrent_sync`  | yes                  | parallel |
//!
//! The live graph is swapped atomically on hot reload; a delivery resolves
//! its target once and keeps that host even if the graph changes mid-call.

use futures::future::join_all;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::audit::{AuditEvent, AuditSink, LifecycleStage};
use crate::engine::HostRegistry;
use crate::envelope::Envelope;
use crate::host::{Forward, Host};
use crate::resilience::CircuitBreakerRegistry;
use crate::types::{Error, MessagingPattern, Result};

struct RouterInner {
    registry: RwLock<Arc<HostRegistry>>,
    breakers: Arc<CircuitBreakerRegistry>,
    audit: Arc<dyn AuditSink>,
}

/// Cheap-to-clone handle onto the live graph.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("hosts", &self.inner.registry.read().names())
            .finish()
    }
}

impl Router {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                registry: RwLock::new(Arc::new(HostRegistry::default())),
                breakers,
                audit,
            }),
        }
    }

    /// Swap the live graph. Returns the previous one.
    pub fn install(&self, registry: Arc<HostRegistry>) -> Arc<HostRegistry> {
        std::mem::replace(&mut *self.inner.registry.write(), registry)
    }

    /// Snapshot of the live graph.
    pub fn registry(&self) -> Arc<HostRegistry> {
        self.inner.registry.read().clone()
    }

    pub fn resolve(&self, target: &str) -> Result<Arc<Host>> {
        self.inner
            .registry
            .read()
            .get(target)
            .cloned()
            .ok_or_else(|| Error::UnknownTarget(target.to_string()))
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.inner.breakers
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// External entry: deliver `envelope` to its header destination.
    pub async fn send(
        &self,
        envelope: Envelope,
        pattern: MessagingPattern,
        timeout: Duration,
    ) -> Result<()> {
        let target = envelope.destination().to_string();
        self.inner.audit.record(AuditEvent::for_envelope(
            LifecycleStage::Received,
            &target,
            &envelope,
        ));
        self.deliver(&target, envelope, pattern.waits_for_completion(), timeout)
            .await
    }

    /// Deliver a batch of forwards under one pattern.
    pub async fn send_all(
        &self,
        forwards: Vec<Forward>,
        pattern: MessagingPattern,
        timeout: Duration,
    ) -> Result<()> {
        let wait = pattern.waits_for_completion();
        if pattern.is_concurrent() {
            let results = join_all(
                forwards
                    .into_iter()
                    .map(|f| async move { self.deliver(&f.target, f.envelope, wait, timeout).await }),
            )
            .await;
            results.into_iter().collect()
        } else {
            for forward in forwards {
                self.deliver(&forward.target, forward.envelope, wait, timeout)
                    .await?;
            }
            Ok(())
        }
    }

    /// Dispatch what `host` forwarded, under its own pattern, timeout and
    /// outbound rate limit.
    pub async fn dispatch_from(&self, host: &Host, forwards: Vec<Forward>) -> Result<()> {
        if forwards.is_empty() {
            return Ok(());
        }
        if let Some(limiter) = host.outbound_limiter() {
            // All forwards or none.
            limiter.acquire(u32::try_from(forwards.len()).unwrap_or(u32::MAX))?;
        }
        let config = host.config();
        self.send_all(forwards, config.messaging, config.message_timeout)
            .await
    }

    /// One envelope to one target, gated by the target's breaker.
    ///
    /// With `wait`, the whole delivery (admission plus processing) must finish
    /// within `timeout` or fails with [`Error::DeliveryTimeout`].
    pub async fn deliver(
        &self,
        target: &str,
        envelope: Envelope,
        wait: bool,
        timeout: Duration,
    ) -> Result<()> {
        let host = self.resolve(target)?;
        let breaker = self.inner.breakers.get(target);
        breaker.try_acquire()?;

        let result = if wait {
            let (tx, rx) = oneshot::channel();
            let delivery = async {
                host.enqueue(envelope, Some(tx)).await?;
                rx.await.unwrap_or_else(|_| {
                    Err(Error::cancelled(format!("{} dropped the completion", target)))
                })
            };
            match tokio::time::timeout(timeout, delivery).await {
                Ok(result) => result,
                Err(_) => Err(Error::DeliveryTimeout {
                    target: target.to_string(),
                    timeout,
                }),
            }
        } else {
            host.enqueue(envelope, None).await
        };

        breaker.record(&result);
        if let Err(err) = &result {
            tracing::debug!(destination = target, error = %err, "delivery failed");
        }
        result
    }
}
