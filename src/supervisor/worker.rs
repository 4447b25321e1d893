//! Worker loop and envelope settlement.
//!
//! Every worker, whatever its execution mode, runs the same cycle:
//!
//! ```text
//! admit (rate limit) -> dequeue -> TTL check -> hooks -> settle
//! ```
//!
//! Settlement turns a [`PipelineOutcome`] into side effects: dispatch through
//! the router, bounded retry, dead-lettering, and completion of a waiting
//! sync sender. An envelope is acknowledged only once settled; a worker that
//! dies before that hands it back to the queue.

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::recovery::extract_panic_message;
use crate::audit::LifecycleStage;
use crate::events::{EngineEvent, WorkerExit};
use crate::host::{run_hooks, ErrorAction, Host, PipelineOutcome};
use crate::queue::QueueEntry;
use crate::router::Router;
use crate::types::{Error, MessageId};

/// How long one admission wait lasts before re-checking for kill.
const ADMISSION_POLL: Duration = Duration::from_secs(1);

// =============================================================================
// In-flight tracking
// =============================================================================

/// Envelopes dequeued but not yet settled, by worker.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    slots: Mutex<HashMap<u32, MessageId>>,
}

impl InFlight {
    pub(crate) fn begin(&self, worker: u32, message_id: &MessageId) {
        self.slots.lock().insert(worker, message_id.clone());
    }

    pub(crate) fn end(&self, worker: u32) {
        self.slots.lock().remove(&worker);
    }

    pub(crate) fn snapshot(&self) -> Vec<MessageId> {
        self.slots.lock().values().cloned().collect()
    }
}

/// Everything one worker needs.
#[derive(Debug, Clone)]
pub(crate) struct WorkerEnv {
    pub host: Arc<Host>,
    pub router: Router,
    pub inflight: Arc<InFlight>,
    /// Hard-stop signal.
    pub kill: CancellationToken,
}

// =============================================================================
// Loop steps
// =============================================================================

/// Take one inbound token. `false` when killed first.
pub(crate) async fn admit(env: &WorkerEnv) -> bool {
    let Some(limiter) = env.host.limiter() else {
        return !env.kill.is_cancelled();
    };
    loop {
        tokio::select! {
            _ = env.kill.cancelled() => return false,
            admitted = limiter.acquire_wait(1, ADMISSION_POLL) => {
                if admitted.is_ok() {
                    return true;
                }
            }
        }
    }
}

/// Next entry, or `None` when the queue is closed and empty or on kill.
pub(crate) async fn next_entry(env: &WorkerEnv) -> Option<QueueEntry> {
    tokio::select! {
        _ = env.kill.cancelled() => None,
        entry = env.host.queue().dequeue() => entry,
    }
}

/// Dead-letter an entry whose TTL ran out while queued. `None` when expired.
pub(crate) async fn unexpired(env: &WorkerEnv, entry: QueueEntry) -> Option<QueueEntry> {
    if !entry.envelope().is_expired(Utc::now()) {
        return Some(entry);
    }
    let error = Error::timeout(format!(
        "{} expired after {:?} in queue",
        entry.envelope().message_id(),
        entry.wait_time()
    ));
    dead_letter(&env.host, &env.router, entry, "ttl expired", error).await;
    None
}

/// Report an entry cut off by a hard stop.
pub(crate) fn abandon(env: &WorkerEnv, worker: u32, entry: QueueEntry) {
    env.inflight.end(worker);
    let error = Error::AbandonedMessage {
        item: env.host.name().to_string(),
        message_id: entry.envelope().message_id().to_string(),
    };
    entry.complete(Err(error));
}

// =============================================================================
// In-process worker
// =============================================================================

enum Step {
    Killed,
    Panicked(String),
    Done(PipelineOutcome),
}

/// Cooperative and thread-pool worker body.
pub(crate) async fn run_worker(env: WorkerEnv, worker: u32) -> WorkerExit {
    let host = env.host.clone();
    let max_messages = host.config().worker_max_messages;
    let mut handled: u64 = 0;
    tracing::debug!(item = host.name(), worker, "worker started");

    loop {
        if !admit(&env).await {
            return WorkerExit::Clean;
        }
        let Some(entry) = next_entry(&env).await else {
            return WorkerExit::Clean;
        };
        let Some(entry) = unexpired(&env, entry).await else {
            continue;
        };

        env.inflight.begin(worker, entry.envelope().message_id());
        host.audit(LifecycleStage::Processing, entry.envelope(), None);

        let step = tokio::select! {
            _ = env.kill.cancelled() => Step::Killed,
            result = AssertUnwindSafe(run_hooks(host.hooks().as_ref(), host.context(), entry.envelope())).catch_unwind() => {
                match result {
                    Ok(outcome) => Step::Done(outcome),
                    Err(payload) => Step::Panicked(extract_panic_message(payload.as_ref())),
                }
            }
        };

        match step {
            Step::Killed => {
                abandon(&env, worker, entry);
                return WorkerExit::Clean;
            }
            Step::Panicked(msg) => {
                tracing::error!(
                    item = host.name(),
                    worker,
                    message_id = %entry.envelope().message_id(),
                    panic = %msg,
                    "worker crashed; requeueing in-flight envelope"
                );
                env.inflight.end(worker);
                host.queue().requeue(entry);
                return WorkerExit::Crashed(msg);
            }
            Step::Done(outcome) => {
                settle(&env, entry, outcome).await;
                env.inflight.end(worker);
            }
        }

        handled += 1;
        if max_messages.is_some_and(|max| handled >= max) {
            tracing::info!(item = host.name(), worker, handled, "worker recycling");
            return WorkerExit::Clean;
        }
    }
}

// =============================================================================
// Settlement
// =============================================================================

/// Act on the hooks' outcome for one entry.
pub(crate) async fn settle(env: &WorkerEnv, entry: QueueEntry, outcome: PipelineOutcome) {
    let host = &env.host;
    match outcome {
        PipelineOutcome::Completed { forwards } => {
            match env.router.dispatch_from(host, forwards).await {
                Ok(()) => {
                    host.note_processed();
                    host.audit(LifecycleStage::Delivered, entry.envelope(), None);
                    entry.complete(Ok(()));
                }
                Err(err) => {
                    tracing::warn!(
                        item = host.name(),
                        message_id = %entry.envelope().message_id(),
                        error = %err,
                        "dispatch failed"
                    );
                    let action = host
                        .hooks()
                        .on_error(host.context(), entry.envelope(), &err)
                        .await;
                    apply_action(env, entry, action, err).await;
                }
            }
        }
        PipelineOutcome::Skipped => {
            host.note_processed();
            entry.complete(Ok(()));
        }
        PipelineOutcome::Retry { error } => {
            apply_action(env, entry, ErrorAction::Retry, Error::Processing(error)).await;
        }
        PipelineOutcome::DeadLetter { reason } => {
            let error = Error::Processing(reason.clone());
            apply_action(env, entry, ErrorAction::DeadLetter(reason), error).await;
        }
        PipelineOutcome::Failed { error } => {
            apply_action(env, entry, ErrorAction::Fail, Error::Processing(error)).await;
        }
    }
}

async fn apply_action(env: &WorkerEnv, mut entry: QueueEntry, action: ErrorAction, error: Error) {
    let host = &env.host;
    match action {
        ErrorAction::Retry => {
            let envelope = entry.envelope();
            let max = host.config().max_message_retries;
            if envelope.retry_count() < max && !envelope.is_expired(Utc::now()) {
                tracing::debug!(
                    item = host.name(),
                    message_id = %envelope.message_id(),
                    retry = envelope.retry_count() + 1,
                    error = %error,
                    "retrying"
                );
                let next = envelope.with_retry_increment();
                entry.replace_envelope(next);
                host.note_retried();
                host.queue().retry(entry);
            } else {
                let reason = format!("retries exhausted: {}", error);
                dead_letter(host, &env.router, entry, &reason, error).await;
            }
        }
        ErrorAction::DeadLetter(reason) => {
            dead_letter(host, &env.router, entry, &reason, error).await;
        }
        ErrorAction::Fail => {
            tracing::warn!(
                item = host.name(),
                message_id = %entry.envelope().message_id(),
                error = %error,
                "envelope failed"
            );
            host.note_failed();
            host.audit(LifecycleStage::Failed, entry.envelope(), Some(&error.to_string()));
            entry.complete(Err(error));
        }
    }
}

/// Complete with `error`, then hand a copy to the dead-letter target.
pub(crate) async fn dead_letter(
    host: &Host,
    router: &Router,
    entry: QueueEntry,
    reason: &str,
    error: Error,
) {
    let envelope = entry.complete(Err(error));
    let target = host.config().dead_letter_target.clone();

    if let Some(target) = &target {
        let copy = envelope
            .readdressed(host.name(), target)
            .with_property("dead_letter_reason", reason);
        if let Err(err) = router
            .deliver(target, copy, false, host.config().message_timeout)
            .await
        {
            tracing::error!(
                item = host.name(),
                message_id = %envelope.message_id(),
                destination = %target,
                error = %err,
                "dead-letter delivery failed"
            );
        }
    }

    tracing::warn!(
        item = host.name(),
        message_id = %envelope.message_id(),
        reason,
        "message dead-lettered"
    );
    host.note_dead_lettered();
    host.audit(LifecycleStage::DeadLettered, &envelope, Some(reason));
    host.events().publish(EngineEvent::MessageDeadLettered {
        item: host.name().to_string(),
        message_id: envelope.message_id().to_string(),
        reason: reason.to_string(),
        target,
    });
}
