//! One pass of the hook pipeline over a single envelope.
//!
//! The outcome is plain data so it can cross the isolated-worker channel;
//! acting on it (dispatch, retry, dead-letter, completion) is the
//! supervisor's job.

use serde::{Deserialize, Serialize};

use super::hooks::{BeforeAction, ErrorAction, Forward, HostContext, HostHooks};
use crate::envelope::Envelope;
use crate::types::Error;

/// Result of running the hooks for one envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed { forwards: Vec<Forward> },
    Skipped,
    Retry { error: String },
    DeadLetter { reason: String },
    Failed { error: String },
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. } | PipelineOutcome::Skipped)
    }

    /// Outcome for an error, as decided by `on_error`.
    pub fn from_action(action: ErrorAction, error: &Error) -> Self {
        match action {
            ErrorAction::Retry => PipelineOutcome::Retry {
                error: error.to_string(),
            },
            ErrorAction::DeadLetter(reason) => PipelineOutcome::DeadLetter { reason },
            ErrorAction::Fail => PipelineOutcome::Failed {
                error: error.to_string(),
            },
        }
    }
}

/// Run `before_process`, `process_envelope`, `on_error` and `after_process`.
pub async fn run_hooks(
    hooks: &dyn HostHooks,
    ctx: &HostContext,
    envelope: &Envelope,
) -> PipelineOutcome {
    let replaced;
    let (current, result) = match hooks.before_process(ctx, envelope).await {
        Ok(BeforeAction::Skip) => (envelope, Ok(None)),
        Ok(BeforeAction::Continue) => (envelope, hooks.process_envelope(ctx, envelope).await.map(Some)),
        Ok(BeforeAction::Replace(next)) => {
            replaced = next;
            (&replaced, hooks.process_envelope(ctx, &replaced).await.map(Some))
        }
        Err(err) => (envelope, Err(err)),
    };

    let outcome = match result {
        Ok(Some(forwards)) => PipelineOutcome::Completed { forwards },
        Ok(None) => PipelineOutcome::Skipped,
        Err(err) => {
            tracing::debug!(
                item = ctx.item(),
                message_id = %current.message_id(),
                error = %err,
                "hook raised"
            );
            let action = hooks.on_error(ctx, current, &err).await;
            PipelineOutcome::from_action(action, &err)
        }
    };

    if let Err(err) = hooks.after_process(ctx, current, &outcome).await {
        tracing::warn!(
            item = ctx.item(),
            message_id = %current.message_id(),
            error = %err,
            "after_process failed"
        );
    }
    outcome
}
