//! Item (host) configuration.
//!
//! An `ItemConfig` is immutable for the lifetime of a running host; a change
//! replaces the host rather than mutating it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::envelope::PropertyValue;

/// Concurrency strategy for a host's workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Single logical worker on a dedicated single-threaded executor.
    #[default]
    Cooperative,
    /// N OS threads pulling from the same queue.
    ThreadPool,
    /// N child processes reached over a framed stdio channel.
    IsolatedProcess,
}

/// Queue discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    #[default]
    Fifo,
    Lifo,
    Priority,
    Unordered,
}

/// What happens on enqueue when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    #[default]
    Block,
    DropOldest,
    RejectNew,
}

/// Queue settings for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub kind: QueueKind,
    pub capacity: usize,
    pub overflow: OverflowStrategy,

    /// How long a `block` enqueue waits for space.
    #[serde(with = "humantime_serde")]
    pub block_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            kind: QueueKind::Fifo,
            capacity: 1000,
            overflow: OverflowStrategy::Block,
            block_timeout: Duration::from_secs(5),
        }
    }
}

/// When a worker exit triggers a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    Never,
    #[default]
    OnFailure,
    Always,
}

/// Delay growth between restart attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// Restart policy evaluated whenever a worker exits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub mode: RestartMode,
    pub max_restarts: u32,

    #[serde(with = "humantime_serde")]
    pub delay: Duration,

    pub backoff: Backoff,

    /// Upper bound for exponential backoff.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            mode: RestartMode::OnFailure,
            max_restarts: 5,
            delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }
}

/// How a host delivers what it forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessagingPattern {
    /// Return once admitted to the target queue.
    #[default]
    AsyncReliable,
    /// Wait for the target to report completion.
    SyncReliable,
    /// Fan out in parallel, return once all are admitted.
    ConcurrentAsync,
    /// Fan out in parallel, wait for all completions.
    ConcurrentSync,
}

impl MessagingPattern {
    pub fn waits_for_completion(self) -> bool {
        matches!(
            self,
            MessagingPattern::SyncReliable | MessagingPattern::ConcurrentSync
        )
    }

    pub fn is_concurrent(self) -> bool {
        matches!(
            self,
            MessagingPattern::ConcurrentAsync | MessagingPattern::ConcurrentSync
        )
    }
}

/// Token-bucket settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Tokens added per second.
    pub rate: f64,
    /// Bucket capacity.
    pub burst: u32,
}

/// Program launched for each isolated-process worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Configuration record for one item (host).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemConfig {
    pub name: String,

    /// Catalog key selecting the host's hook implementation.
    pub host_type: String,

    pub enabled: bool,
    pub execution: ExecutionMode,
    pub workers: u32,
    pub queue: QueueSettings,
    pub restart: RestartPolicy,
    pub messaging: MessagingPattern,

    #[serde(with = "humantime_serde")]
    pub message_timeout: Duration,

    /// Named connections this host forwards to.
    pub targets: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_target: Option<String>,

    pub max_message_retries: u32,

    /// Worker admission bucket.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSettings>,

    /// Dispatch bucket, charged once per forwarded envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_rate_limit: Option<RateLimitSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_command: Option<WorkerCommand>,

    /// Recycle a worker (clean exit) after this many envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_max_messages: Option<u64>,

    /// Host-specific settings handed to the hook implementation.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, PropertyValue>,
}

impl Default for ItemConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host_type: String::new(),
            enabled: true,
            execution: ExecutionMode::Cooperative,
            workers: 1,
            queue: QueueSettings::default(),
            restart: RestartPolicy::default(),
            messaging: MessagingPattern::AsyncReliable,
            message_timeout: Duration::from_secs(30),
            targets: Vec::new(),
            dead_letter_target: None,
            max_message_retries: 3,
            rate_limit: None,
            outbound_rate_limit: None,
            worker_command: None,
            worker_max_messages: None,
            settings: BTreeMap::new(),
        }
    }
}

impl ItemConfig {
    pub fn new(name: impl Into<String>, host_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_type: host_type.into(),
            ..Self::default()
        }
    }

    pub fn with_execution(mut self, execution: ExecutionMode, workers: u32) -> Self {
        self.execution = execution;
        self.workers = workers;
        self
    }

    pub fn with_queue(mut self, queue: QueueSettings) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_messaging(mut self, pattern: MessagingPattern, timeout: Duration) -> Self {
        self.messaging = pattern;
        self.message_timeout = timeout;
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dead_letter(mut self, target: impl Into<String>) -> Self {
        self.dead_letter_target = Some(target.into());
        self
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Effective worker count; cooperative hosts run exactly one.
    pub fn effective_workers(&self) -> u32 {
        match self.execution {
            ExecutionMode::Cooperative => 1,
            _ => self.workers.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RestartPolicy {
            delay: Duration::from_millis(100),
            backoff: Backoff::Exponential,
            max_delay: Duration::from_millis(500),
            ..RestartPolicy::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(40), Duration::from_millis(500));
    }

    #[test]
    fn test_item_config_from_json_uses_defaults() {
        let item: ItemConfig = serde_json::from_str(
            r#"{
                "name": "adt-in",
                "host_type": "passthrough",
                "execution": "thread_pool",
                "workers": 4,
                "queue": { "kind": "priority", "capacity": 10, "overflow": "reject_new" },
                "restart": { "mode": "always", "delay": "250ms" },
                "messaging": "sync_reliable",
                "message_timeout": "2s",
                "targets": ["lab-out"]
            }"#,
        )
        .unwrap();

        assert_eq!(item.execution, ExecutionMode::ThreadPool);
        assert_eq!(item.queue.kind, QueueKind::Priority);
        assert_eq!(item.queue.block_timeout, Duration::from_secs(5));
        assert_eq!(item.restart.mode, RestartMode::Always);
        assert_eq!(item.restart.delay, Duration::from_millis(250));
        assert_eq!(item.message_timeout, Duration::from_secs(2));
        assert!(item.enabled);
        assert_eq!(item.effective_workers(), 4);
    }

    #[test]
    fn test_cooperative_runs_one_worker() {
        let item = ItemConfig::new("a", "sink").with_execution(ExecutionMode::Cooperative, 8);
        assert_eq!(item.effective_workers(), 1);
    }
}
