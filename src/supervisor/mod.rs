//! Execution supervisor: runs one host's workers under its execution mode.
//!
//! | Mode               | Worker                                   | Crash domain |
//! |--------------------|------------------------------------------|--------------|
//! | `cooperative`      | one OS thread with a single-threaded runtime | thread   |
//! | `thread_pool`      | N OS threads on the engine runtime       | thread       |
//! | `isolated_process` | N child processes, frames over stdio     | process      |
//!
//! The supervisor task owns worker lifecycle. It starts the workers, moves
//! the host to `Running`, evaluates the restart policy on every exit, and on
//! request drains and stops the host. Panics and lost children become crash
//! exits; the envelope being processed goes back to the queue.

pub mod codec;
pub mod isolated;
pub mod recovery;
pub mod restart;
mod worker;

pub use isolated::{serve, serve_stdio};
pub use recovery::{extract_panic_message, with_recovery};
pub use restart::{RestartDecision, RestartTracker};

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{EngineEvent, WorkerExit};
use crate::host::{Host, HostState};
use crate::router::Router;
use crate::types::{Error, ExecutionMode, IsolationConfig, Result};
use worker::{dead_letter, run_worker, InFlight, WorkerEnv};

/// Placeholder wake-up when no restart is pending.
const IDLE_WAKE: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of a graceful stop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub item: String,
    /// All workers exited before the deadline.
    pub drained_cleanly: bool,
    pub abandoned: usize,
    pub dead_lettered: usize,
}

enum Control {
    Stop {
        deadline: Duration,
        reply: oneshot::Sender<StopReport>,
    },
}

/// Handle onto a running supervisor. Dropping it hard-stops the host.
#[derive(Debug)]
pub struct SupervisorHandle {
    host: Arc<Host>,
    control: mpsc::Sender<Control>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Control::Stop { deadline, .. } => f.debug_struct("Stop").field("deadline", deadline).finish(),
        }
    }
}

impl SupervisorHandle {
    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Drain for up to `deadline`, then stop.
    pub async fn stop(self, deadline: Duration) -> Result<StopReport> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(Control::Stop { deadline, reply })
            .await
            .map_err(|_| Error::internal(format!("{}: supervisor already gone", self.host.name())))?;
        let report = rx
            .await
            .map_err(|_| Error::internal(format!("{}: supervisor dropped stop reply", self.host.name())))?;
        if let Err(err) = self.task.await {
            tracing::warn!(item = self.host.name(), error = %err, "supervisor task ended abnormally");
        }
        Ok(report)
    }
}

/// Starts supervisors.
#[derive(Debug, Clone)]
pub struct ExecutionSupervisor {
    router: Router,
    isolation: IsolationConfig,
}

impl ExecutionSupervisor {
    pub fn new(router: Router, isolation: IsolationConfig) -> Self {
        Self { router, isolation }
    }

    /// Spawn the supervisor task for `host`. The host reaches `Running` (or
    /// `Failed`) asynchronously; see [`Host::wait_started`].
    pub fn start(&self, host: Arc<Host>) -> SupervisorHandle {
        let (control_tx, control_rx) = mpsc::channel(1);
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            env: WorkerEnv {
                host: host.clone(),
                router: self.router.clone(),
                inflight: Arc::new(InFlight::default()),
                kill: CancellationToken::new(),
            },
            tracker: RestartTracker::new(host.config().restart.clone()),
            isolation: self.isolation.clone(),
            runtime: Handle::current(),
            exits_tx,
            exits_rx,
            live: 0,
            pending: Vec::new(),
            initialized: false,
            gave_up: false,
        };
        let task = tokio::spawn(supervisor.run(control_rx));
        SupervisorHandle {
            host,
            control: control_tx,
            task,
        }
    }
}

// =============================================================================
// Supervisor task
// =============================================================================

struct Supervisor {
    env: WorkerEnv,
    tracker: RestartTracker,
    isolation: IsolationConfig,
    runtime: Handle,
    exits_tx: mpsc::UnboundedSender<(u32, WorkerExit)>,
    exits_rx: mpsc::UnboundedReceiver<(u32, WorkerExit)>,
    live: u32,
    /// Restarts waiting out their delay.
    pending: Vec<(Instant, u32)>,
    /// `on_init` ran in this process.
    initialized: bool,
    gave_up: bool,
}

impl Supervisor {
    fn host(&self) -> &Arc<Host> {
        &self.env.host
    }

    async fn run(mut self, mut control: mpsc::Receiver<Control>) {
        self.start().await;

        loop {
            let next_restart = self.pending.iter().map(|(at, _)| *at).min();
            let wake = next_restart.unwrap_or_else(|| Instant::now() + IDLE_WAKE);

            tokio::select! {
                command = control.recv() => match command {
                    Some(Control::Stop { deadline, reply }) => {
                        let report = self.stop(deadline).await;
                        let _ = reply.send(report);
                        return;
                    }
                    None => {
                        tracing::warn!(item = self.host().name(), "supervisor handle dropped; hard stop");
                        self.env.kill.cancel();
                        self.host().queue().close();
                        return;
                    }
                },
                Some((worker, exit)) = self.exits_rx.recv() => self.on_exit(worker, exit),
                _ = tokio::time::sleep_until(wake), if next_restart.is_some() => self.restart_due(),
            }
        }
    }

    // =========================================================================
    // Start
    // =========================================================================

    async fn start(&mut self) {
        let host = self.host().clone();
        let workers = host.config().effective_workers();
        tracing::info!(
            item = host.name(),
            execution = ?host.config().execution,
            workers,
            "starting host"
        );

        if host.config().execution == ExecutionMode::IsolatedProcess {
            for worker in 0..workers {
                match isolated::launch(&host, &self.isolation, worker).await {
                    Ok(process) => self.spawn_bridge(worker, process),
                    Err(err) => {
                        self.env.kill.cancel();
                        host.fail(format!("worker {} failed to start: {}", worker, err));
                        return;
                    }
                }
            }
        } else {
            if let Err(err) = host.hooks().on_init(host.context()).await {
                host.fail(format!("on_init failed: {}", err));
                return;
            }
            self.initialized = true;
            for worker in 0..workers {
                self.spawn_in_process(worker);
            }
        }

        if workers == 0 {
            host.fail("no workers configured");
            return;
        }
        if let Err(err) = host.transition(HostState::Running) {
            tracing::warn!(item = host.name(), error = %err, "host not started");
        }
    }

    fn spawn_in_process(&mut self, worker: u32) {
        let env = self.env.clone();
        let exits = self.exits_tx.clone();
        let mode = self.host().config().execution;
        let runtime = self.runtime.clone();
        let name = format!("{}-w{}", self.host().name(), worker);

        let spawned = std::thread::Builder::new().name(name.clone()).spawn(move || {
            let exit = with_recovery(
                || match mode {
                    ExecutionMode::Cooperative => {
                        let rt = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()?;
                        Ok(rt.block_on(run_worker(env, worker)))
                    }
                    _ => Ok(runtime.block_on(run_worker(env, worker))),
                },
                &name,
            )
            .unwrap_or_else(|err| WorkerExit::Crashed(err.to_string()));
            let _ = exits.send((worker, exit));
        });

        match spawned {
            Ok(_) => self.note_started(),
            Err(err) => {
                let _ = self
                    .exits_tx
                    .send((worker, WorkerExit::Failed(format!("thread spawn failed: {}", err))));
                self.note_started();
            }
        }
    }

    fn spawn_bridge(&mut self, worker: u32, process: isolated::WorkerProcess) {
        let env = self.env.clone();
        let exits = self.exits_tx.clone();
        let isolation = self.isolation.clone();
        tokio::spawn(async move {
            let exit = isolated::bridge(env, worker, process, isolation).await;
            let _ = exits.send((worker, exit));
        });
        self.note_started();
    }

    /// Relaunch an isolated worker without blocking the supervisor loop.
    fn relaunch_isolated(&mut self, worker: u32) {
        let env = self.env.clone();
        let exits = self.exits_tx.clone();
        let isolation = self.isolation.clone();
        tokio::spawn(async move {
            let exit = match isolated::launch(&env.host, &isolation, worker).await {
                Ok(process) => isolated::bridge(env, worker, process, isolation).await,
                Err(err) => WorkerExit::Failed(format!("relaunch failed: {}", err)),
            };
            let _ = exits.send((worker, exit));
        });
        self.note_started();
    }

    fn note_started(&mut self) {
        self.live += 1;
        self.host().set_live_workers(self.live);
    }

    // =========================================================================
    // Exits and restarts
    // =========================================================================

    fn note_exit(&mut self, worker: u32, exit: &WorkerExit) {
        self.live = self.live.saturating_sub(1);
        let host = self.host();
        host.set_live_workers(self.live);
        match exit {
            WorkerExit::Clean => tracing::info!(item = host.name(), worker, "worker exited"),
            WorkerExit::Failed(reason) | WorkerExit::Crashed(reason) => tracing::warn!(
                item = host.name(),
                worker,
                reason = %reason,
                "worker exited abnormally"
            ),
        }
        host.events().publish(EngineEvent::WorkerExited {
            item: host.name().to_string(),
            worker,
            exit: exit.clone(),
        });
    }

    fn on_exit(&mut self, worker: u32, exit: WorkerExit) {
        self.note_exit(worker, &exit);
        let host = self.host().clone();
        if self.gave_up || host.state() != HostState::Running {
            return;
        }

        match self.tracker.decide(&exit) {
            RestartDecision::Restart { attempt, delay } => {
                tracing::warn!(
                    item = host.name(),
                    worker,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "restarting worker"
                );
                host.note_restart();
                host.events().publish(EngineEvent::WorkerRestarted {
                    item: host.name().to_string(),
                    worker,
                    attempt,
                    delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                });
                self.pending.push((Instant::now() + delay, worker));
            }
            RestartDecision::Exhausted { restarts } => self.give_up(restarts),
            RestartDecision::NoRestart => {
                if self.live == 0 && self.pending.is_empty() {
                    host.fail("all workers exited");
                    self.abort_in_flight();
                    host.queue().close();
                    self.spawn_dead_letter_remaining("host failed");
                }
            }
        }
    }

    fn restart_due(&mut self) {
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = self.pending.drain(..).partition(|(at, _)| *at <= now);
        self.pending = waiting;
        for (_, worker) in due {
            if self.host().config().execution == ExecutionMode::IsolatedProcess {
                self.relaunch_isolated(worker);
            } else {
                self.spawn_in_process(worker);
            }
        }
    }

    fn give_up(&mut self, restarts: u32) {
        self.gave_up = true;
        self.pending.clear();
        let host = self.host().clone();
        tracing::error!(item = host.name(), restarts, "restart budget exhausted");
        host.events().publish(EngineEvent::RestartExhausted {
            item: host.name().to_string(),
            restarts,
        });
        host.fail(format!("restart budget exhausted after {} restarts", restarts));
        self.abort_in_flight();
        host.queue().close();
        self.spawn_dead_letter_remaining("host failed");
    }

    /// Hard-stop workers and report what they held.
    fn abort_in_flight(&self) -> usize {
        self.env.kill.cancel();
        let host = self.host();
        let abandoned = self.env.inflight.snapshot();
        for message_id in &abandoned {
            tracing::error!(item = host.name(), message_id = %message_id, "message abandoned");
            host.events().publish(EngineEvent::MessageAbandoned {
                item: host.name().to_string(),
                message_id: message_id.to_string(),
            });
        }
        abandoned.len()
    }

    fn spawn_dead_letter_remaining(&self, reason: &'static str) {
        let host = self.host().clone();
        let router = self.env.router.clone();
        tokio::spawn(async move {
            dead_letter_remaining(&host, &router, reason).await;
        });
    }

    // =========================================================================
    // Stop
    // =========================================================================

    async fn stop(&mut self, deadline: Duration) -> StopReport {
        let host = self.host().clone();
        let until = Instant::now() + deadline;
        tracing::info!(item = host.name(), deadline_ms = deadline.as_millis() as u64, "draining host");

        if host.state() == HostState::Running {
            if let Err(err) = host.transition(HostState::Draining) {
                tracing::warn!(item = host.name(), error = %err, "could not enter draining");
            }
        }
        self.pending.clear();
        host.queue().close();

        let drained_cleanly = self.await_exits(until).await;
        let mut abandoned = 0;
        if !drained_cleanly {
            tracing::warn!(
                item = host.name(),
                live = self.live,
                "drain deadline exceeded; hard stop"
            );
            abandoned = self.abort_in_flight();
            let grace = Instant::now() + self.isolation.shutdown_grace;
            self.await_exits(grace).await;
        }

        let dead_lettered = dead_letter_remaining(&host, &self.env.router, "drain deadline exceeded").await;

        if self.initialized {
            if let Err(err) = host.hooks().on_teardown(host.context()).await {
                tracing::warn!(item = host.name(), error = %err, "on_teardown failed");
            }
        }
        if !host.state().is_terminal() {
            if let Err(err) = host.transition(HostState::Stopped) {
                tracing::warn!(item = host.name(), error = %err, "could not stop host");
            }
        }

        let report = StopReport {
            item: host.name().to_string(),
            drained_cleanly,
            abandoned,
            dead_lettered,
        };
        tracing::info!(
            item = host.name(),
            drained_cleanly,
            abandoned,
            dead_lettered,
            "host stopped"
        );
        report
    }

    /// Collect exits until none are live or `until`. True when none are live.
    async fn await_exits(&mut self, until: Instant) -> bool {
        while self.live > 0 {
            tokio::select! {
                Some((worker, exit)) = self.exits_rx.recv() => self.note_exit(worker, &exit),
                _ = tokio::time::sleep_until(until) => return false,
            }
        }
        true
    }
}

/// Dead-letter everything still queued. Returns the count.
async fn dead_letter_remaining(host: &Host, router: &Router, reason: &str) -> usize {
    let remaining = host.queue().drain_all();
    let count = remaining.len();
    for entry in remaining {
        let error = Error::cancelled(format!("{} stopped before processing", host.name()));
        dead_letter(host, router, entry, reason, error).await;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingAuditSink;
    use crate::engine::HostRegistry;
    use crate::envelope::{Envelope, ParserRegistry, CONTENT_TYPE_TEXT};
    use crate::events::{EventBus, EventKind};
    use crate::host::{ErrorAction, Forward, HostContext, HostHooks, SinkHost};
    use crate::resilience::CircuitBreakerRegistry;
    use crate::types::{ItemConfig, MessagingPattern, RestartMode, RestartPolicy};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Panics on payload "panic", fails on "fail", sleeps on "slow".
    #[derive(Debug, Default)]
    struct Scripted {
        processed: AtomicU32,
        teardowns: AtomicU32,
        fail_init: bool,
        on_error: Option<ErrorAction>,
    }

    #[async_trait]
    impl HostHooks for Scripted {
        async fn on_init(&self, _ctx: &HostContext) -> Result<()> {
            if self.fail_init {
                return Err(Error::config("missing endpoint"));
            }
            Ok(())
        }

        async fn on_teardown(&self, _ctx: &HostContext) -> Result<()> {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn process_envelope(&self, ctx: &HostContext, envelope: &Envelope) -> Result<Vec<Forward>> {
            match &envelope.raw_payload()[..] {
                b"panic" => panic!("hook blew up"),
                b"fail" => Err(Error::processing("bad message")),
                b"slow" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
                _ => {
                    self.processed.fetch_add(1, Ordering::SeqCst);
                    Ok(ctx.forward_to_targets(envelope))
                }
            }
        }

        async fn on_error(&self, _ctx: &HostContext, _envelope: &Envelope, _error: &Error) -> ErrorAction {
            self.on_error.clone().unwrap_or(ErrorAction::Retry)
        }
    }

    struct Rig {
        events: Arc<EventBus>,
        router: Router,
        supervisor: ExecutionSupervisor,
    }

    impl Rig {
        fn new() -> Self {
            let router = Router::new(
                Arc::new(CircuitBreakerRegistry::default()),
                Arc::new(TracingAuditSink),
            );
            Self {
                events: Arc::new(EventBus::new()),
                supervisor: ExecutionSupervisor::new(router.clone(), IsolationConfig::default()),
                router,
            }
        }

        fn host(&self, config: ItemConfig, hooks: Arc<dyn HostHooks>) -> Arc<Host> {
            Host::new(
                config,
                hooks,
                Arc::new(ParserRegistry::with_builtins()),
                self.events.clone(),
                Arc::new(TracingAuditSink),
            )
        }

        fn install(&self, hosts: Vec<Arc<Host>>) {
            self.router.install(Arc::new(HostRegistry::from_hosts(hosts)));
        }
    }

    fn envelope(payload: &'static str, destination: &str) -> Envelope {
        Envelope::builder(CONTENT_TYPE_TEXT, payload)
            .destination(destination)
            .build(&ParserRegistry::with_builtins())
            .unwrap()
    }

    fn restart(mode: RestartMode, max_restarts: u32) -> RestartPolicy {
        RestartPolicy {
            mode,
            max_restarts,
            delay: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cooperative_processes_and_stops() {
        let rig = Rig::new();
        let hooks = Arc::new(Scripted::default());
        let host = rig.host(ItemConfig::new("adt-in", "scripted"), hooks.clone());
        rig.install(vec![host.clone()]);

        let handle = rig.supervisor.start(host.clone());
        assert_eq!(host.wait_started(Duration::from_secs(5)).await.unwrap(), HostState::Running);

        rig.router
            .send(envelope("a", "adt-in"), MessagingPattern::SyncReliable, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(hooks.processed.load(Ordering::SeqCst), 1);

        let report = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(report.drained_cleanly);
        assert_eq!(report.dead_lettered, 0);
        assert_eq!(host.state(), HostState::Stopped);
        assert_eq!(hooks.teardowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_thread_pool_drains_queue_on_stop() {
        let rig = Rig::new();
        let hooks = Arc::new(Scripted::default());
        let host = rig.host(
            ItemConfig::new("lab-out", "scripted").with_execution(ExecutionMode::ThreadPool, 3),
            hooks.clone(),
        );
        rig.install(vec![host.clone()]);
        let handle = rig.supervisor.start(host.clone());
        host.wait_started(Duration::from_secs(5)).await.unwrap();
        assert_eq!(host.stats().live_workers, 3);

        for _ in 0..20 {
            rig.router
                .send(envelope("m", "lab-out"), MessagingPattern::AsyncReliable, Duration::from_secs(1))
                .await
                .unwrap();
        }
        let report = handle.stop(Duration::from_secs(10)).await.unwrap();
        assert!(report.drained_cleanly);
        assert_eq!(hooks.processed.load(Ordering::SeqCst), 20);
        assert_eq!(host.stats().processed, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_on_init_failure_fails_host() {
        let rig = Rig::new();
        let hooks = Arc::new(Scripted {
            fail_init: true,
            ..Default::default()
        });
        let (_sub, mut rx) = rig.events.subscribe(&[EventKind::HostFailed]);
        let host = rig.host(ItemConfig::new("adt-in", "scripted"), hooks);
        let handle = rig.supervisor.start(host.clone());

        assert_eq!(host.wait_started(Duration::from_secs(5)).await.unwrap(), HostState::Failed);
        assert!(matches!(rx.recv().await, Some(EngineEvent::HostFailed { reason, .. }) if reason.contains("missing endpoint")));
        let report = handle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(host.state(), HostState::Failed);
        assert!(report.drained_cleanly);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_crash_requeues_and_exhausts_restarts() {
        let rig = Rig::new();
        let (_sub, mut rx) = rig.events.subscribe(&[EventKind::WorkerRestarted, EventKind::RestartExhausted]);
        let config = ItemConfig::new("adt-in", "scripted").with_restart(restart(RestartMode::OnFailure, 2));
        let host = rig.host(config, Arc::new(Scripted::default()));
        rig.install(vec![host.clone()]);
        let handle = rig.supervisor.start(host.clone());
        host.wait_started(Duration::from_secs(5)).await.unwrap();

        // The requeued envelope crashes every fresh worker in turn.
        host.enqueue(envelope("panic", "adt-in"), None).await.unwrap();

        let mut restarts = 0;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(EngineEvent::WorkerRestarted { .. }) => restarts += 1,
                Some(EngineEvent::RestartExhausted { restarts: n, .. }) => {
                    assert_eq!(n, 2);
                    break;
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(restarts, 2);
        assert_eq!(host.state(), HostState::Failed);
        assert_eq!(host.stats().restarts, 2);
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_never_restart_fails_when_last_worker_exits() {
        let rig = Rig::new();
        let config = ItemConfig::new("adt-in", "scripted").with_restart(restart(RestartMode::Never, 5));
        let host = rig.host(config, Arc::new(Scripted::default()));
        let handle = rig.supervisor.start(host.clone());
        host.wait_started(Duration::from_secs(5)).await.unwrap();

        let mut state = host.subscribe_state();
        host.enqueue(envelope("panic", "adt-in"), None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == HostState::Failed))
            .await
            .unwrap()
            .unwrap();
        handle.stop(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retries_then_dead_letters() {
        let rig = Rig::new();
        let (_sub, mut rx) = rig.events.subscribe(&[EventKind::MessageDeadLettered]);
        let dlq = rig.host(ItemConfig::new("dlq", "sink"), Arc::new(SinkHost::default()));
        let mut config = ItemConfig::new("adt-in", "scripted").with_dead_letter("dlq");
        config.max_message_retries = 2;
        let host = rig.host(config, Arc::new(Scripted::default()));
        rig.install(vec![host.clone(), dlq.clone()]);

        let dlq_handle = rig.supervisor.start(dlq.clone());
        let handle = rig.supervisor.start(host.clone());
        host.wait_started(Duration::from_secs(5)).await.unwrap();
        dlq.wait_started(Duration::from_secs(5)).await.unwrap();

        let err = rig
            .router
            .send(envelope("fail", "adt-in"), MessagingPattern::SyncReliable, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Processing(_)));
        assert_eq!(host.stats().retried, 2);

        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(EngineEvent::MessageDeadLettered { reason, target, .. }) => {
                assert!(reason.contains("retries exhausted"));
                assert_eq!(target.as_deref(), Some("dlq"));
            }
            other => panic!("unexpected {:?}", other),
        }

        handle.stop(Duration::from_secs(5)).await.unwrap();
        dlq_handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(dlq.stats().processed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fail_action_keeps_worker_alive() {
        let rig = Rig::new();
        let hooks = Arc::new(Scripted {
            on_error: Some(ErrorAction::Fail),
            ..Default::default()
        });
        let host = rig.host(ItemConfig::new("adt-in", "scripted"), hooks.clone());
        rig.install(vec![host.clone()]);
        let handle = rig.supervisor.start(host.clone());
        host.wait_started(Duration::from_secs(5)).await.unwrap();

        let send = |payload| rig.router.send(envelope(payload, "adt-in"), MessagingPattern::SyncReliable, Duration::from_secs(5));
        assert!(send("fail").await.is_err());
        send("ok").await.unwrap();
        assert_eq!(host.stats().failed, 1);
        assert_eq!(host.stats().live_workers, 1);
        handle.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drain_deadline_abandons_in_flight() {
        let rig = Rig::new();
        let (_sub, mut rx) = rig.events.subscribe(&[EventKind::MessageAbandoned]);
        let host = rig.host(ItemConfig::new("adt-in", "scripted"), Arc::new(Scripted::default()));
        rig.install(vec![host.clone()]);
        let handle = rig.supervisor.start(host.clone());
        host.wait_started(Duration::from_secs(5)).await.unwrap();

        let slow = envelope("slow", "adt-in");
        let slow_id = slow.message_id().to_string();
        host.enqueue(slow, None).await.unwrap();
        host.enqueue(envelope("queued", "adt-in"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = handle.stop(Duration::from_millis(200)).await.unwrap();
        assert!(!report.drained_cleanly);
        assert_eq!(report.abandoned, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(host.state(), HostState::Stopped);
        assert!(matches!(rx.recv().await, Some(EngineEvent::MessageAbandoned { message_id, .. }) if message_id == slow_id));
    }
}
