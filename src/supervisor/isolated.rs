//! Isolated-process execution.
//!
//! Each worker is a child process speaking the frame protocol in
//! [`codec`](super::codec) over its stdin/stdout. The parent keeps the queue,
//! the limiters and settlement; the child only runs the hooks. A child that
//! dies mid-message costs the parent nothing but a requeue.
//!
//! The child side is [`serve`], which any binary can embed via
//! [`serve_stdio`].

use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::codec::{
    recv_frame, send_frame, Frame, Handshake, ProcessOutcome, ProcessRequest, Ready, WorkerError,
    PROTOCOL_VERSION,
};
use super::worker::{abandon, admit, next_entry, settle, unexpired, WorkerEnv};
use crate::audit::LifecycleStage;
use crate::envelope::{Envelope, ParserRegistry};
use crate::events::WorkerExit;
use crate::host::{run_hooks, Host, HostCatalog, HostContext, PipelineOutcome};
use crate::types::{Error, IsolationConfig, ItemConfig, Result};

/// Environment variable carrying the worker index to the child.
pub const WORKER_ID_ENV: &str = "COURIER_WORKER_ID";

// =============================================================================
// Parent side
// =============================================================================

/// A launched, handshaken worker process.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    pid: u32,
    max_frame_bytes: u32,
}

impl WorkerProcess {
    async fn handshake(&mut self, item: &ItemConfig) -> Result<Ready> {
        send_frame(
            &mut self.stdin,
            &Frame::Handshake(Handshake {
                protocol: PROTOCOL_VERSION,
                item: item.clone(),
            }),
        )
        .await?;
        match recv_frame(&mut self.stdout, self.max_frame_bytes).await? {
            Some(Frame::Ready(ready)) => Ok(ready),
            Some(Frame::Error(err)) => Err(Error::config(format!(
                "worker rejected handshake ({}): {}",
                err.code, err.message
            ))),
            Some(other) => Err(Error::codec(format!(
                "expected ready, got {}",
                other.name()
            ))),
            None => Err(Error::internal("worker exited during handshake")),
        }
    }

    /// One request/outcome round trip.
    async fn exchange(&mut self, seq: u64, envelope: &Envelope) -> Result<PipelineOutcome> {
        send_frame(
            &mut self.stdin,
            &Frame::Process(ProcessRequest {
                seq,
                envelope: envelope.clone(),
            }),
        )
        .await?;
        match recv_frame(&mut self.stdout, self.max_frame_bytes).await? {
            Some(Frame::Outcome(ProcessOutcome { seq: got, outcome })) if got == seq => Ok(outcome),
            Some(Frame::Outcome(ProcessOutcome { seq: got, .. })) => Err(Error::codec(format!(
                "outcome for seq {} while waiting for {}",
                got, seq
            ))),
            Some(Frame::Error(err)) => Err(Error::processing(format!(
                "worker error ({}): {}",
                err.code, err.message
            ))),
            Some(other) => Err(Error::codec(format!(
                "expected outcome, got {}",
                other.name()
            ))),
            None => Err(Error::internal("worker closed its output")),
        }
    }

    /// Ask the child to exit, killing it after `grace`.
    async fn shutdown(mut self, grace: std::time::Duration) -> WorkerExit {
        if let Err(err) = send_frame(&mut self.stdin, &Frame::Shutdown).await {
            tracing::debug!(pid = self.pid, error = %err, "shutdown frame not delivered");
        }
        drop(self.stdin);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => WorkerExit::Clean,
            Ok(Ok(status)) => WorkerExit::Failed(format!("worker exited with {}", status)),
            Ok(Err(err)) => WorkerExit::Failed(err.to_string()),
            Err(_) => {
                tracing::warn!(pid = self.pid, "worker ignored shutdown; killing");
                if let Err(err) = self.child.kill().await {
                    tracing::warn!(pid = self.pid, error = %err, "kill failed");
                }
                WorkerExit::Failed("killed after shutdown grace".into())
            }
        }
    }

    async fn kill(mut self) {
        if let Err(err) = self.child.kill().await {
            tracing::debug!(pid = self.pid, error = %err, "kill failed");
        }
    }

    /// Exit status text if the child is already gone.
    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            _ => None,
        }
    }
}

/// Spawn worker `worker` for `host` and complete the handshake.
pub(crate) async fn launch(
    host: &Host,
    isolation: &IsolationConfig,
    worker: u32,
) -> Result<WorkerProcess> {
    let config = host.config();
    let command = config
        .worker_command
        .as_ref()
        .ok_or_else(|| Error::config(format!("{}: isolated item has no worker_command", config.name)))?;

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(&command.env)
        .env(WORKER_ID_ENV, worker.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::internal("worker stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::internal("worker stdout not captured"))?;
    let pid = child.id().unwrap_or_default();

    let mut process = WorkerProcess {
        child,
        stdin,
        stdout,
        pid,
        max_frame_bytes: isolation.max_frame_bytes,
    };

    let ready = match tokio::time::timeout(isolation.handshake_timeout, process.handshake(config)).await {
        Ok(Ok(ready)) => ready,
        Ok(Err(err)) => {
            let status = process.exit_status();
            process.kill().await;
            return Err(match status {
                Some(status) => Error::internal(format!("{} (exit {})", err, status)),
                None => err,
            });
        }
        Err(_) => {
            process.kill().await;
            return Err(Error::timeout(format!(
                "{} worker {} handshake exceeded {:?}",
                config.name, worker, isolation.handshake_timeout
            )));
        }
    };

    tracing::info!(
        item = %config.name,
        worker,
        pid = ready.pid,
        host_type = %ready.host_type,
        "isolated worker ready"
    );
    Ok(process)
}

enum Exchange {
    Killed,
    Lost(Error),
    Done(PipelineOutcome),
}

/// Feed `process` from the host queue until the queue closes, the child
/// dies, or a hard stop.
pub(crate) async fn bridge(
    env: WorkerEnv,
    worker: u32,
    mut process: WorkerProcess,
    isolation: IsolationConfig,
) -> WorkerExit {
    let host = env.host.clone();
    let max_messages = host.config().worker_max_messages;
    let mut seq: u64 = 0;

    loop {
        if !admit(&env).await {
            process.kill().await;
            return WorkerExit::Clean;
        }

        let entry = tokio::select! {
            entry = next_entry(&env) => entry,
            status = process.child.wait() => {
                let reason = match status {
                    Ok(status) => format!("worker process exited with {}", status),
                    Err(err) => format!("worker process lost: {}", err),
                };
                tracing::warn!(item = host.name(), worker, pid = process.pid, reason = %reason, "isolated worker exited while idle");
                return WorkerExit::Failed(reason);
            }
        };
        let Some(entry) = entry else {
            if env.kill.is_cancelled() {
                process.kill().await;
                return WorkerExit::Clean;
            }
            return process.shutdown(isolation.shutdown_grace).await;
        };
        let Some(entry) = unexpired(&env, entry).await else {
            continue;
        };

        seq += 1;
        env.inflight.begin(worker, entry.envelope().message_id());
        host.audit(LifecycleStage::Processing, entry.envelope(), None);

        let step = tokio::select! {
            _ = env.kill.cancelled() => Exchange::Killed,
            result = process.exchange(seq, entry.envelope()) => match result {
                Ok(outcome) => Exchange::Done(outcome),
                Err(err) => Exchange::Lost(err),
            },
        };

        match step {
            Exchange::Killed => {
                abandon(&env, worker, entry);
                process.kill().await;
                return WorkerExit::Clean;
            }
            Exchange::Lost(err) => {
                let reason = match process.exit_status() {
                    Some(status) => format!("{} (exit {})", err, status),
                    None => err.to_string(),
                };
                tracing::error!(
                    item = host.name(),
                    worker,
                    pid = process.pid,
                    message_id = %entry.envelope().message_id(),
                    reason = %reason,
                    "isolated worker lost mid-message; requeueing"
                );
                env.inflight.end(worker);
                host.queue().requeue(entry);
                process.kill().await;
                return WorkerExit::Crashed(reason);
            }
            Exchange::Done(outcome) => {
                settle(&env, entry, outcome).await;
                env.inflight.end(worker);
            }
        }

        if max_messages.is_some_and(|max| seq >= max) {
            tracing::info!(item = host.name(), worker, handled = seq, "worker recycling");
            return process.shutdown(isolation.shutdown_grace).await;
        }
    }
}

// =============================================================================
// Child side
// =============================================================================

async fn reject<W: AsyncWrite + Unpin>(writer: &mut W, err: Error) -> Result<()> {
    if let Err(send_err) = send_frame(writer, &Frame::Error(WorkerError::from(&err))).await {
        tracing::warn!(error = %send_err, "could not report worker error");
    }
    Err(err)
}

/// Serve the worker side of the protocol until SHUTDOWN or EOF.
pub async fn serve<R, W>(
    mut reader: R,
    mut writer: W,
    catalog: &HostCatalog,
    parsers: Arc<ParserRegistry>,
    max_frame_bytes: u32,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let item = match recv_frame(&mut reader, max_frame_bytes).await? {
        Some(Frame::Handshake(handshake)) if handshake.protocol == PROTOCOL_VERSION => handshake.item,
        Some(Frame::Handshake(handshake)) => {
            let err = Error::config(format!(
                "protocol {} not supported (expected {})",
                handshake.protocol, PROTOCOL_VERSION
            ));
            return reject(&mut writer, err).await;
        }
        Some(other) => {
            let err = Error::codec(format!("expected handshake, got {}", other.name()));
            return reject(&mut writer, err).await;
        }
        None => return Ok(()),
    };

    let hooks = match catalog.build(&item) {
        Ok(hooks) => hooks,
        Err(err) => return reject(&mut writer, err).await,
    };
    let host_type = item.host_type.clone();
    let ctx = HostContext::new(Arc::new(item), parsers);
    if let Err(err) = hooks.on_init(&ctx).await {
        return reject(&mut writer, err).await;
    }

    send_frame(
        &mut writer,
        &Frame::Ready(Ready {
            pid: std::process::id(),
            host_type,
        }),
    )
    .await?;
    tracing::info!(item = ctx.item(), "worker serving");

    loop {
        match recv_frame(&mut reader, max_frame_bytes).await? {
            Some(Frame::Process(request)) => {
                let outcome = run_hooks(hooks.as_ref(), &ctx, &request.envelope).await;
                send_frame(
                    &mut writer,
                    &Frame::Outcome(ProcessOutcome {
                        seq: request.seq,
                        outcome,
                    }),
                )
                .await?;
            }
            Some(Frame::Shutdown) | None => break,
            Some(other) => {
                let err = Error::codec(format!("unexpected {} frame", other.name()));
                return reject(&mut writer, err).await;
            }
        }
    }

    if let Err(err) = hooks.on_teardown(&ctx).await {
        tracing::warn!(item = ctx.item(), error = %err, "on_teardown failed");
    }
    tracing::info!(item = ctx.item(), "worker done");
    Ok(())
}

/// [`serve`] over this process's stdin/stdout.
pub async fn serve_stdio(
    catalog: &HostCatalog,
    parsers: Arc<ParserRegistry>,
    isolation: &IsolationConfig,
) -> Result<()> {
    serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        catalog,
        parsers,
        isolation.max_frame_bytes,
    )
    .await
}
