use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::WorkerKind;
use crate::config::Config;
use crate::decoder::{decode_line, Decoded, LineDecoder};
use crate::protocol::{WorkerMessage, WorkflowRequest};

/// Buffer between the stdout reader and the event consumer. Bounded so
/// a slow consumer backpressures the reader instead of queueing
/// unboundedly.
const WORKER_EVENT_BUFFER: usize = 256;

/// Grace period for collecting the stderr tail after the worker is
/// gone.
const STDERR_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to serialize worker input: {0}")]
    Input(#[from] serde_json::Error),
    #[error("failed to start worker process: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a worker stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Exit code zero. Not sufficient for success on the streaming
    /// path: a terminal protocol message is still required.
    Clean,
    Failed { code: Option<i32> },
    TimedOut,
    /// The worker printed a line exceeding the configured cap.
    OutputOverflow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerExit {
    pub reason: ExitReason,
    /// Bounded tail of the worker's stderr, for diagnostics only.
    pub stderr_tail: String,
}

/// Events surfaced to the owner of a streaming worker. Zero or more
/// `Message`s followed by exactly one `Exited`, unless the owner
/// terminates the worker first.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    Exited(WorkerExit),
}

/// Owning handle for one spawned worker. Dropping the handle (or
/// calling [`terminate`](WorkerHandle::terminate)) kills the process;
/// the process is additionally `kill_on_drop` as a backstop.
#[derive(Debug)]
pub struct WorkerHandle {
    pub worker_id: Uuid,
    events: mpsc::Receiver<WorkerEvent>,
    terminate: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    /// Assemble a handle from raw channels. Exposed so tests can stand
    /// in a scripted worker without spawning a process.
    pub fn new(
        worker_id: Uuid,
        events: mpsc::Receiver<WorkerEvent>,
        terminate: oneshot::Sender<()>,
    ) -> Self {
        Self {
            worker_id,
            events,
            terminate: Some(terminate),
        }
    }

    /// Next event from the worker; `None` once the stream is finished
    /// or the worker has been terminated.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Request termination of the worker process. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(tx) = self.terminate.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of a buffered (non-streaming) worker run.
#[derive(Debug, Clone)]
pub struct BufferedRun {
    pub stdout: String,
    pub stderr_tail: String,
    pub reason: ExitReason,
}

/// Seam between the relay and process spawning, so connection handling
/// can be exercised against scripted doubles.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    async fn launch(&self, request: &WorkflowRequest) -> Result<WorkerHandle, SpawnError>;
}

/// Launches one external worker process per request and tracks its
/// lifecycle. No retries: a failed workflow is retried by the user.
pub struct WorkerSupervisor {
    config: Config,
}

impl WorkerSupervisor {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    fn command(&self, kind: WorkerKind, input: &impl Serialize) -> Result<Command, SpawnError> {
        let payload = serde_json::to_string(input)?;
        let script = self.config.worker_script(kind);
        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg(&script)
            .env(kind.input_env(), payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Spawn a streaming worker: stdout is decoded line by line into
    /// [`WorkerEvent`]s, stderr goes to the diagnostic log and a
    /// bounded tail.
    pub fn spawn(
        &self,
        kind: WorkerKind,
        input: &impl Serialize,
    ) -> Result<WorkerHandle, SpawnError> {
        let mut child = self.command(kind, input)?.spawn()?;
        let worker_id = Uuid::new_v4();
        info!(
            worker_id = %worker_id,
            kind = %kind,
            pid = child.id().unwrap_or(0),
            "Spawned worker process"
        );

        let stdout = take_pipe(child.stdout.take(), "stdout")?;
        let stderr = take_pipe(child.stderr.take(), "stderr")?;

        let (tx, rx) = mpsc::channel(WORKER_EVENT_BUFFER);
        let (term_tx, term_rx) = oneshot::channel();

        let stderr_task = spawn_stderr_reader(worker_id, stderr, self.config.stderr_tail_bytes);
        let timeout = self.config.worker_timeout();
        let line_limit = self.config.stdout_line_limit;
        tokio::spawn(async move {
            supervise(
                worker_id,
                child,
                stdout,
                stderr_task,
                tx,
                term_rx,
                timeout,
                line_limit,
            )
            .await;
        });

        Ok(WorkerHandle::new(worker_id, rx, term_tx))
    }

    /// Run a worker to completion, buffering its full stdout. Used by
    /// the non-streaming request/response façade.
    pub async fn run_buffered(
        &self,
        kind: WorkerKind,
        input: &impl Serialize,
    ) -> Result<BufferedRun, SpawnError> {
        let child = self.command(kind, input)?.spawn()?;
        let worker_id = Uuid::new_v4();
        info!(
            worker_id = %worker_id,
            kind = %kind,
            pid = child.id().unwrap_or(0),
            "Spawned buffered worker process"
        );

        // kill_on_drop reaps the child if the timeout wins the race
        match tokio::time::timeout(self.config.worker_timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let reason = if output.status.success() {
                    ExitReason::Clean
                } else {
                    warn!(
                        worker_id = %worker_id,
                        status = %output.status,
                        "Buffered worker exited with failure"
                    );
                    ExitReason::Failed {
                        code: output.status.code(),
                    }
                };
                Ok(BufferedRun {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr_tail: tail_of(&output.stderr, self.config.stderr_tail_bytes),
                    reason,
                })
            }
            Ok(Err(e)) => Err(SpawnError::Io(e)),
            Err(_) => {
                warn!(worker_id = %worker_id, "Buffered worker exceeded run time limit");
                Ok(BufferedRun {
                    stdout: String::new(),
                    stderr_tail: String::new(),
                    reason: ExitReason::TimedOut,
                })
            }
        }
    }
}

#[async_trait]
impl WorkflowLauncher for WorkerSupervisor {
    async fn launch(&self, request: &WorkflowRequest) -> Result<WorkerHandle, SpawnError> {
        self.spawn(WorkerKind::LessonWorkflow, request)
    }
}

fn take_pipe<T>(pipe: Option<T>, name: &str) -> Result<T, SpawnError> {
    pipe.ok_or_else(|| {
        SpawnError::Io(std::io::Error::other(format!(
            "worker {name} was not captured"
        )))
    })
}

/// Keep the last `cap` bytes of a diagnostic stream.
fn tail_of(bytes: &[u8], cap: usize) -> String {
    let start = bytes.len().saturating_sub(cap);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

fn spawn_stderr_reader(worker_id: Uuid, stderr: ChildStderr, cap: usize) -> JoinHandle<String> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: Vec<u8> = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(worker_id = %worker_id, "worker stderr: {}", line);
            tail.extend_from_slice(line.as_bytes());
            tail.push(b'\n');
            if tail.len() > cap {
                let excess = tail.len() - cap;
                tail.drain(..excess);
            }
        }
        String::from_utf8_lossy(&tail).trim().to_string()
    })
}

async fn forward_line(tx: &mpsc::Sender<WorkerEvent>, line: &str) -> bool {
    match decode_line::<WorkerMessage>(line) {
        Decoded::Parsed(message) => tx.send(WorkerEvent::Message(message)).await.is_ok(),
        Decoded::Skipped => true,
    }
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Worker kill signal failed (process may have exited)");
    }
    let _ = child.wait().await;
}

fn exit_reason(status: std::io::Result<std::process::ExitStatus>) -> ExitReason {
    match status {
        Ok(status) if status.success() => ExitReason::Clean,
        Ok(status) => ExitReason::Failed {
            code: status.code(),
        },
        Err(_) => ExitReason::Failed { code: None },
    }
}

/// Drive one worker to completion: read stdout incrementally, decode
/// and forward messages in arrival order, then report the exit.
/// Returns without an `Exited` event only when the owner terminated
/// the worker (the owner is gone or no longer listening).
#[allow(clippy::too_many_arguments)]
async fn supervise(
    worker_id: Uuid,
    mut child: Child,
    mut stdout: ChildStdout,
    stderr_task: JoinHandle<String>,
    tx: mpsc::Sender<WorkerEvent>,
    mut term_rx: oneshot::Receiver<()>,
    timeout: Duration,
    line_limit: usize,
) {
    let mut decoder = LineDecoder::new(line_limit);
    let mut buf = [0u8; 8192];
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let reason = loop {
        tokio::select! {
            _ = &mut deadline => {
                warn!(worker_id = %worker_id, "Worker exceeded run time limit, killing");
                kill_and_reap(&mut child).await;
                break ExitReason::TimedOut;
            }
            _ = &mut term_rx => {
                debug!(worker_id = %worker_id, "Worker terminated by owner");
                kill_and_reap(&mut child).await;
                stderr_task.abort();
                return;
            }
            read = stdout.read(&mut buf) => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(worker_id = %worker_id, error = %e, "Error reading worker stdout");
                        0
                    }
                };
                if n == 0 {
                    // end of stream: flush the trailing fragment, then
                    // wait for the process to exit
                    if let Some(line) = decoder.finish() {
                        if !forward_line(&tx, &line).await {
                            kill_and_reap(&mut child).await;
                            stderr_task.abort();
                            return;
                        }
                    }
                    tokio::select! {
                        _ = &mut deadline => {
                            warn!(worker_id = %worker_id, "Worker exceeded run time limit after closing stdout, killing");
                            kill_and_reap(&mut child).await;
                            break ExitReason::TimedOut;
                        }
                        _ = &mut term_rx => {
                            kill_and_reap(&mut child).await;
                            stderr_task.abort();
                            return;
                        }
                        status = child.wait() => break exit_reason(status),
                    }
                }
                match decoder.push(&buf[..n]) {
                    Ok(lines) => {
                        for line in lines {
                            if !forward_line(&tx, &line).await {
                                debug!(worker_id = %worker_id, "Worker event receiver dropped, killing worker");
                                kill_and_reap(&mut child).await;
                                stderr_task.abort();
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "Worker stdout overflowed the line buffer, killing");
                        kill_and_reap(&mut child).await;
                        break ExitReason::OutputOverflow;
                    }
                }
            }
        }
    };

    // the stderr pipe can stay open past the kill if the worker
    // leaked a grandchild; don't let that stall the exit report
    let abort_handle = stderr_task.abort_handle();
    let stderr_tail = match tokio::time::timeout(STDERR_FLUSH_TIMEOUT, stderr_task).await {
        Ok(tail) => tail.unwrap_or_default(),
        Err(_) => {
            abort_handle.abort();
            String::new()
        }
    };
    info!(worker_id = %worker_id, reason = ?reason, "Worker exited");
    let _ = tx
        .send(WorkerEvent::Exited(WorkerExit {
            reason,
            stderr_tail,
        }))
        .await;
}
