//! Supervision of one external transcoding process.
//!
//! A supervisor owns the child's stdio and bridges its raw side to an
//! in-memory pipe handed back to the caller. The child's terminal outcome is
//! delivered exactly once through a [`CompletionSignal`], after the supervisor
//! has closed its end of that pipe.

use std::{
    future::Future,
    pin::Pin,
    process::Stdio,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream},
    process::{Child, ChildStderr, Command},
    sync::oneshot,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{PipelineError, Stage},
    geometry::StreamGeometry,
};

/// Read side of a pipe: raw frames flowing out of a stage.
pub type PipeReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write side of a pipe: raw frames flowing into a stage.
pub type PipeWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How long an encoder whose stdin broke gets to exit on its own before it is killed.
const EXIT_GRACE: Duration = Duration::from_secs(2);
/// How long stderr forwarding may lag behind the child's exit.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// What a stage needs to know when it is started.
#[derive(Clone)]
pub struct StageContext {
    pub geometry: StreamGeometry,
    /// Capacity of the in-memory pipe, in bytes.
    pub pipe_capacity: usize,
    /// Cancelled when the run should stop early.
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(geometry: StreamGeometry, pipe_frames: usize, cancel: CancellationToken) -> Self {
        Self {
            geometry,
            pipe_capacity: geometry.frame_len().saturating_mul(pipe_frames.max(1)),
            cancel,
        }
    }
}

/// Program plus arguments for one external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        command
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// One-shot notification of a stage's terminal outcome.
pub struct CompletionSignal {
    stage: Stage,
    rx: oneshot::Receiver<Result<(), PipelineError>>,
}

/// Sending half of a [`CompletionSignal`]; consumed by the single report it makes.
pub struct CompletionSender {
    stage: Stage,
    tx: oneshot::Sender<Result<(), PipelineError>>,
}

impl CompletionSignal {
    pub fn channel(stage: Stage) -> (CompletionSender, CompletionSignal) {
        let (tx, rx) = oneshot::channel();
        (CompletionSender { stage, tx }, CompletionSignal { stage, rx })
    }
}

impl Future for CompletionSignal {
    type Output = Result<(), PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let stage = self.stage;
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            // A dropped sender means the supervising task died before reporting.
            result.unwrap_or(Err(PipelineError::StageAborted { stage }))
        })
    }
}

impl CompletionSender {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn complete(self, result: Result<(), PipelineError>) {
        // The receiver may already be gone if the orchestrator bailed out.
        let _ = self.tx.send(result);
    }
}

/// Runs one external program with its raw side bridged to an in-memory pipe.
pub struct ProcessSupervisor {
    stage: Stage,
    command: CommandSpec,
}

impl ProcessSupervisor {
    pub fn new(stage: Stage, command: CommandSpec) -> Self {
        Self { stage, command }
    }

    /// Spawns a producer: the child's stdout is exposed as the returned reader.
    ///
    /// Cancelling `ctx.cancel` kills the child and reports success.
    pub fn spawn_reader(
        &self,
        ctx: &StageContext,
    ) -> Result<(PipeReader, CompletionSignal), PipelineError> {
        let mut child = self.spawn(Stdio::null(), Stdio::piped())?;
        let stdout = child.stdout.take().ok_or_else(|| self.missing_pipe("stdout"))?;
        let stderr = child.stderr.take();
        let (ours, theirs) = tokio::io::duplex(ctx.pipe_capacity.max(1));
        let (sender, signal) = CompletionSignal::channel(self.stage);

        let stage = self.stage;
        let program = self.command.program().to_string();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            let stderr_task = stderr.map(|stderr| forward_stderr(stage, stderr));
            let mut stdout = stdout;
            let mut ours = ours;

            let pumped = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                copied = tokio::io::copy(&mut stdout, &mut ours) => Some(copied),
            };
            let _ = ours.shutdown().await;
            drop(ours);

            let result = match pumped {
                Some(Ok(bytes)) => {
                    log::debug!("{} process produced {} bytes", stage, bytes);
                    wait_exit(&mut child, stage, &program).await
                }
                None => {
                    log::info!("{} process stopped on request", stage);
                    kill(&mut child, stage).await;
                    Ok(())
                }
                Some(Err(_)) if cancel.is_cancelled() => {
                    log::info!("{} process stopped on request", stage);
                    kill(&mut child, stage).await;
                    Ok(())
                }
                Some(Err(e)) => {
                    // Our reader vanished; the child will not exit by itself.
                    settle_after_pipe_error(&mut child, stage, &program, e, Duration::ZERO).await
                }
            };

            finish(stderr_task, sender, result).await;
        });

        Ok((Box::new(theirs), signal))
    }

    /// Spawns a consumer: bytes written to the returned writer reach the child's stdin.
    ///
    /// Closing the writer closes the child's stdin, which ends the stream.
    pub fn spawn_writer(
        &self,
        ctx: &StageContext,
    ) -> Result<(PipeWriter, CompletionSignal), PipelineError> {
        let mut child = self.spawn(Stdio::piped(), Stdio::null())?;
        let stdin = child.stdin.take().ok_or_else(|| self.missing_pipe("stdin"))?;
        let stderr = child.stderr.take();
        let (ours, theirs) = tokio::io::duplex(ctx.pipe_capacity.max(1));
        let (sender, signal) = CompletionSignal::channel(self.stage);

        let stage = self.stage;
        let program = self.command.program().to_string();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            let stderr_task = stderr.map(|stderr| forward_stderr(stage, stderr));
            let mut stdin = stdin;
            let mut ours: DuplexStream = ours;

            // After a stop request the bridge closes its end and the copy
            // finishes on its own; a child that stopped reading stalls it.
            let pumped = tokio::select! {
                copied = tokio::io::copy(&mut ours, &mut stdin) => Some(copied),
                _ = stalled_after_cancel(&cancel) => None,
            };
            let _ = stdin.shutdown().await;
            drop(stdin);
            drop(ours);

            let result = match pumped {
                Some(Ok(bytes)) => {
                    log::debug!("{} process consumed {} bytes", stage, bytes);
                    wait_exit(&mut child, stage, &program).await
                }
                Some(Err(e)) => {
                    settle_after_pipe_error(&mut child, stage, &program, e, EXIT_GRACE).await
                }
                None => {
                    log::warn!("{} process stopped reading input after stop request", stage);
                    match tokio::time::timeout(EXIT_GRACE, wait_exit(&mut child, stage, &program))
                        .await
                    {
                        Ok(exited) => exited,
                        Err(_) => {
                            kill(&mut child, stage).await;
                            Ok(())
                        }
                    }
                }
            };

            finish(stderr_task, sender, result).await;
        });

        Ok((Box::new(theirs), signal))
    }

    fn spawn(&self, stdin: Stdio, stdout: Stdio) -> Result<Child, PipelineError> {
        log::info!("starting {} process: {}", self.stage, self.command);
        self.command
            .command()
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::ProcessLaunch {
                stage: self.stage,
                program: self.command.program().to_string(),
                source,
            })
    }

    fn missing_pipe(&self, name: &str) -> PipelineError {
        PipelineError::ProcessLaunch {
            stage: self.stage,
            program: self.command.program().to_string(),
            source: std::io::Error::other(format!("child {} not captured", name)),
        }
    }
}

/// Resolves `EXIT_GRACE` after `cancel` fires.
async fn stalled_after_cancel(cancel: &CancellationToken) {
    cancel.cancelled().await;
    tokio::time::sleep(EXIT_GRACE).await;
}

async fn wait_exit(child: &mut Child, stage: Stage, program: &str) -> Result<(), PipelineError> {
    let status = child
        .wait()
        .await
        .map_err(|source| PipelineError::Io { stage, source })?;
    if status.success() {
        log::info!("{} process exited cleanly", stage);
        Ok(())
    } else {
        Err(PipelineError::ProcessRuntime {
            stage,
            program: program.to_string(),
            code: status.code(),
        })
    }
}

/// The pipe broke: prefer the child's own exit status as the cause if it
/// dies within `grace`, otherwise kill it and report the pipe error.
async fn settle_after_pipe_error(
    child: &mut Child,
    stage: Stage,
    program: &str,
    error: std::io::Error,
    grace: Duration,
) -> Result<(), PipelineError> {
    log::warn!("{} pipe failed: {}", stage, error);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) if !status.success() => Err(PipelineError::ProcessRuntime {
            stage,
            program: program.to_string(),
            code: status.code(),
        }),
        Ok(_) => Err(PipelineError::Io {
            stage,
            source: error,
        }),
        Err(_) => {
            kill(child, stage).await;
            Err(PipelineError::Io {
                stage,
                source: error,
            })
        }
    }
}

async fn kill(child: &mut Child, stage: Stage) {
    if let Err(e) = child.kill().await {
        log::warn!("{} process kill failed: {}", stage, e);
    }
}

async fn finish(
    stderr_task: Option<JoinHandle<()>>,
    sender: CompletionSender,
    result: Result<(), PipelineError>,
) {
    if let Some(task) = stderr_task {
        // A grandchild may still hold stderr open after the child is gone.
        if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
            log::trace!("{} stderr still open after exit", sender.stage());
        }
    }
    if let Err(e) = &result {
        log::error!("{} process failed: {}", sender.stage(), e);
    }
    sender.complete(result);
}

fn forward_stderr(stage: Stage, stderr: ChildStderr) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.trim().is_empty() => {
                    log::debug!("[{}] {}", stage, line.trim_end())
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    log::trace!("[{}] stderr closed: {}", stage, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "process_test.rs"]
mod process_test;
