//! Process-backed interpreter client.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::worker::protocol::{ExecResult, InitParams, WorkerRequest, WorkerResponse};
use crate::worker::Interpreter;

/// How long `close` waits for the worker to acknowledge before the child is
/// signaled regardless.
const CLOSE_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

struct WorkerIo {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Set once the child has been observed dead; short-circuits every
    /// later request with the same exit information.
    exited: Option<(Option<i32>, Option<i32>)>,
}

/// Client for the interpreter subprocess.
///
/// All requests flow through a single queue: the i/o pair lives behind a
/// `tokio::sync::Mutex`, whose FIFO waiter queue gives each caller an
/// exclusive write-request/read-response round trip in arrival order. The
/// protocol carries no request ids, so this ordering is what correlates
/// responses to requests.
pub struct WorkerClient {
    io: Mutex<WorkerIo>,
    command: String,
}

impl std::fmt::Debug for WorkerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerClient")
            .field("command", &self.command)
            .finish()
    }
}

impl WorkerClient {
    /// Launch the interpreter from an operator-configured argv.
    pub async fn spawn(command: &[String]) -> Result<Self, WorkerError> {
        let cmd_display = command.join(" ");
        let (program, args) = command.split_first().ok_or_else(|| WorkerError::Spawn {
            command: cmd_display.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "interpreter command is empty",
            ),
        })?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                command: cmd_display.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Spawn {
            command: cmd_display.clone(),
            source: std::io::Error::other("failed to capture worker stdin"),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Spawn {
            command: cmd_display.clone(),
            source: std::io::Error::other("failed to capture worker stdout"),
        })?;

        // Forward stderr lines to tracing for operator diagnosis. They do
        // not gate requests.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "rlm_harness::worker", "worker stderr: {line}");
                }
            });
        }

        debug!("worker spawned: {cmd_display}");
        Ok(Self {
            io: Mutex::new(WorkerIo {
                child,
                stdin,
                stdout: BufReader::new(stdout),
                exited: None,
            }),
            command: cmd_display,
        })
    }

    /// One write-request/read-response round trip.
    async fn request(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let mut io = self.io.lock().await;

        if let Some((code, signal)) = io.exited {
            return Err(WorkerError::Exited { code, signal });
        }

        let mut line = serde_json::to_vec(request)
            .map_err(|e| WorkerError::Protocol(format!("failed to encode request: {e}")))?;
        line.push(b'\n');

        if let Err(err) = write_request(&mut io.stdin, &line).await {
            // A write failure usually means the child is gone; confirm and
            // record the exit so queued callers fail consistently.
            let exit = wait_for_exit(&mut io.child).await;
            io.exited = Some(exit);
            warn!("worker `{}` write failed: {err}", self.command);
            return Err(WorkerError::Exited {
                code: exit.0,
                signal: exit.1,
            });
        }

        let mut response_line = String::new();
        let read = io.stdout.read_line(&mut response_line).await?;
        if read == 0 {
            let exit = wait_for_exit(&mut io.child).await;
            io.exited = Some(exit);
            warn!("worker `{}` exited unexpectedly: {exit:?}", self.command);
            return Err(WorkerError::Exited {
                code: exit.0,
                signal: exit.1,
            });
        }

        // A parse failure fails this request only: the line is consumed and
        // the queue head moves on.
        WorkerResponse::decode(&response_line)
    }
}

async fn write_request(stdin: &mut ChildStdin, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

async fn wait_for_exit(child: &mut Child) -> (Option<i32>, Option<i32>) {
    match child.wait().await {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(_) => (None, None),
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[async_trait]
impl Interpreter for WorkerClient {
    async fn init(&self, params: InitParams) -> Result<(), WorkerError> {
        self.request(&WorkerRequest::from(params)).await.map(|_| ())
    }

    async fn exec(&self, code: &str) -> Result<ExecResult, WorkerError> {
        self.request(&WorkerRequest::Exec {
            code: code.to_string(),
        })
        .await?
        .into_exec_result()
    }

    async fn final_var(&self, name: &str) -> Result<String, WorkerError> {
        self.request(&WorkerRequest::FinalVar {
            name: name.to_string(),
        })
        .await?
        .into_value()
    }

    async fn show_vars(&self) -> Result<String, WorkerError> {
        self.request(&WorkerRequest::ShowVars).await?.into_value()
    }

    async fn close(&self) {
        // Best-effort graceful shutdown: ask the worker to stop, give it a
        // short grace period, then signal the child either way.
        let _ =
            tokio::time::timeout(CLOSE_GRACE, self.request(&WorkerRequest::Close)).await;

        let mut io = self.io.lock().await;
        if io.exited.is_none() {
            let _ = io.child.start_kill();
            let exit = wait_for_exit(&mut io.child).await;
            io.exited = Some(exit);
        }
        debug!("worker `{}` closed", self.command);
    }
}
