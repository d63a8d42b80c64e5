// dbbackup/src/backup/validating_stream.rs
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep, timeout};
use tracing::debug;

use crate::errors::{BackupError, Result};

const DEFAULT_PROBE_DELAY: Duration = Duration::from_millis(100);
/// How long close() keeps listening to stderr after the process has exited.
const CAPTURE_GRACE: Duration = Duration::from_secs(2);

/// Per-stream behaviour threaded in from the application configuration.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Pause before inspecting stderr when the first read hits end-of-stream.
    pub probe_delay: Duration,
    /// Emit captured stderr as debug events when the stream is closed.
    pub log_diagnostics: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            probe_delay: DEFAULT_PROBE_DELAY,
            log_diagnostics: false,
        }
    }
}

enum ProbeState {
    /// No read has completed yet.
    Unvalidated,
    /// First read was empty; waiting for stderr to settle.
    Probing(Pin<Box<Sleep>>),
    /// Data has flowed, or the empty-stream probe found nothing wrong.
    Validated,
    Failed(String),
}

/// stdout of a running dump process, with its stderr captured on the side.
///
/// Reads are passed straight through to the pipe, so the OS pipe buffer is
/// the only thing between the child and whoever consumes this stream. The one
/// exception is the very first read: if it comes back empty the stream waits a
/// moment and checks stderr and the exit status before agreeing that the dump
/// really was empty.
pub struct ValidatingStream {
    program: String,
    signatures: &'static [&'static str],
    options: StreamOptions,
    child: Child,
    stdout: Option<ChildStdout>,
    diagnostics: Arc<Mutex<Vec<u8>>>,
    capture: Option<JoinHandle<()>>,
    state: ProbeState,
    closed: bool,
}

impl ValidatingStream {
    pub(crate) fn new(
        program: impl Into<String>,
        signatures: &'static [&'static str],
        options: StreamOptions,
        mut child: Child,
    ) -> Result<Self> {
        let program = program.into();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(BackupError::launch(program, "stdout and stderr must both be piped"));
        };

        let diagnostics = Arc::new(Mutex::new(Vec::new()));
        let capture = tokio::spawn(capture_diagnostics(stderr, Arc::clone(&diagnostics)));

        Ok(ValidatingStream {
            program,
            signatures,
            options,
            child,
            stdout: Some(stdout),
            diagnostics,
            capture: Some(capture),
            state: ProbeState::Unvalidated,
            closed: false,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// True once at least one byte has been delivered.
    pub fn is_validated(&self) -> bool {
        matches!(self.state, ProbeState::Validated)
    }

    fn diagnostics_text(&self) -> String {
        let buffer = self.diagnostics.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).trim().to_string()
    }

    /// Decides whether an immediately-empty stream was a failed dump.
    fn finish_probe(&mut self) -> io::Result<()> {
        let diagnostics = self.diagnostics_text();
        let signature_hit = self.signatures.iter().any(|sig| diagnostics.contains(sig));
        let failed_status = self
            .child
            .try_wait()
            .ok()
            .flatten()
            .filter(|status| !status.success());

        let detail = if signature_hit {
            diagnostics
        } else if let Some(status) = failed_status {
            if diagnostics.is_empty() {
                match status.code() {
                    Some(code) => format!("exit code {code}"),
                    None => status.to_string(),
                }
            } else {
                diagnostics
            }
        } else {
            // Genuinely empty output; the exit status is still checked by close().
            self.state = ProbeState::Validated;
            return Ok(());
        };

        self.state = ProbeState::Failed(detail.clone());
        Err(BackupError::dump_failed(self.program.clone(), detail).into_io())
    }

    /// Releases stdout, reaps the process and reports a non-zero exit.
    ///
    /// Whatever is left unread in the pipe is abandoned: dropping our end makes
    /// a still-writing child fail with EPIPE instead of blocking forever.
    /// Calling this again after it has completed is a no-op. If the future is
    /// dropped while waiting on the process, the stream stays open and
    /// [`abort`](Self::abort) still kills the child.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        drop(self.stdout.take());

        let waited = self.child.wait().await;
        self.closed = true;
        let status = waited.map_err(|e| {
            BackupError::dump_failed(self.program.clone(), format!("waiting for process: {e}"))
        })?;

        if let Some(mut capture) = self.capture.take() {
            if timeout(CAPTURE_GRACE, &mut capture).await.is_err() {
                capture.abort();
            }
        }

        let diagnostics = self.diagnostics_text();
        if self.options.log_diagnostics && !diagnostics.is_empty() {
            debug!(program = %self.program, %status, stderr = %diagnostics, "dump process diagnostics");
        }

        if status.success() {
            return Ok(());
        }

        let detail = if diagnostics.is_empty() {
            status.to_string()
        } else {
            format!("{status}\nOutput: {diagnostics}")
        };
        Err(BackupError::dump_failed(self.program.clone(), detail))
    }

    /// Kills the process and then closes the stream.
    pub async fn abort(&mut self) -> Result<()> {
        if !self.closed {
            if let Err(e) = self.child.start_kill() {
                debug!(program = %self.program, error = %e, "kill failed, process already gone");
            }
        }
        self.close().await
    }
}

impl Drop for ValidatingStream {
    fn drop(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.abort();
        }
    }
}

fn poll_pipe(
    stdout: &mut Option<ChildStdout>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>> {
    match stdout {
        Some(pipe) => Pin::new(pipe).poll_read(cx, buf),
        None => Poll::Ready(Ok(())),
    }
}

impl AsyncRead for ValidatingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ProbeState::Validated => return poll_pipe(&mut this.stdout, cx, buf),
                ProbeState::Failed(detail) => {
                    let err = BackupError::dump_failed(this.program.clone(), detail.clone());
                    return Poll::Ready(Err(err.into_io()));
                }
                ProbeState::Probing(delay) => {
                    ready!(delay.as_mut().poll(cx));
                    return Poll::Ready(this.finish_probe());
                }
                ProbeState::Unvalidated => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let before = buf.filled().len();
                    ready!(poll_pipe(&mut this.stdout, cx, buf))?;
                    if buf.filled().len() > before {
                        this.state = ProbeState::Validated;
                        return Poll::Ready(Ok(()));
                    }
                    this.state = ProbeState::Probing(Box::pin(sleep(this.options.probe_delay)));
                }
            }
        }
    }
}

async fn capture_diagnostics(mut stderr: ChildStderr, buffer: Arc<Mutex<Vec<u8>>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(&chunk[..n]),
        }
    }
}
