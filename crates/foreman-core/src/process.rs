use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ExecError;

const READ_CHUNK: usize = 4096;
/// Upper bound on waiting for the pipe readers after the child exited.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// What to launch and how to supervise it.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace: Duration,
    /// Trailing output window, in characters.
    pub output_window: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// Exit code, or `128 + signal` when the process died from a signal.
    pub exit_code: i32,
    /// Last `output_window` characters of interleaved stdout and stderr.
    pub output: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

/// Bounded trailing window over a character stream.
#[derive(Debug)]
pub struct OutputTail {
    buf: String,
    limit: usize,
}

impl OutputTail {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: String::new(),
            limit,
        }
    }

    pub fn push(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() <= self.limit {
            return;
        }
        let excess = self.buf.chars().count().saturating_sub(self.limit);
        if excess > 0 {
            let cut = self
                .buf
                .char_indices()
                .nth(excess)
                .map_or(self.buf.len(), |(idx, _)| idx);
            self.buf.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.buf)
    }
}

/// Last `n` characters of `text`.
pub fn tail_chars(text: &str, n: usize) -> &str {
    let len = text.chars().count();
    if len <= n {
        return text;
    }
    match text.char_indices().nth(len - n) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Decode a chunk, holding back an incomplete trailing UTF-8 sequence.
fn decode_chunk(pending: &mut Vec<u8>, chunk: &[u8]) -> String {
    pending.extend_from_slice(chunk);
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            out
        }
    }
}

fn push_tail(tail: &Mutex<OutputTail>, text: &str) {
    tail.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(text);
}

fn pump<R>(mut reader: R, tail: Arc<Mutex<OutputTail>>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_CHUNK];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let text = decode_chunk(&mut pending, &buf[..n]);
                    push_tail(&tail, &text);
                }
            }
        }
        if !pending.is_empty() {
            push_tail(&tail, &String::from_utf8_lossy(&pending));
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, sig: libc::c_int) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a negative pid
    // addresses the process group created at spawn.
    unsafe {
        libc::kill(-pid, sig);
    }
}

/// SIGTERM the process group, then SIGKILL it if still alive after `grace`.
async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    signal_group(pid, libc::SIGTERM);
    #[cfg(not(unix))]
    let _ = pid;
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "process ignored SIGTERM, killing"
            );
            #[cfg(unix)]
            signal_group(pid, libc::SIGKILL);
            let _ = child.start_kill();
            child.wait().await
        }
    }
}

/// Launch `spec` and supervise it to completion.
///
/// The child runs in its own process group so that termination reaches any
/// helpers it spawned. A timeout or cancellation terminates the group and
/// still yields an [`ExecOutcome`]; only a failed spawn or a failed wait is
/// an error.
pub async fn run(spec: &ProcessSpec, cancel: &CancellationToken) -> Result<ExecOutcome, ExecError> {
    let started = Instant::now();
    if cancel.is_cancelled() {
        return Ok(ExecOutcome {
            exit_code: -1,
            output: String::new(),
            timed_out: false,
            cancelled: true,
            duration: Duration::ZERO,
        });
    }

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("TERM", "dumb")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        command: spec.program.clone(),
        source,
    })?;
    let pid = child.id();
    info!(
        program = %spec.program,
        pid = ?pid,
        timeout_s = spec.timeout.as_secs(),
        "spawned build process"
    );

    let tail = Arc::new(Mutex::new(OutputTail::new(spec.output_window)));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(pump(stdout, Arc::clone(&tail)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(pump(stderr, Arc::clone(&tail)));
    }

    let deadline = tokio::time::sleep(spec.timeout);
    tokio::pin!(deadline);

    let (status, timed_out, cancelled) = tokio::select! {
        status = child.wait() => (status?, false, false),
        _ = &mut deadline => {
            warn!(pid = ?pid, timeout_s = spec.timeout.as_secs(), "build process timed out");
            (terminate(&mut child, pid, spec.kill_grace).await?, true, false)
        }
        _ = cancel.cancelled() => {
            info!(pid = ?pid, "build process cancelled");
            (terminate(&mut child, pid, spec.kill_grace).await?, false, true)
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
            reader.abort();
        }
    }

    let output = tail
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    let outcome = ExecOutcome {
        exit_code: exit_code(status),
        output,
        timed_out,
        cancelled,
        duration: started.elapsed(),
    };
    info!(
        exit_code = outcome.exit_code,
        timed_out,
        cancelled,
        duration_ms = outcome.duration.as_millis() as u64,
        output_len = outcome.output.len(),
        "build process finished"
    );
    Ok(outcome)
}
