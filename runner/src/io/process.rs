//! Child process launcher and stream pump.
//!
//! Two reader threads drain stdout and stderr as data arrives and forward
//! chunks over a channel. The calling thread is the single owner of the
//! accumulated output: it applies chunks in arrival order, consults the
//! [`StreamObserver`] after every stdout chunk, and races the deadline and the
//! cancel flag against process exit. Whichever fires first wins; the child is
//! killed and reaped on every path that does not end in a natural exit.

use std::io::{ErrorKind, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, trace, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelHandle;

/// Upper bound on how long the pump blocks without re-checking the deadline
/// and the cancel flag.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long readers may keep delivering buffered output after the child is
/// gone. Readers still running afterwards are detached.
const READER_GRACE: Duration = Duration::from_millis(250);

const READ_CHUNK_BYTES: usize = 8192;

/// Receives stdout chunks in arrival order while the child runs.
pub trait StreamObserver {
    /// Returning `Some(reason)` kills the child and ends the run as
    /// [`Termination::Stopped`].
    fn on_stdout(&mut self, chunk: &[u8]) -> Option<String>;
}

/// Why the pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited(ExitStatus),
    /// The observer asked to stop; carries its reason.
    Stopped(String),
    TimedOut,
    Cancelled,
}

/// Everything captured from one child run.
#[derive(Debug)]
pub struct StreamedOutput {
    pub termination: Termination,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub elapsed: Duration,
}

impl StreamedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Limits applied to one run.
#[derive(Debug, Clone)]
pub struct PumpLimits<'a> {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: Option<&'a CancelHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Stdout,
    Stderr,
}

enum Pumped {
    Chunk(Channel, Vec<u8>),
    Closed(Channel),
    Failed(Channel, std::io::Error),
}

/// Bytes beyond `limit` are counted and discarded.
#[derive(Debug)]
struct LimitedBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: usize,
}

impl LimitedBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = self.limit.saturating_sub(self.data.len());
        let keep = chunk.len().min(remaining);
        self.data.extend_from_slice(&chunk[..keep]);
        self.truncated += chunk.len() - keep;
    }
}

struct Pump {
    rx: Receiver<Pumped>,
    readers: Vec<JoinHandle<()>>,
    stdout: LimitedBuffer,
    stderr: LimitedBuffer,
    open: usize,
}

impl Pump {
    fn apply(&mut self, message: Pumped) -> Option<(Channel, Vec<u8>)> {
        match message {
            Pumped::Chunk(Channel::Stdout, data) => {
                self.stdout.push(&data);
                Some((Channel::Stdout, data))
            }
            Pumped::Chunk(Channel::Stderr, data) => {
                self.stderr.push(&data);
                None
            }
            Pumped::Closed(channel) => {
                trace!(?channel, "stream closed");
                self.open = self.open.saturating_sub(1);
                None
            }
            Pumped::Failed(channel, err) => {
                warn!(?channel, err = %err, "stream read failed");
                self.open = self.open.saturating_sub(1);
                None
            }
        }
    }

    /// Collect whatever the readers still deliver within the grace period.
    /// Stdout chunks are only kept when `keep_stdout` is set.
    fn drain(&mut self, keep_stdout: bool) {
        let grace_deadline = Instant::now() + READER_GRACE;
        while self.open > 0 {
            let now = Instant::now();
            if now >= grace_deadline {
                break;
            }
            match self.rx.recv_timeout(grace_deadline - now) {
                Ok(Pumped::Chunk(Channel::Stdout, _)) if !keep_stdout => {}
                Ok(message) => {
                    self.apply(message);
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => self.open = 0,
            }
        }
    }

    fn release_readers(&mut self) {
        if self.open > 0 {
            warn!(
                open_streams = self.open,
                "output readers still running after grace period, detaching"
            );
            self.readers.clear();
            return;
        }
        for handle in self.readers.drain(..) {
            if handle.join().is_err() {
                warn!("output reader thread panicked");
            }
        }
    }
}

/// Spawn `cmd`, stream its output through `observer`, and return once it
/// exits, is stopped, times out, or is cancelled.
///
/// Errors are returned only for spawn or wait failures; the child is killed
/// before such an error leaves this function.
#[instrument(skip_all, fields(timeout_ms = limits.timeout.as_millis() as u64, output_limit_bytes = limits.output_limit_bytes))]
pub fn run_command_streaming(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    limits: PumpLimits<'_>,
    observer: &mut dyn StreamObserver,
) -> Result<StreamedOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let mut pump = match start_readers(&mut child, limits.output_limit_bytes) {
        Ok(pump) => pump,
        Err(err) => {
            kill_quietly(&mut child);
            return Err(err);
        }
    };

    // Readers are already draining, so a child that writes before reading
    // stdin cannot deadlock the writer.
    if let Some(input) = stdin {
        write_stdin(&mut child, input);
    }

    // A timeout too large to represent as an instant never fires.
    let deadline = started.checked_add(limits.timeout);
    let termination = match pump_until_done(&mut child, &mut pump, deadline, &limits, observer) {
        Ok(termination) => termination,
        Err(err) => {
            kill_quietly(&mut child);
            pump.drain(false);
            pump.release_readers();
            return Err(err);
        }
    };

    match &termination {
        Termination::Exited(_) => pump.drain(true),
        Termination::Stopped(reason) => {
            debug!(reason = %reason, "stop requested, killing");
            kill_quietly(&mut child);
            pump.drain(false);
        }
        Termination::TimedOut => {
            warn!(
                timeout_ms = limits.timeout.as_millis() as u64,
                "command timed out, killing"
            );
            kill_quietly(&mut child);
            pump.drain(true);
        }
        Termination::Cancelled => {
            warn!("command cancelled, killing");
            kill_quietly(&mut child);
            pump.drain(true);
        }
    }
    pump.release_readers();

    let elapsed = started.elapsed();
    if pump.stdout.truncated > 0 || pump.stderr.truncated > 0 {
        warn!(
            stdout_truncated = pump.stdout.truncated,
            stderr_truncated = pump.stderr.truncated,
            "output truncated"
        );
    }
    debug!(?termination, elapsed_ms = elapsed.as_millis() as u64, "command finished");

    Ok(StreamedOutput {
        termination,
        stdout: pump.stdout.data,
        stderr: pump.stderr.data,
        stdout_truncated: pump.stdout.truncated,
        stderr_truncated: pump.stderr.truncated,
        elapsed,
    })
}

fn start_readers(child: &mut Child, output_limit_bytes: usize) -> Result<Pump> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (tx, rx) = mpsc::channel();
    let stdout_tx = tx.clone();
    let readers = vec![
        thread::Builder::new()
            .name("agent-stdout".to_string())
            .spawn(move || forward_stream(stdout, Channel::Stdout, &stdout_tx))
            .context("spawn stdout reader")?,
        thread::Builder::new()
            .name("agent-stderr".to_string())
            .spawn(move || forward_stream(stderr, Channel::Stderr, &tx))
            .context("spawn stderr reader")?,
    ];

    Ok(Pump {
        rx,
        readers,
        stdout: LimitedBuffer::new(output_limit_bytes),
        stderr: LimitedBuffer::new(output_limit_bytes),
        open: 2,
    })
}

fn forward_stream<R: Read>(mut reader: R, channel: Channel, tx: &Sender<Pumped>) {
    let mut chunk = [0u8; READ_CHUNK_BYTES];
    loop {
        let message = match reader.read(&mut chunk) {
            Ok(0) => Pumped::Closed(channel),
            Ok(n) => Pumped::Chunk(channel, chunk[..n].to_vec()),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => Pumped::Failed(channel, err),
        };
        let last = !matches!(message, Pumped::Chunk(..));
        // A closed receiver means the pump has moved on; stop reading.
        if tx.send(message).is_err() || last {
            return;
        }
    }
}

fn write_stdin(child: &mut Child, input: Vec<u8>) {
    let Some(mut child_stdin) = child.stdin.take() else {
        warn!("stdin was not piped");
        return;
    };
    let spawned = thread::Builder::new()
        .name("agent-stdin".to_string())
        .spawn(move || {
            if let Err(err) = child_stdin.write_all(&input) {
                debug!(err = %err, "write stdin failed");
            }
            // Dropping the handle closes the pipe.
        });
    if let Err(err) = spawned {
        warn!(err = %err, "failed to spawn stdin writer");
    }
}

fn pump_until_done(
    child: &mut Child,
    pump: &mut Pump,
    deadline: Option<Instant>,
    limits: &PumpLimits<'_>,
    observer: &mut dyn StreamObserver,
) -> Result<Termination> {
    loop {
        if limits.cancel.is_some_and(CancelHandle::is_cancelled) {
            return Ok(Termination::Cancelled);
        }
        let now = Instant::now();
        let wait = match deadline {
            Some(deadline) if now >= deadline => return Ok(Termination::TimedOut),
            Some(deadline) => (deadline - now).min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        };

        if pump.open == 0 {
            // Output is complete; only the exit status is outstanding.
            if let Some(status) = child.wait_timeout(wait).context("wait for command")? {
                return Ok(Termination::Exited(status));
            }
            continue;
        }

        match pump.rx.recv_timeout(wait) {
            Ok(message) => {
                if let Some((Channel::Stdout, data)) = pump.apply(message)
                    && let Some(reason) = observer.on_stdout(&data)
                {
                    return Ok(Termination::Stopped(reason));
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // The child may have exited while something it spawned still
                // holds the pipes open.
                if let Some(status) = child.try_wait().context("poll command")? {
                    return finish_after_exit(pump, status, observer);
                }
            }
            Err(RecvTimeoutError::Disconnected) => pump.open = 0,
        }
    }
}

/// Apply output still queued after the child exited, so that a stop condition
/// matched by that output takes precedence over the exit status.
fn finish_after_exit(
    pump: &mut Pump,
    status: ExitStatus,
    observer: &mut dyn StreamObserver,
) -> Result<Termination> {
    let grace_deadline = Instant::now() + READER_GRACE;
    while pump.open > 0 {
        let now = Instant::now();
        if now >= grace_deadline {
            break;
        }
        match pump.rx.recv_timeout(grace_deadline - now) {
            Ok(message) => {
                if let Some((Channel::Stdout, data)) = pump.apply(message)
                    && let Some(reason) = observer.on_stdout(&data)
                {
                    return Ok(Termination::Stopped(reason));
                }
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => pump.open = 0,
        }
    }
    Ok(Termination::Exited(status))
}

/// Kill and reap the child. Safe to call on a child that already exited.
fn kill_quietly(child: &mut Child) {
    if let Err(err) = child.kill() {
        trace!(err = %err, "kill failed, child already exited");
    }
    if let Err(err) = child.wait() {
        warn!(err = %err, "failed to reap child");
    }
}
