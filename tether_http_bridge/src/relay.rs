//! Subprocess supervision and request/response correlation.
//!
//! A [`Relay`] owns one long-lived subprocess speaking newline-delimited
//! JSON-RPC over stdio. Concurrent callers hand it messages via
//! [`Relay::send`]; messages carrying an `id` register a pending entry and
//! suspend until the matching response frame arrives, the per-request
//! timeout elapses, or the subprocess exits. Notifications (no `id`) are
//! written and complete immediately.
//!
//! A single I/O task owns the child: it serializes stdin writes so frames
//! from concurrent sends never interleave, pumps stdout chunks through a
//! [`ReadBuffer`], and forwards stderr lines to the logging sink. When
//! stdout closes, the child is reaped and every pending entry fails with
//! [`BridgeError::ProcessExited`].

use std::{
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, Result};
use crate::frame::ReadBuffer;

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

const WRITE_QUEUE_CAPACITY: usize = 100;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Per-request timeout in seconds for bridge → subprocess calls.
/// Reads `TETHER_REQUEST_TIMEOUT_SECS`, defaulting to 15 seconds.
pub fn request_timeout_secs() -> u64 {
    std::env::var("TETHER_REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
}

/// Spawn parameters for the supervised subprocess.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Executable path or name.
    pub command: String,
    /// Ordered argument list.
    pub args: Vec<String>,
    /// Environment overlay merged over the inherited environment.
    /// The overlay wins on key collision.
    pub env: Vec<(String, String)>,
    /// Default timeout for messages that expect a response.
    pub request_timeout: Duration,
}

/// Terminal outcome delivered through a pending entry's continuation.
#[derive(Debug)]
enum RelayOutcome {
    /// A response frame bearing the matching identifier arrived.
    Response(Value),
    /// The subprocess exited before a response arrived.
    ProcessExited,
}

type PendingMap = Arc<DashMap<String, oneshot::Sender<RelayOutcome>>>;

/// Supervises the subprocess and correlates requests with responses.
pub struct Relay {
    sender: mpsc::Sender<String>,
    pending: PendingMap,
    exited: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl Relay {
    /// Spawn the subprocess and the I/O task that owns it.
    pub fn spawn(config: RelayConfig) -> Result<Self> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Spawn(format!("{}: {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("subprocess stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("subprocess stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        info!(command = %config.command, args = ?config.args, "Spawned subprocess");

        let (tx, rx) = mpsc::channel::<String>(WRITE_QUEUE_CAPACITY);
        let pending: PendingMap = Arc::new(DashMap::new());
        let exited = Arc::new(AtomicBool::new(false));

        tokio::spawn(Self::run_io(
            child,
            stdin,
            stdout,
            stderr,
            rx,
            pending.clone(),
            exited.clone(),
        ));

        Ok(Self {
            sender: tx,
            pending,
            exited,
            request_timeout: config.request_timeout,
        })
    }

    /// True once the subprocess has exited and its pending entries failed.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Send one message with the relay's configured timeout.
    pub async fn send(&self, message: &Value) -> Result<Option<Value>> {
        self.send_with_timeout(message, self.request_timeout).await
    }

    /// Send one message with an explicit timeout.
    ///
    /// A message carrying an `id` resolves with `Some(response)` when the
    /// matching response frame arrives, or fails with
    /// [`BridgeError::Timeout`] / [`BridgeError::ProcessExited`]. A
    /// notification (no `id`) is queued for writing and completes
    /// immediately with `None` — there is no response to wait for.
    pub async fn send_with_timeout(
        &self,
        message: &Value,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        if self.has_exited() {
            return Err(BridgeError::ProcessExited);
        }

        let registered = match correlation_key(message) {
            Some(key) => {
                let (tx, rx) = oneshot::channel();
                match self.pending.entry(key.clone()) {
                    Entry::Occupied(_) => return Err(BridgeError::DuplicateId(key)),
                    Entry::Vacant(slot) => {
                        slot.insert(tx);
                    }
                }
                // The exit fan-out may have drained the registry between
                // the check above and this insert; an entry registered
                // after the drain would hang until its timeout.
                if self.has_exited() {
                    self.pending.remove(&key);
                    return Err(BridgeError::ProcessExited);
                }
                Some((key, rx))
            }
            None => None,
        };

        let frame = serde_json::to_string(message)?;
        if self.sender.send(frame).await.is_err() {
            if let Some((key, _)) = &registered {
                self.pending.remove(key);
            }
            return Err(BridgeError::NotWritable);
        }

        let Some((key, mut rx)) = registered else {
            return Ok(None);
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(RelayOutcome::Response(response))) => Ok(Some(response)),
            Ok(Ok(RelayOutcome::ProcessExited)) => Err(BridgeError::ProcessExited),
            Ok(Err(_)) => Err(BridgeError::ProcessExited),
            Err(_) => {
                // Removing the entry is the single point of resolution
                // ownership: if it is already gone, a response or the exit
                // fan-out won the race and the outcome is in the channel.
                if self.pending.remove(&key).is_some() {
                    Err(BridgeError::Timeout(timeout))
                } else {
                    match rx.await {
                        Ok(RelayOutcome::Response(response)) => Ok(Some(response)),
                        Ok(RelayOutcome::ProcessExited) | Err(_) => {
                            Err(BridgeError::ProcessExited)
                        }
                    }
                }
            }
        }
    }

    /// I/O task owning the child process.
    ///
    /// Writes are drained from the queue one complete frame at a time, so
    /// concurrent `send` calls never interleave partial frames on stdin.
    async fn run_io(
        mut child: Child,
        mut stdin: ChildStdin,
        mut stdout: ChildStdout,
        stderr: Option<ChildStderr>,
        mut rx: mpsc::Receiver<String>,
        pending: PendingMap,
        exited: Arc<AtomicBool>,
    ) {
        let mut buffer = ReadBuffer::new();
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut stderr_lines = stderr.map(|s| BufReader::new(s).lines());

        loop {
            tokio::select! {
                queued = rx.recv() => {
                    let Some(frame) = queued else {
                        // The relay handle was dropped; take the child down
                        // with it.
                        let _ = child.start_kill();
                        break;
                    };
                    debug!("sending to subprocess: {}", frame);
                    if let Err(e) = write_frame(&mut stdin, &frame).await {
                        error!("failed to write to subprocess stdin: {}", e);
                        break;
                    }
                }

                read = stdout.read(&mut chunk) => {
                    match read {
                        Ok(0) => {
                            warn!("subprocess stdout closed");
                            break;
                        }
                        Ok(n) => {
                            buffer.append(&chunk[..n]);
                            loop {
                                match buffer.read_message() {
                                    Ok(Some(message)) => {
                                        debug!("received from subprocess: {}", message);
                                        resolve_inbound(&pending, message);
                                    }
                                    Ok(None) => break,
                                    Err(e) => warn!("skipping malformed frame: {}", e),
                                }
                            }
                        }
                        Err(e) => {
                            error!("failed to read subprocess stdout: {}", e);
                            break;
                        }
                    }
                }

                line = next_stderr_line(&mut stderr_lines) => {
                    match line {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                info!("subprocess: {}", line);
                            }
                        }
                        Ok(None) => {
                            // stderr EOF alone is not an exit signal;
                            // stdout EOF is.
                            stderr_lines = None;
                        }
                        Err(e) => {
                            warn!("failed to read subprocess stderr: {}", e);
                            stderr_lines = None;
                        }
                    }
                }
            }
        }

        // Reap the child so the exit status is observed before pending
        // entries are failed.
        match child.wait().await {
            Ok(status) => info!(code = ?status.code(), "subprocess exited"),
            Err(e) => error!("failed to wait on subprocess: {}", e),
        }

        fail_all_pending(&pending, &exited);
    }
}

async fn write_frame(stdin: &mut ChildStdin, frame: &str) -> std::io::Result<()> {
    stdin.write_all(frame.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

type StderrLines = tokio::io::Lines<BufReader<ChildStderr>>;

async fn next_stderr_line(lines: &mut Option<StderrLines>) -> std::io::Result<Option<String>> {
    match lines.as_mut() {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Canonical registry key for a message's correlation identifier.
///
/// Returns `None` for notifications (no `id`, or `id: null`). The key is
/// the identifier's JSON text, so the string `"1"` and the number `1`
/// remain distinct.
fn correlation_key(message: &Value) -> Option<String> {
    match message.get("id") {
        None | Some(Value::Null) => None,
        Some(id) => Some(id.to_string()),
    }
}

/// Route one decoded subprocess message to its pending entry, if any.
///
/// Messages with no matching entry — unsolicited notifications, late or
/// duplicate responses — are discarded.
fn resolve_inbound(pending: &DashMap<String, oneshot::Sender<RelayOutcome>>, message: Value) {
    let Some(key) = correlation_key(&message) else {
        debug!("discarding subprocess message without id");
        return;
    };
    match pending.remove(&key) {
        Some((_, tx)) => {
            // A closed receiver means the caller already settled on its
            // side; the response is simply late.
            let _ = tx.send(RelayOutcome::Response(message));
        }
        None => debug!(id = %key, "discarding message with no pending request"),
    }
}

/// Fail every pending entry with `ProcessExited` and clear the registry.
///
/// The atomic swap makes this run at most once per process lifetime; a
/// second call is a no-op even when the registry is already empty.
fn fail_all_pending(pending: &DashMap<String, oneshot::Sender<RelayOutcome>>, exited: &AtomicBool) {
    if exited.swap(true, Ordering::SeqCst) {
        return;
    }

    let keys: Vec<String> = pending.iter().map(|entry| entry.key().clone()).collect();
    if !keys.is_empty() {
        warn!(
            pending = keys.len(),
            "subprocess exited with requests outstanding"
        );
    }
    for key in keys {
        if let Some((_, tx)) = pending.remove(&key) {
            let _ = tx.send(RelayOutcome::ProcessExited);
        }
    }
}
