//! Managed process - direct process spawning with stdio capture.
//!
//! Each spawned server gets:
//! - a reader task per output stream, merging stdout and stderr into one
//!   bounded console buffer and fanning every line out to subscribers
//! - an stdin writer task fed by a command channel
//! - a waiter task flipping a watch channel when the process exits

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};

/// Default maximum number of console lines kept per server.
pub const DEFAULT_CONSOLE_BUFFER: usize = 1000;

/// Capacity of the per-process line broadcast channel. A subscriber that
/// lags behind loses its oldest pending lines; the relay never blocks on it.
const BROADCAST_CAPACITY: usize = 1024;

// ─── Console Buffer ──────────────────────────────────────────

/// Ring buffer holding the most recent console lines in output order.
pub struct ConsoleBuffer {
    lines: VecDeque<String>,
    max_size: usize,
}

impl ConsoleBuffer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size),
            max_size,
        }
    }

    /// Append a line, evicting the oldest when the bound is exceeded.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    /// All buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<String> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// A server process spawned and owned by the supervisor.
///
/// Provides:
/// - stdin command injection via `send_command()`
/// - buffered console output via `recent_console()`
/// - gap-free replay-then-live streaming via `attach()`
/// - liveness via `is_running()` / `wait_for_exit()`
pub struct ManagedProcess {
    /// Channel to the stdin writer task; each command carries an ack channel
    /// reporting whether the write and flush actually succeeded.
    stdin_tx: mpsc::Sender<(String, oneshot::Sender<bool>)>,
    /// Console ring buffer shared with the reader tasks.
    buffer: Arc<Mutex<ConsoleBuffer>>,
    /// Broadcast channel for live console lines.
    line_tx: broadcast::Sender<String>,
    /// Process PID, used for signal escalation.
    pub pid: u32,
    /// Keeps the watch channel alive after the waiter task finishes.
    #[allow(dead_code)]
    running_tx: Arc<watch::Sender<bool>>,
    running_rx: watch::Receiver<bool>,
}

impl ManagedProcess {
    /// Spawn a new managed process with piped stdin and merged (stdout +
    /// stderr) console capture. The console buffer is supplied by the caller
    /// so its contents can outlive the process for late readers.
    pub async fn spawn(
        program: &str,
        args: &[String],
        working_dir: &Path,
        buffer: Arc<Mutex<ConsoleBuffer>>,
    ) -> Result<Self> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn process '{}': {}", program, e))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned process"))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<(String, oneshot::Sender<bool>)>(256);
        let (line_tx, _) = broadcast::channel::<String>(BROADCAST_CAPACITY);
        let (running_tx, running_rx) = watch::channel(true);

        let running_tx = Arc::new(running_tx);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        // ── stdout reader ────────────────────────────────────
        if let Some(stdout) = stdout {
            let buf = buffer.clone();
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stdout);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    relay_line(&buf, &tx, line).await;
                }
            });
        }

        // ── stderr reader (merged into the same buffer) ──────
        if let Some(stderr) = stderr {
            let buf = buffer.clone();
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    relay_line(&buf, &tx, line).await;
                }
            });
        }

        // ── stdin writer ─────────────────────────────────────
        if let Some(mut stdin_handle) = stdin {
            let mut rx = stdin_rx;
            tokio::spawn(async move {
                while let Some((cmd, ack)) = rx.recv().await {
                    let data = if cmd.ends_with('\n') {
                        cmd
                    } else {
                        format!("{}\n", cmd)
                    };
                    let ok = stdin_handle.write_all(data.as_bytes()).await.is_ok()
                        && stdin_handle.flush().await.is_ok();
                    let _ = ack.send(ok);
                    if !ok {
                        break;
                    }
                }
            });
        }

        // ── process waiter ───────────────────────────────────
        {
            let running = running_tx.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => tracing::info!("Process {} exited with {}", pid, status),
                    Err(e) => tracing::error!("Failed to wait for process {}: {}", pid, e),
                }
                let _ = running.send(false);
            });
        }

        Ok(Self {
            stdin_tx,
            buffer,
            line_tx,
            pid,
            running_tx,
            running_rx,
        })
    }

    /// Write a command line to the process's stdin and wait until the writer
    /// task reports whether the write and flush succeeded.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.stdin_tx
            .send((command.to_string(), ack_tx))
            .await
            .map_err(|e| anyhow::anyhow!("stdin channel closed: {}", e))?;
        match ack_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(anyhow::anyhow!("failed to write to process stdin")),
            Err(_) => Err(anyhow::anyhow!("stdin writer task stopped")),
        }
    }

    /// Snapshot-then-subscribe: the returned snapshot holds every line
    /// buffered so far and the receiver yields every later line, with no gap
    /// and no duplicate. Registration happens under the buffer lock, the
    /// same lock the relay appends under.
    pub async fn attach(&self) -> (Vec<String>, broadcast::Receiver<String>) {
        let buffer = self.buffer.lock().await;
        let rx = self.line_tx.subscribe();
        (buffer.snapshot(), rx)
    }

    /// The most recent `count` console lines.
    pub async fn recent_console(&self, count: usize) -> Vec<String> {
        self.buffer.lock().await.recent(count)
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        *self.running_rx.borrow()
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&self) {
        let mut rx = self.running_rx.clone();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Wait for exit with a deadline; returns whether the process exited.
    pub async fn wait_for_exit_timeout(&self, timeout: std::time::Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_exit())
            .await
            .is_ok()
    }
}

/// Append a line to the buffer and fan it out to subscribers. Both happen
/// under the buffer lock so `attach()` cannot miss or duplicate a line.
async fn relay_line(
    buffer: &Arc<Mutex<ConsoleBuffer>>,
    tx: &broadcast::Sender<String>,
    line: String,
) {
    let mut buf = buffer.lock().await;
    buf.push(line.clone());
    let _ = tx.send(line);
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_push_and_order() {
        let mut buffer = ConsoleBuffer::new(DEFAULT_CONSOLE_BUFFER);
        buffer.push("line 0".into());
        buffer.push("line 1".into());
        buffer.push("line 2".into());

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.snapshot(), vec!["line 0", "line 1", "line 2"]);
        assert_eq!(buffer.recent(2), vec!["line 1", "line 2"]);
        assert_eq!(buffer.recent(100).len(), 3);
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = ConsoleBuffer::new(1000);
        for i in 0..1100 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.len(), 1000);
        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.first().map(String::as_str), Some("line 100"));
        assert_eq!(snapshot.last().map(String::as_str), Some("line 1099"));
    }

    #[test]
    fn test_empty_buffer() {
        let buffer = ConsoleBuffer::new(10);
        assert!(buffer.is_empty());
        assert!(buffer.snapshot().is_empty());
        assert!(buffer.recent(5).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_captures_output() {
        let process = ManagedProcess::spawn(
            "echo",
            &["captured line".to_string()],
            Path::new("."),
            Arc::new(Mutex::new(ConsoleBuffer::new(DEFAULT_CONSOLE_BUFFER))),
        )
        .await
        .unwrap();

        process.wait_for_exit().await;
        // readers may still be draining the pipe just after exit
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(process.recent_console(10).await, vec!["captured line"]);
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdin_echo_roundtrip() {
        let process = ManagedProcess::spawn(
            "cat",
            &[],
            Path::new("."),
            Arc::new(Mutex::new(ConsoleBuffer::new(DEFAULT_CONSOLE_BUFFER))),
        )
        .await
        .unwrap();

        let (snapshot, mut rx) = process.attach().await;
        assert!(snapshot.is_empty());

        process.send_command("ping").await.unwrap();
        let line = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for echoed line")
            .unwrap();
        assert_eq!(line, "ping");

        crate::supervisor::process::force_kill_pid(process.pid).unwrap();
        assert!(
            process
                .wait_for_exit_timeout(std::time::Duration::from_secs(5))
                .await
        );
    }
}
