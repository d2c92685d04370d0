//! Shared utilities used by multiple backend adapters.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::BackendError;

/// Windows constant to hide console windows when spawning CLI subprocesses.
#[cfg(target_os = "windows")]
pub const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Piped stdio, killed with its handle, no console window on Windows.
pub fn configure_command(cmd: &mut Command, pipe_stdin: bool) {
    cmd.stdin(if pipe_stdin { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }
}

/// Abort a background task and wait for it to finish unwinding.
pub async fn abort_task(handle: Option<JoinHandle<()>>) {
    if let Some(handle) = handle {
        handle.abort();
        let _ = handle.await;
    }
}

/// Spawn a tokio task that drains stderr line-by-line, logging non-empty lines.
///
/// Prevents deadlock when the child process writes to stderr faster than we consume it.
pub fn spawn_stderr_drain<R>(stderr: R, label: &'static str) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Some(line) = lines.next_line().await.unwrap_or(None) {
            if !line.trim().is_empty() {
                log::debug!("[{label} stderr] {}", line.trim());
            }
        }
    })
}

/// Serialize `value` as one line of JSON and flush it.
pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), BackendError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut line = serde_json::to_string(value)
        .map_err(|e| BackendError::Protocol(format!("failed to serialize message: {e}")))?;
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| BackendError::Io(format!("failed to write to CLI stdin: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| BackendError::Io(format!("failed to flush CLI stdin: {e}")))
}

/// Parse one stdout line. Blank lines yield `None`.
pub fn parse_json_line<T: DeserializeOwned>(line: &str) -> Option<Result<T, BackendError>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).map_err(|e| {
        BackendError::MalformedNativeRecord(format!("{e}: {}", truncate(trimmed, 200)))
    }))
}

/// Reads newline-delimited JSON into a channel until EOF.
///
/// The channel closing is the end-of-stream signal; reading from it is cancel-safe.
pub fn spawn_line_reader<R, T>(
    stdout: R,
    label: &'static str,
) -> (mpsc::UnboundedReceiver<Result<T, BackendError>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
    T: DeserializeOwned + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(parsed) = parse_json_line::<T>(&line) {
                        if tx.send(parsed).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("[{label}] error reading stdout: {e}");
                    let _ = tx.send(Err(BackendError::Io(format!("stdout read failed: {e}"))));
                    break;
                }
            }
        }
        log::debug!("[{label}] stdout closed");
    });
    (rx, handle)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
