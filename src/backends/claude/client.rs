//! One running `claude` process speaking stream-json over stdio.
//!
//! A reader task owns stdout. It parses records, acknowledges hook callbacks
//! nobody needs to decide on, and forwards everything else to an unbounded
//! channel so that [`ClaudeProcess::recv`] is cancel-safe.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::cli_protocol::{self, CliEvent, OutgoingControlResponse};
use crate::backends::types::{BackendError, BackendKind, ReasoningDepth};
use crate::backends::utils::{
    abort_task, configure_command, parse_json_line, spawn_stderr_drain, write_json_line,
};

/// Settings baked into a process at spawn time. A change forces a respawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnKey {
    pub model: String,
    pub reasoning: Option<ReasoningDepth>,
    pub skip_permissions: bool,
}

pub fn build_command(cli: &Path, folder: &Path, key: &SpawnKey, resume: Option<&str>) -> Command {
    let mut cmd = Command::new(cli);
    cmd.arg("-p")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--input-format")
        .arg("stream-json")
        .arg("--model")
        .arg(&key.model);

    if let Some(depth) = key.reasoning {
        cmd.arg("--effort").arg(depth.as_str());
    }
    // Only bypass mode skips the CLI's own checks; other policies are enforced
    // through the PreToolUse hook.
    if key.skip_permissions {
        cmd.arg("--dangerously-skip-permissions");
    }
    if let Some(session_id) = resume {
        cmd.arg("--resume").arg(session_id);
    }

    cmd.current_dir(folder);
    configure_command(&mut cmd, true);
    cmd
}

pub struct ClaudeProcess {
    child: Child,
    stdin: Arc<Mutex<ChildStdin>>,
    events: mpsc::UnboundedReceiver<Result<CliEvent, BackendError>>,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
    key: SpawnKey,
}

fn spawn_failed(message: impl Into<String>) -> BackendError {
    BackendError::SpawnFailed {
        backend: BackendKind::Claude,
        message: message.into(),
    }
}

impl ClaudeProcess {
    /// Spawns the CLI and registers our hooks. The first user message is the
    /// caller's job.
    pub async fn spawn(
        cli: &Path,
        folder: &Path,
        key: SpawnKey,
        resume: Option<&str>,
    ) -> Result<Self, BackendError> {
        let mut cmd = build_command(cli, folder, &key, resume);
        log::info!(
            "spawning claude CLI (model={}, resume={})",
            key.model,
            resume.unwrap_or("-")
        );
        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_failed("failed to capture CLI stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("failed to capture CLI stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed("failed to capture CLI stderr"))?;

        let stdin = Arc::new(Mutex::new(stdin));
        let (tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_stdout(stdout, stdin.clone(), tx));

        let process = Self {
            child,
            stdin,
            events,
            reader: Some(reader),
            stderr: Some(spawn_stderr_drain(stderr, "claude")),
            key,
        };
        let init = cli_protocol::initialize_request(&format!("req_init_{}", Uuid::new_v4()));
        process.write(&init).await?;
        Ok(process)
    }

    pub fn key(&self) -> &SpawnKey {
        &self.key
    }

    pub async fn write<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), BackendError> {
        let mut stdin = self.stdin.lock().await;
        write_json_line(&mut *stdin, value).await
    }

    pub async fn send_user_message(&self, content: &str, session_id: Option<&str>) -> Result<(), BackendError> {
        self.write(&cli_protocol::user_message(content, session_id)).await
    }

    pub async fn interrupt(&self) -> Result<(), BackendError> {
        let request = cli_protocol::interrupt_request(&format!("req_int_{}", Uuid::new_v4()));
        self.write(&request).await
    }

    /// Next record from stdout; `None` once the process closed it.
    pub async fn recv(&mut self) -> Option<Result<CliEvent, BackendError>> {
        self.events.recv().await
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            log::debug!("claude CLI already gone: {e}");
        }
        abort_task(self.reader.take()).await;
        abort_task(self.stderr.take()).await;
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    stdin: Arc<Mutex<ChildStdin>>,
    tx: mpsc::UnboundedSender<Result<CliEvent, BackendError>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(BackendError::Io(format!("stdout read failed: {e}"))));
                break;
            }
        };
        let Some(parsed) = parse_json_line::<CliEvent>(&line) else {
            continue;
        };

        if let Ok(CliEvent::ControlRequest(request)) = &parsed {
            // Only PreToolUse needs a decision from the session.
            if !request.is_pretool_hook() {
                let response = match request.hook_event() {
                    Some("PostToolUse") => OutgoingControlResponse::ack_posttool(request.request_id.clone()),
                    _ => OutgoingControlResponse::ack(request.request_id.clone()),
                };
                let mut stdin = stdin.lock().await;
                if let Err(e) = write_json_line(&mut *stdin, &response).await {
                    log::warn!("failed to acknowledge claude control request: {e}");
                }
                continue;
            }
        }

        if tx.send(parsed).is_err() {
            break;
        }
    }
    log::debug!("[claude] stdout closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn command_carries_stream_json_and_model() {
        let key = SpawnKey {
            model: "sonnet".into(),
            reasoning: None,
            skip_permissions: false,
        };
        let cmd = build_command(Path::new("claude"), Path::new("/tmp"), &key, None);
        let args = args(&cmd);
        assert_eq!(
            args,
            [
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--input-format",
                "stream-json",
                "--model",
                "sonnet"
            ]
        );
        assert_eq!(cmd.as_std().get_current_dir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn command_applies_effort_bypass_and_resume() {
        let key = SpawnKey {
            model: "opus".into(),
            reasoning: Some(ReasoningDepth::High),
            skip_permissions: true,
        };
        let cmd = build_command(Path::new("claude"), Path::new("."), &key, Some("sess-1"));
        let args = args(&cmd);
        assert!(args.windows(2).any(|w| w == ["--effort", "high"]));
        assert!(args.contains(&"--dangerously-skip-permissions".to_string()));
        assert!(args.windows(2).any(|w| w == ["--resume", "sess-1"]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reader_acks_posttool_and_forwards_the_rest() {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        // Fake CLI: swallow the initialize line, emit a PostToolUse hook, wait
        // for its ack, then finish.
        let mut script = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            script,
            r#"#!/bin/sh
read init
echo '{{"type":"control_request","request_id":"r1","request":{{"subtype":"hook_callback","callback_id":"posttool_0","input":{{"hook_event_name":"PostToolUse","tool_name":"Read"}}}}}}'
read ack
echo '{{"type":"result","subtype":"success"}}'
"#
        )
        .unwrap();
        let path = script.into_temp_path();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let key = SpawnKey {
            model: "sonnet".into(),
            reasoning: None,
            skip_permissions: false,
        };
        let mut process = ClaudeProcess::spawn(&path, Path::new("."), key, None)
            .await
            .unwrap();

        // The hook never reaches us; the result does, which means the ack was written.
        let first = tokio::time::timeout(std::time::Duration::from_secs(5), process.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(first, CliEvent::Result(_)));
        process.shutdown().await;
    }
}
