//! Codex CLI backend: one `codex exec --json` process per turn.
//!
//! Conversation state lives in Codex's thread store. The first turn starts a
//! thread; later turns run `codex exec resume <thread_id>`. Model, reasoning
//! effort and sandbox level therefore apply from the next turn on without any
//! restart logic here.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::events::{self, CodexEvent};
use crate::backends::setup;
use crate::backends::types::{
    sealed, AdapterConfig, AgentConnection, AuthStatus, Backend, BackendCapabilities, BackendError,
    BackendKind, InstallStatus, ModelInfo, NativeAdapter, PermissionModel, ReasoningDepth,
    SessionSettings, Translated, Translating,
};
use crate::backends::utils::{abort_task, configure_command, spawn_line_reader, spawn_stderr_drain};
use crate::config::DEFAULT_PROBE_TIMEOUT;
use crate::turn::TurnContext;

pub struct CodexBackend {
    cli_path: Option<PathBuf>,
    probe_timeout: Duration,
}

impl CodexBackend {
    pub fn new(cli_path: Option<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            cli_path,
            probe_timeout,
        }
    }
}

impl Default for CodexBackend {
    fn default() -> Self {
        Self::new(None, DEFAULT_PROBE_TIMEOUT)
    }
}

impl sealed::Sealed for CodexBackend {}

#[async_trait]
impl Backend for CodexBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Codex
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            permission_model: PermissionModel::SessionLevel,
            supports_streaming: true,
            supports_abort: true,
            supports_resume: true,
            supports_extended_thinking: true,
            reasoning_levels: vec![ReasoningDepth::Low, ReasoningDepth::Medium, ReasoningDepth::High],
            available_models: vec![
                ModelInfo {
                    id: "gpt-5.3-codex".to_string(),
                    name: "GPT 5.3 Codex".to_string(),
                    supports_thinking: true,
                },
                ModelInfo {
                    id: "gpt-5.2-codex".to_string(),
                    name: "GPT 5.2 Codex".to_string(),
                    supports_thinking: true,
                },
                ModelInfo {
                    id: "gpt-5.2".to_string(),
                    name: "GPT 5.2".to_string(),
                    supports_thinking: true,
                },
            ],
        }
    }

    async fn check_installed(&self) -> Result<InstallStatus, BackendError> {
        Ok(setup::detect_install(BackendKind::Codex, self.cli_path.as_deref()).await)
    }

    async fn check_authenticated(&self) -> Result<AuthStatus, BackendError> {
        Ok(setup::check_codex_auth(self.cli_path.as_deref(), self.probe_timeout).await)
    }

    async fn start(&self, config: AdapterConfig) -> Result<Box<dyn AgentConnection>, BackendError> {
        let configured = config.cli_path.as_deref().or(self.cli_path.as_deref());
        let cli = setup::resolve_cli(BackendKind::Codex, configured).ok_or(BackendError::NotInstalled {
            backend: BackendKind::Codex,
        })?;
        Ok(Box::new(Translating(CodexAdapter::new(
            cli,
            config.folder,
            config.resume_token,
        ))))
    }
}

/// Arguments for one `codex exec` turn.
pub fn build_command(
    cli: &Path,
    folder: &Path,
    thread_id: Option<&str>,
    message: &str,
    settings: &SessionSettings,
) -> Command {
    let effort = settings.reasoning.unwrap_or(ReasoningDepth::High);
    let mut cmd = Command::new(cli);
    cmd.arg("exec");

    match thread_id {
        // `resume` takes neither -C nor -s, so the sandbox goes in as a config override.
        Some(thread_id) => {
            cmd.arg("resume").arg("--json").arg("--skip-git-repo-check");
            if !settings.model.is_empty() {
                cmd.arg("-m").arg(&settings.model);
            }
            cmd.arg("-c")
                .arg(format!(
                    "sandbox_mode=\"{}\"",
                    settings.permission_policy.sandbox_mode()
                ))
                .arg("-c")
                .arg(format!("model_reasoning_effort={}", effort.as_str()))
                .arg(thread_id)
                .arg(message);
        }
        None => {
            cmd.arg("--json")
                .arg("--skip-git-repo-check")
                .arg("-C")
                .arg(folder)
                .arg("-s")
                .arg(settings.permission_policy.sandbox_mode());
            if !settings.model.is_empty() {
                cmd.arg("-m").arg(&settings.model);
            }
            cmd.arg("-c")
                .arg(format!("model_reasoning_effort={}", effort.as_str()))
                .arg(message);
        }
    }

    cmd.current_dir(folder);
    configure_command(&mut cmd, false);
    cmd
}

struct TurnProcess {
    child: Child,
    events: mpsc::UnboundedReceiver<Result<CodexEvent, BackendError>>,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<()>>,
}

impl TurnProcess {
    async fn shutdown(mut self) {
        if let Err(e) = self.child.kill().await {
            log::debug!("codex process already gone: {e}");
        }
        abort_task(self.reader.take()).await;
        abort_task(self.stderr.take()).await;
    }
}

pub struct CodexAdapter {
    cli: PathBuf,
    folder: PathBuf,
    thread_id: Option<String>,
    turn: Option<TurnProcess>,
}

impl sealed::Sealed for CodexAdapter {}

impl CodexAdapter {
    pub fn new(cli: PathBuf, folder: PathBuf, resume_token: Option<String>) -> Self {
        Self {
            cli,
            folder,
            thread_id: resume_token,
            turn: None,
        }
    }

    async fn end_turn_process(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.shutdown().await;
        }
    }
}

fn spawn_failed(message: impl Into<String>) -> BackendError {
    BackendError::SpawnFailed {
        backend: BackendKind::Codex,
        message: message.into(),
    }
}

#[async_trait]
impl NativeAdapter for CodexAdapter {
    type Native = CodexEvent;

    async fn send(&mut self, message: &str, settings: &SessionSettings) -> Result<(), BackendError> {
        self.end_turn_process().await;

        let mut cmd = build_command(&self.cli, &self.folder, self.thread_id.as_deref(), message, settings);
        match &self.thread_id {
            Some(thread_id) => log::info!("resuming codex thread {thread_id} (model={})", settings.model),
            None => log::info!(
                "starting codex thread in {} (sandbox={}, model={})",
                self.folder.display(),
                settings.permission_policy.sandbox_mode(),
                settings.model
            ),
        }

        let mut child = cmd.spawn().map_err(|e| spawn_failed(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_failed("failed to capture codex stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_failed("failed to capture codex stderr"))?;

        let (events, reader) = spawn_line_reader(stdout, "codex");
        self.turn = Some(TurnProcess {
            child,
            events,
            reader: Some(reader),
            stderr: Some(spawn_stderr_drain(stderr, "codex")),
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<CodexEvent>, BackendError> {
        let Some(turn) = self.turn.as_mut() else {
            return Ok(None);
        };
        match turn.events.recv().await {
            Some(Ok(event)) => {
                if let CodexEvent::ThreadStarted { thread_id } = &event {
                    log::debug!("codex thread id: {thread_id}");
                    self.thread_id = Some(thread_id.clone());
                }
                Ok(Some(event))
            }
            Some(Err(e)) => Err(e),
            None => {
                self.turn = None;
                Ok(None)
            }
        }
    }

    /// Codex has no in-band interrupt. Killing the process closes stdout,
    /// which ends the stream.
    async fn interrupt(&mut self) -> Result<(), BackendError> {
        if let Some(turn) = self.turn.as_mut() {
            turn.child
                .start_kill()
                .map_err(|e| BackendError::Io(format!("failed to kill codex process: {e}")))?;
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.end_turn_process().await;
    }

    fn resume_token(&self) -> Option<String> {
        self.thread_id.clone()
    }

    fn translate(native: CodexEvent, ctx: &mut TurnContext) -> Vec<Translated> {
        events::translate(native, ctx)
    }
}
