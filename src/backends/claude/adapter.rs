//! Claude CLI backend: one long-lived `claude` process per session.
//!
//! The process is spawned lazily on the first `send` and reused across turns.
//! A model, reasoning or bypass change respawns it with `--resume` so the
//! conversation carries over.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;

use super::cli_protocol::{CliEvent, OutgoingControlResponse};
use super::client::{ClaudeProcess, SpawnKey};
use super::translate;
use crate::backends::setup;
use crate::backends::types::{
    sealed, AdapterConfig, AgentConnection, AuthStatus, Backend, BackendCapabilities, BackendError,
    BackendKind, InstallStatus, ModelInfo, NativeAdapter, PermissionModel, PermissionReply,
    ReasoningDepth, SessionSettings, Translated, Translating,
};
use crate::config::DEFAULT_PROBE_TIMEOUT;
use crate::permissions::PermissionPolicy;
use crate::turn::TurnContext;

/// Claude CLI backend implementation.
pub struct ClaudeBackend {
    cli_path: Option<PathBuf>,
    probe_timeout: Duration,
}

impl ClaudeBackend {
    pub fn new(cli_path: Option<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            cli_path,
            probe_timeout,
        }
    }
}

impl Default for ClaudeBackend {
    fn default() -> Self {
        Self::new(None, DEFAULT_PROBE_TIMEOUT)
    }
}

impl sealed::Sealed for ClaudeBackend {}

#[async_trait]
impl Backend for ClaudeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Claude
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            permission_model: PermissionModel::PerOperation,
            supports_streaming: true,
            supports_abort: true,
            supports_resume: true,
            supports_extended_thinking: true,
            reasoning_levels: vec![ReasoningDepth::Low, ReasoningDepth::Medium, ReasoningDepth::High],
            available_models: vec![
                ModelInfo {
                    id: "opus".to_string(),
                    name: "Claude Opus 4.6".to_string(),
                    supports_thinking: true,
                },
                ModelInfo {
                    id: "sonnet".to_string(),
                    name: "Claude Sonnet 4.5".to_string(),
                    supports_thinking: true,
                },
                ModelInfo {
                    id: "haiku".to_string(),
                    name: "Claude Haiku 4.5".to_string(),
                    supports_thinking: false,
                },
            ],
        }
    }

    async fn check_installed(&self) -> Result<InstallStatus, BackendError> {
        Ok(setup::detect_install(BackendKind::Claude, self.cli_path.as_deref()).await)
    }

    async fn check_authenticated(&self) -> Result<AuthStatus, BackendError> {
        Ok(setup::check_claude_auth(self.cli_path.as_deref(), self.probe_timeout).await)
    }

    async fn start(&self, config: AdapterConfig) -> Result<Box<dyn AgentConnection>, BackendError> {
        let configured = config.cli_path.as_deref().or(self.cli_path.as_deref());
        let cli = setup::resolve_cli(BackendKind::Claude, configured).ok_or(BackendError::NotInstalled {
            backend: BackendKind::Claude,
        })?;
        Ok(Box::new(Translating(ClaudeAdapter::new(
            cli,
            config.folder,
            config.resume_token,
        ))))
    }
}

pub struct ClaudeAdapter {
    cli: PathBuf,
    folder: PathBuf,
    process: Option<ClaudeProcess>,
    /// CLI session id from `system/init`, used for `--resume`.
    cli_session_id: Option<String>,
}

impl sealed::Sealed for ClaudeAdapter {}

impl ClaudeAdapter {
    pub fn new(cli: PathBuf, folder: PathBuf, resume_token: Option<String>) -> Self {
        Self {
            cli,
            folder,
            process: None,
            cli_session_id: resume_token,
        }
    }

    fn spawn_key(settings: &SessionSettings) -> SpawnKey {
        SpawnKey {
            model: settings.model.clone(),
            reasoning: settings.reasoning,
            skip_permissions: settings.permission_policy == PermissionPolicy::Unrestricted,
        }
    }

    fn capture_session_id(&mut self, event: &CliEvent) {
        let found = match event {
            CliEvent::System(system) if system.subtype == "init" => system.session_id.as_ref(),
            CliEvent::Result(result) => result.session_id.as_ref(),
            _ => None,
        };
        if let Some(id) = found {
            if self.cli_session_id.as_ref() != Some(id) {
                log::debug!("claude CLI session id: {id}");
                self.cli_session_id = Some(id.clone());
            }
        }
    }

    async fn close_process(&mut self) {
        if let Some(process) = self.process.take() {
            process.shutdown().await;
        }
    }

    fn process(&self) -> Result<&ClaudeProcess, BackendError> {
        self.process
            .as_ref()
            .ok_or_else(|| BackendError::Io("claude CLI is not running".to_string()))
    }
}

#[async_trait]
impl NativeAdapter for ClaudeAdapter {
    type Native = CliEvent;

    async fn send(&mut self, message: &str, settings: &SessionSettings) -> Result<(), BackendError> {
        let key = Self::spawn_key(settings);
        let reusable = match self.process.as_mut() {
            Some(process) => process.is_alive() && *process.key() == key,
            None => false,
        };

        if !reusable {
            if self.process.is_some() {
                log::info!("restarting claude CLI to apply model={} reasoning={:?}", key.model, key.reasoning);
            }
            self.close_process().await;
            let process =
                ClaudeProcess::spawn(&self.cli, &self.folder, key, self.cli_session_id.as_deref()).await?;
            self.process = Some(process);
        }

        let session_id = self.cli_session_id.clone();
        self.process()?
            .send_user_message(message, session_id.as_deref())
            .await
    }

    async fn next_event(&mut self) -> Result<Option<CliEvent>, BackendError> {
        let Some(process) = self.process.as_mut() else {
            return Ok(None);
        };
        match process.recv().await {
            Some(Ok(event)) => {
                self.capture_session_id(&event);
                Ok(Some(event))
            }
            Some(Err(e)) => Err(e),
            None => {
                // Dropping the handle kills the child; the next send respawns
                // with --resume.
                log::info!("claude CLI exited");
                self.process = None;
                Ok(None)
            }
        }
    }

    async fn interrupt(&mut self) -> Result<(), BackendError> {
        self.process()?.interrupt().await
    }

    async fn reply_permission(
        &mut self,
        reply: &PermissionReply,
        allowed: bool,
        reason: &str,
    ) -> Result<(), BackendError> {
        let response = if allowed {
            OutgoingControlResponse::allow_pretool(reply.request_id.clone(), reason)
        } else {
            OutgoingControlResponse::deny_pretool(reply.request_id.clone(), reason)
        };
        self.process()?.write(&response).await
    }

    async fn disconnect(&mut self) {
        self.close_process().await;
    }

    fn resume_token(&self) -> Option<String> {
        self.cli_session_id.clone()
    }

    fn translate(native: CliEvent, ctx: &mut TurnContext) -> Vec<Translated> {
        translate::translate(native, ctx)
    }
}
