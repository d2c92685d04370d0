//! Session registry: the intent surface the UI layer calls into.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::{Message, Session, SessionParts};
use crate::backends::{
    AdapterConfig, AuthStatus, BackendError, BackendKind, BackendRegistry, BackendStatus, ClaudeBackend,
    CodexBackend, ReasoningDepth, SessionSettings,
};
use crate::config::CoreConfig;
use crate::error::{Result, SessionError};
use crate::events::{self, EventStream};
use crate::permissions::{self, ClaudeSettings, PermissionPolicy};

/// Parameters for `create_session`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub folder: PathBuf,
    /// Falls back to the configured default backend.
    pub backend: Option<BackendKind>,
    pub permission_policy: PermissionPolicy,
    pub model: Option<String>,
    pub reasoning: Option<ReasoningDepth>,
    /// Continues an earlier conversation instead of starting fresh.
    pub resume_token: Option<String>,
}

/// A new session and the only subscription to its events.
#[derive(Debug)]
pub struct CreatedSession {
    pub session_id: String,
    pub events: EventStream,
}

#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, Arc<Session>>>>,
    backends: Arc<BackendRegistry>,
    config: Arc<CoreConfig>,
    user_settings: Option<Arc<ClaudeSettings>>,
}

impl SessionRegistry {
    /// Registry with both CLI backends, configured from `config`.
    pub fn new(config: CoreConfig) -> Self {
        let mut backends = BackendRegistry::new();
        backends.register(Arc::new(ClaudeBackend::new(
            config.cli_path(BackendKind::Claude).map(PathBuf::from),
            config.probe_timeout(),
        )));
        backends.register(Arc::new(CodexBackend::new(
            config.cli_path(BackendKind::Codex).map(PathBuf::from),
            config.probe_timeout(),
        )));
        backends.set_default(config.default_backend);
        Self::with_backends(config, backends)
    }

    pub fn with_backends(config: CoreConfig, backends: BackendRegistry) -> Self {
        let user_settings = match &config.user_settings_path {
            Some(path) => permissions::load_from(path),
            None => permissions::load_user_settings(),
        };
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            backends: Arc::new(backends),
            config: Arc::new(config),
            user_settings: user_settings.map(Arc::new),
        }
    }

    pub fn available_backends(&self) -> Vec<BackendKind> {
        self.backends.available_backends()
    }

    /// Install and auth probe for one backend.
    pub async fn check_backend(&self, kind: BackendKind) -> Result<BackendStatus> {
        let backend = self
            .backends
            .get(kind)
            .ok_or_else(|| BackendError::UnknownBackend(kind.to_string()))?;
        let install = backend.check_installed().await?;
        let auth = if install.installed {
            backend.check_authenticated().await?
        } else {
            AuthStatus {
                authenticated: false,
                method: None,
            }
        };
        Ok(BackendStatus { kind, install, auth })
    }

    pub async fn create_session(&self, config: SessionConfig) -> Result<CreatedSession> {
        let kind = config.backend.unwrap_or(self.config.default_backend);
        let backend = self
            .backends
            .get(kind)
            .ok_or_else(|| BackendError::UnknownBackend(kind.to_string()))?;

        if !backend.check_installed().await?.installed {
            return Err(BackendError::NotInstalled { backend: kind }.into());
        }
        if !backend.check_authenticated().await?.authenticated {
            return Err(BackendError::NotAuthenticated { backend: kind }.into());
        }

        if let Some(level) = config.reasoning {
            if !backend.capabilities().reasoning_levels.contains(&level) {
                return Err(SessionError::InvalidSetting(format!(
                    "{kind} does not support reasoning depth {}",
                    level.as_str()
                )));
            }
        }

        let model = config
            .model
            .filter(|model| !model.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model(kind));
        let cli_path = self.config.cli_path(kind).map(PathBuf::from);
        let connection = backend
            .start(AdapterConfig {
                folder: config.folder.clone(),
                cli_path: cli_path.clone(),
                resume_token: config.resume_token.clone(),
            })
            .await?;

        let session_id = Uuid::new_v4().to_string();
        let (sink, events) = events::channel(&session_id);
        let session = Session::new(SessionParts {
            backend,
            folder: config.folder,
            cli_path,
            settings: SessionSettings {
                permission_policy: config.permission_policy,
                model,
                reasoning: config.reasoning,
            },
            connection,
            resume_token: config.resume_token,
            events: sink,
            permission_timeout: self.config.permission_timeout(),
            drain_timeout: self.config.drain_timeout(),
            user_settings: self.user_settings.clone(),
        });
        log::info!(
            "[{session_id}] created {kind} session in {}",
            session.folder().display()
        );

        self.sessions.lock().insert(session_id.clone(), Arc::new(session));
        Ok(CreatedSession { session_id, events })
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<Session>> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    /// Starts a turn and returns its id. Fails with `SessionBusy` if one is running.
    pub fn send_message(&self, session_id: &str, text: &str) -> Result<String> {
        self.get(session_id)?.send_message(text)
    }

    pub fn respond_permission(&self, session_id: &str, request_id: &str, allowed: bool) -> Result<()> {
        self.get(session_id)?.respond_permission(request_id, allowed)
    }

    pub fn abort_session(&self, session_id: &str) -> Result<()> {
        self.get(session_id)?.abort();
        Ok(())
    }

    pub fn set_model(&self, session_id: &str, model: &str) -> Result<()> {
        self.get(session_id)?.set_model(model)
    }

    pub fn set_permission_policy(&self, session_id: &str, policy: PermissionPolicy) -> Result<()> {
        self.get(session_id)?.set_permission_policy(policy)
    }

    pub fn set_reasoning_depth(&self, session_id: &str, level: ReasoningDepth) -> Result<()> {
        self.get(session_id)?.set_reasoning_depth(level)
    }

    pub fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self.get(session_id)?.messages())
    }

    pub fn resume_token(&self, session_id: &str) -> Result<Option<String>> {
        Ok(self.get(session_id)?.resume_token())
    }

    /// Aborts and drains the running turn, then forgets the session.
    pub async fn destroy_session(&self, session_id: &str) -> Result<()> {
        let session = self.get(session_id)?;
        session.close().await;
        self.sessions.lock().remove(session_id);
        log::info!("[{session_id}] destroyed");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let ids = self.session_ids();
        log::info!("shutting down {} sessions", ids.len());
        for id in ids {
            if let Err(e) = self.destroy_session(&id).await {
                log::debug!("[{id}] already gone during shutdown: {e}");
            }
        }
    }
}
