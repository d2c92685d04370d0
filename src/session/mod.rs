//! Live sessions and the intents that act on them.

mod orchestrator;
mod registry;

pub use registry::{CreatedSession, SessionConfig, SessionRegistry};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backends::{
    AbortSignal, AdapterConfig, AgentConnection, Backend, BackendKind, ReasoningDepth, SessionSettings,
};
use crate::error::{Result, SessionError};
use crate::events::{EventSink, SessionEvent};
use crate::permissions::{
    ClaudeSettings, PermissionCoordinator, PermissionOutcome, PermissionPolicy, PermissionRequest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    /// Unix millis.
    pub timestamp: i64,
}

impl Message {
    fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    Idle,
    Streaming,
    Aborting,
}

/// A conversation with one backend in one folder.
///
/// At most one turn runs at a time. The turn task owns the adapter handle
/// while it runs and puts it back when the turn ends.
pub struct Session {
    id: String,
    backend: Arc<dyn Backend>,
    folder: PathBuf,
    cli_path: Option<PathBuf>,
    state: Mutex<TurnState>,
    closing: AtomicBool,
    settings: Mutex<SessionSettings>,
    abort: AbortSignal,
    permissions: PermissionCoordinator,
    connection: Mutex<Option<Box<dyn AgentConnection>>>,
    turn_task: Mutex<Option<JoinHandle<()>>>,
    messages: Mutex<Vec<Message>>,
    resume_token: Mutex<Option<String>>,
    events: EventSink,
    drain_timeout: Duration,
    user_settings: Option<Arc<ClaudeSettings>>,
}

pub(crate) struct SessionParts {
    pub backend: Arc<dyn Backend>,
    pub folder: PathBuf,
    pub cli_path: Option<PathBuf>,
    pub settings: SessionSettings,
    pub connection: Box<dyn AgentConnection>,
    pub resume_token: Option<String>,
    pub events: EventSink,
    pub permission_timeout: Duration,
    pub drain_timeout: Duration,
    pub user_settings: Option<Arc<ClaudeSettings>>,
}

impl Session {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            id: parts.events.session_id().to_string(),
            backend: parts.backend,
            folder: parts.folder,
            cli_path: parts.cli_path,
            state: Mutex::new(TurnState::Idle),
            closing: AtomicBool::new(false),
            settings: Mutex::new(parts.settings),
            abort: AbortSignal::new(),
            permissions: PermissionCoordinator::new(parts.permission_timeout),
            connection: Mutex::new(Some(parts.connection)),
            turn_task: Mutex::new(None),
            messages: Mutex::new(Vec::new()),
            resume_token: Mutex::new(parts.resume_token),
            events: parts.events,
            drain_timeout: parts.drain_timeout,
            user_settings: parts.user_settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    pub fn settings(&self) -> SessionSettings {
        self.settings.lock().clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn resume_token(&self) -> Option<String> {
        self.resume_token.lock().clone()
    }

    pub fn pending_permissions(&self) -> Vec<PermissionRequest> {
        self.permissions.pending_requests()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Starts a turn and returns its id. The turn runs on its own task.
    pub(crate) fn send_message(self: &Arc<Self>, text: &str) -> Result<String> {
        let mut state = self.state.lock();
        if self.is_closing() {
            return Err(SessionError::SessionClosing(self.id.clone()));
        }
        if *state != TurnState::Idle {
            return Err(SessionError::SessionBusy(self.id.clone()));
        }
        *state = TurnState::Streaming;
        self.abort.reset();

        let turn_id = Uuid::new_v4().to_string();
        self.messages.lock().push(Message::new(MessageRole::User, text));
        let settings = self.settings();
        log::info!(
            "[{}] starting turn {turn_id} (model={}, policy={})",
            self.id,
            settings.model,
            settings.permission_policy.as_str()
        );

        // Spawned under the state lock so `close` cannot miss the handle.
        let task = tokio::spawn(orchestrator::run_turn(
            Arc::clone(self),
            turn_id.clone(),
            text.to_string(),
            settings,
        ));
        *self.turn_task.lock() = Some(task);
        Ok(turn_id)
    }

    /// Requests an abort of the running turn. A no-op when idle.
    pub(crate) fn abort(&self) {
        match *self.state.lock() {
            TurnState::Streaming => {
                log::info!("[{}] abort requested", self.id);
                self.abort.trigger();
            }
            TurnState::Aborting => log::debug!("[{}] abort already in progress", self.id),
            TurnState::Idle => log::debug!("[{}] abort with no running turn", self.id),
        }
    }

    pub(crate) fn respond_permission(&self, request_id: &str, allowed: bool) -> Result<()> {
        self.permissions.respond(request_id, allowed)
    }

    pub(crate) fn set_model(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(SessionError::InvalidSetting("model must not be empty".to_string()));
        }
        self.update_settings(|settings| settings.model = model.to_string())
    }

    pub(crate) fn set_permission_policy(&self, policy: PermissionPolicy) -> Result<()> {
        self.update_settings(|settings| settings.permission_policy = policy)
    }

    pub(crate) fn set_reasoning_depth(&self, level: ReasoningDepth) -> Result<()> {
        let supported = self.backend.capabilities().reasoning_levels;
        if !supported.contains(&level) {
            return Err(SessionError::InvalidSetting(format!(
                "{} does not support reasoning depth {}",
                self.backend.kind(),
                level.as_str()
            )));
        }
        self.update_settings(|settings| settings.reasoning = Some(level))
    }

    /// Applies a settings change for the next turn and confirms it to the subscriber.
    fn update_settings(&self, change: impl FnOnce(&mut SessionSettings)) -> Result<()> {
        if self.is_closing() {
            return Err(SessionError::SessionClosing(self.id.clone()));
        }
        let settings = {
            let mut settings = self.settings.lock();
            change(&mut settings);
            settings.clone()
        };
        log::info!(
            "[{}] settings changed: model={}, policy={}, reasoning={:?}",
            self.id,
            settings.model,
            settings.permission_policy.as_str(),
            settings.reasoning
        );
        self.events.emit(SessionEvent::StateChanged {
            permission_policy: settings.permission_policy,
            model: settings.model,
        });
        Ok(())
    }

    /// Aborts and drains any running turn, then releases the CLI.
    pub(crate) async fn close(&self) {
        {
            let _state = self.state.lock();
            self.closing.store(true, Ordering::SeqCst);
        }
        self.abort();

        let task = self.turn_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("[{}] turn task failed during close: {e}", self.id);
            }
        }

        self.permissions.deny_all(PermissionOutcome::Aborted);
        let connection = self.connection.lock().take();
        if let Some(mut connection) = connection {
            connection.disconnect().await;
        }
        log::info!("[{}] session closed", self.id);
    }

    fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            folder: self.folder.clone(),
            cli_path: self.cli_path.clone(),
            resume_token: self.resume_token(),
        }
    }

    fn remember_token(&self, token: Option<String>) {
        if let Some(token) = token {
            *self.resume_token.lock() = Some(token);
        }
    }
}
