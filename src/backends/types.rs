//! Core types and traits for the backend abstraction layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::events::UnifiedEvent;
use crate::permissions::PermissionPolicy;
use crate::turn::TurnContext;

/// Identifies the type of AI backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    Codex,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Claude => write!(f, "claude"),
            BackendKind::Codex => write!(f, "codex"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "claude" | "claudecli" | "claude-cli" => Ok(BackendKind::Claude),
            "codex" => Ok(BackendKind::Codex),
            _ => Err(BackendError::UnknownBackend(s.to_string())),
        }
    }
}

/// Error type for backend operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("{backend} CLI is not installed")]
    NotInstalled { backend: BackendKind },

    #[error("{backend} CLI is not authenticated")]
    NotAuthenticated { backend: BackendKind },

    #[error("failed to spawn {backend} CLI: {message}")]
    SpawnFailed { backend: BackendKind, message: String },

    #[error("failed to connect to {backend} CLI: {message}")]
    ConnectFailed { backend: BackendKind, message: String },

    #[error("malformed native record: {0}")]
    MalformedNativeRecord(String),

    #[error("backend I/O error: {0}")]
    Io(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}

impl BackendError {
    /// Whether the turn can continue after this error.
    ///
    /// Only a single unreadable record is recoverable; everything else ends the
    /// turn and, for I/O failures, invalidates the adapter handle.
    pub fn recoverable(&self) -> bool {
        matches!(self, BackendError::MalformedNativeRecord(_))
    }
}

/// Status of CLI installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub path: Option<String>,
}

/// Status of CLI authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub authenticated: bool,
    /// How the CLI is authenticated, when it can be told (e.g. "api_key", "oauth").
    pub method: Option<String>,
}

/// Combined probe result returned by `SessionRegistry::check_backend`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub install: InstallStatus,
    pub auth: AuthStatus,
}

/// Information about an available model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub supports_thinking: bool,
}

/// How the backend handles permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionModel {
    /// Per-operation permission prompts (like Claude Code)
    PerOperation,
    /// Session-level permissions (a sandbox level fixed per turn)
    SessionLevel,
    /// No permission system
    None,
}

/// Capabilities of a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    pub permission_model: PermissionModel,
    pub supports_streaming: bool,
    pub supports_abort: bool,
    pub supports_resume: bool,
    pub supports_extended_thinking: bool,
    pub reasoning_levels: Vec<ReasoningDepth>,
    pub available_models: Vec<ModelInfo>,
}

/// Reasoning effort requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningDepth {
    Low,
    Medium,
    High,
}

impl ReasoningDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasoningDepth::Low => "low",
            ReasoningDepth::Medium => "medium",
            ReasoningDepth::High => "high",
        }
    }
}

impl std::str::FromStr for ReasoningDepth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(ReasoningDepth::Low),
            "medium" => Ok(ReasoningDepth::Medium),
            "high" => Ok(ReasoningDepth::High),
            other => Err(format!("unknown reasoning depth: {other}")),
        }
    }
}

/// User-controlled settings handed to the adapter with every `send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    pub permission_policy: PermissionPolicy,
    pub model: String,
    pub reasoning: Option<ReasoningDepth>,
}

/// Everything an adapter needs to start talking to its CLI.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub folder: PathBuf,
    pub cli_path: Option<PathBuf>,
    pub resume_token: Option<String>,
}

/// Backend-native correlation token for answering a permission ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionReply {
    pub request_id: String,
}

/// A tool that the backend will not run until it hears back from us.
#[derive(Debug, Clone, PartialEq)]
pub struct PermissionAsk {
    pub tool_id: String,
    pub tool_name: String,
    pub input: Value,
    pub description: String,
    pub reply: PermissionReply,
}

/// Output of a translator: either a unified event or a permission gate.
#[derive(Debug, Clone, PartialEq)]
pub enum Translated {
    Event(UnifiedEvent),
    Permission(PermissionAsk),
}

impl From<UnifiedEvent> for Translated {
    fn from(event: UnifiedEvent) -> Self {
        Translated::Event(event)
    }
}

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Trait for a backend implementation (Claude, Codex).
///
/// Sealed: the set of backends is closed and chosen once per session.
#[async_trait]
pub trait Backend: sealed::Sealed + Send + Sync {
    /// Returns the kind of this backend.
    fn kind(&self) -> BackendKind;

    /// Returns the capabilities of this backend.
    fn capabilities(&self) -> BackendCapabilities;

    /// Checks if the CLI is installed.
    async fn check_installed(&self) -> Result<InstallStatus, BackendError>;

    /// Checks if the CLI is authenticated.
    async fn check_authenticated(&self) -> Result<AuthStatus, BackendError>;

    /// Starts an adapter handle. Spawning may be deferred to the first `send`.
    async fn start(&self, config: AdapterConfig) -> Result<Box<dyn AgentConnection>, BackendError>;
}

/// Object-safe handle the orchestrator drives for one session.
#[async_trait]
pub trait AgentConnection: Send {
    async fn send(&mut self, message: &str, settings: &SessionSettings) -> Result<(), BackendError>;

    /// Suspends until the next native event and returns its translation.
    /// `Ok(None)` is end of stream. Must be cancel-safe.
    async fn next_translated(
        &mut self,
        ctx: &mut TurnContext,
    ) -> Result<Option<Vec<Translated>>, BackendError>;

    async fn interrupt(&mut self) -> Result<(), BackendError>;

    async fn reply_permission(
        &mut self,
        reply: &PermissionReply,
        allowed: bool,
        reason: &str,
    ) -> Result<(), BackendError>;

    async fn disconnect(&mut self);

    fn resume_token(&self) -> Option<String>;
}

/// Contract each concrete CLI adapter implements.
///
/// The translator is an associated function so the orchestrator never branches
/// on backend kind per event.
#[async_trait]
pub trait NativeAdapter: sealed::Sealed + Send + 'static {
    type Native: Debug + Send + 'static;

    async fn send(&mut self, message: &str, settings: &SessionSettings) -> Result<(), BackendError>;

    /// Must be cancel-safe: adapters read through a channel fed by a reader task.
    async fn next_event(&mut self) -> Result<Option<Self::Native>, BackendError>;

    async fn interrupt(&mut self) -> Result<(), BackendError>;

    async fn reply_permission(
        &mut self,
        _reply: &PermissionReply,
        _allowed: bool,
        _reason: &str,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn disconnect(&mut self);

    fn resume_token(&self) -> Option<String>;

    fn translate(native: Self::Native, ctx: &mut TurnContext) -> Vec<Translated>;
}

/// Bridges a concrete adapter and its translator into an `AgentConnection`.
pub struct Translating<A>(pub A);

#[async_trait]
impl<A: NativeAdapter> AgentConnection for Translating<A> {
    async fn send(&mut self, message: &str, settings: &SessionSettings) -> Result<(), BackendError> {
        self.0.send(message, settings).await
    }

    async fn next_translated(
        &mut self,
        ctx: &mut TurnContext,
    ) -> Result<Option<Vec<Translated>>, BackendError> {
        match self.0.next_event().await? {
            Some(native) => {
                log::trace!("[{}] native event: {:?}", ctx.turn_id(), native);
                Ok(Some(A::translate(native, ctx)))
            }
            None => Ok(None),
        }
    }

    async fn interrupt(&mut self) -> Result<(), BackendError> {
        self.0.interrupt().await
    }

    async fn reply_permission(
        &mut self,
        reply: &PermissionReply,
        allowed: bool,
        reason: &str,
    ) -> Result<(), BackendError> {
        self.0.reply_permission(reply, allowed, reason).await
    }

    async fn disconnect(&mut self) {
        self.0.disconnect().await
    }

    fn resume_token(&self) -> Option<String> {
        self.0.resume_token()
    }
}

/// Registry of available backends.
pub struct BackendRegistry {
    backends: HashMap<BackendKind, Arc<dyn Backend>>,
    default: BackendKind,
}

impl BackendRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default: BackendKind::Claude,
        }
    }

    /// Registers a backend.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// Gets a backend by kind.
    pub fn get(&self, kind: BackendKind) -> Option<Arc<dyn Backend>> {
        self.backends.get(&kind).cloned()
    }

    /// Gets the default backend.
    pub fn default_backend(&self) -> Option<Arc<dyn Backend>> {
        self.get(self.default)
    }

    /// Sets the default backend kind.
    pub fn set_default(&mut self, kind: BackendKind) {
        self.default = kind;
    }

    pub fn default_kind(&self) -> BackendKind {
        self.default
    }

    /// Returns all registered backend kinds.
    pub fn available_backends(&self) -> Vec<BackendKind> {
        self.backends.keys().copied().collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips_through_str() {
        assert_eq!("claude".parse::<BackendKind>().unwrap(), BackendKind::Claude);
        assert_eq!("Codex".parse::<BackendKind>().unwrap(), BackendKind::Codex);
        assert_eq!(BackendKind::Codex.to_string(), "codex");
        assert!(matches!(
            "gemini".parse::<BackendKind>(),
            Err(BackendError::UnknownBackend(_))
        ));
    }

    #[test]
    fn only_malformed_records_are_recoverable() {
        assert!(BackendError::MalformedNativeRecord("x".into()).recoverable());
        assert!(!BackendError::Io("pipe".into()).recoverable());
        assert!(!BackendError::SpawnFailed {
            backend: BackendKind::Codex,
            message: "enoent".into()
        }
        .recoverable());
    }

    #[test]
    fn reasoning_depth_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<ReasoningDepth>(), Ok(ReasoningDepth::High));
        assert!("extreme".parse::<ReasoningDepth>().is_err());
        assert_eq!(
            serde_json::to_value(ReasoningDepth::Medium).unwrap(),
            serde_json::json!("medium")
        );
    }
}
