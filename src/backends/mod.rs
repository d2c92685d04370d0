//! Multi-backend abstraction layer for AI coding CLIs.
//!
//! Each backend owns the subprocess plumbing for one CLI and a translator
//! from its native records into [`UnifiedEvent`](crate::events::UnifiedEvent)s.
//! The orchestrator only ever sees [`AgentConnection`].

mod runtime;
pub mod setup;
pub(crate) mod types;
pub(crate) mod utils;

mod claude;
mod codex;

#[cfg(test)]
pub(crate) mod testing;

pub use claude::ClaudeBackend;
pub use codex::CodexBackend;
pub use runtime::AbortSignal;
pub use types::{
    AdapterConfig, AgentConnection, AuthStatus, Backend, BackendCapabilities, BackendError, BackendKind,
    BackendRegistry, BackendStatus, InstallStatus, ModelInfo, PermissionAsk, PermissionModel,
    PermissionReply, ReasoningDepth, SessionSettings, Translated,
};
