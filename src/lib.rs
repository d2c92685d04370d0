//! Session orchestration and event normalization for the Claude and Codex CLIs.
//!
//! A [`SessionRegistry`] owns every live session. Each session drives one CLI
//! through a backend adapter, gates tool use through the permission
//! coordinator and publishes an ordered stream of [`SessionEvent`]s.

pub mod backends;
pub mod config;
pub mod error;
pub mod events;
pub mod permissions;
pub mod session;
pub mod turn;

pub use backends::{BackendKind, ReasoningDepth};
pub use config::CoreConfig;
pub use error::{Result, SessionError};
pub use events::{EventStream, SessionEvent, ToolStatus, ToolType, UnifiedEvent};
pub use permissions::PermissionPolicy;
pub use session::{CreatedSession, Message, MessageRole, SessionConfig, SessionRegistry, TurnState};

/// Installs the `env_logger` backend, `info` unless `RUST_LOG` says otherwise.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
