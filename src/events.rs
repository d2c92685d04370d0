//! The unified event protocol and the per-session outbound stream.
//!
//! Every backend's native output is translated into [`UnifiedEvent`] values.
//! The orchestrator stamps each one with an insertion index and pushes it into
//! the session's [`EventStream`] wrapped in a [`SessionEvent`].

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::permissions::PermissionPolicy;

/// Tool categories shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Bash,
    FileRead,
    FileWrite,
    FileEdit,
    Search,
    WebFetch,
    WebSearch,
    AgentSpawn,
    Todo,
    Generic,
}

/// Lifecycle of one tool instance within a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    AwaitingPermission,
    Completed,
    Error,
    Denied,
    Aborted,
}

impl ToolStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolStatus::Completed | ToolStatus::Error | ToolStatus::Denied | ToolStatus::Aborted
        )
    }

    /// Forward-only transition table.
    ///
    /// `pending -> denied` covers a policy rejection that never prompted the user.
    pub fn can_transition_to(self, next: ToolStatus) -> bool {
        use ToolStatus::*;
        match (self, next) {
            (Pending, Running | AwaitingPermission | Denied | Aborted) => true,
            (Running, Completed | Error | AwaitingPermission | Aborted) => true,
            (AwaitingPermission, Running | Denied | Aborted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ToolStatus::Pending => "pending",
            ToolStatus::Running => "running",
            ToolStatus::AwaitingPermission => "awaiting_permission",
            ToolStatus::Completed => "completed",
            ToolStatus::Error => "error",
            ToolStatus::Denied => "denied",
            ToolStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Backend-agnostic event consumed by the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UnifiedEvent {
    Text {
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolStart {
        tool_id: String,
        tool_type: ToolType,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw_input: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ToolStatusUpdate {
        tool_id: String,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        permission_request_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolEnd {
        tool_id: String,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
    },
    ThinkingStart {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },
    ThinkingEnd {
        id: String,
    },
    #[serde(rename_all = "camelCase")]
    TokenUsage {
        total: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_used: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_window: Option<u64>,
    },
    Complete,
    Error {
        message: String,
        recoverable: bool,
    },
    BackendSpecific {
        kind: String,
        payload: Value,
    },
}

impl UnifiedEvent {
    pub fn text(content: impl Into<String>) -> Self {
        UnifiedEvent::Text {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>, recoverable: bool) -> Self {
        UnifiedEvent::Error {
            message: message.into(),
            recoverable,
        }
    }

    pub fn status(tool_id: impl Into<String>, status: ToolStatus) -> Self {
        UnifiedEvent::ToolStatusUpdate {
            tool_id: tool_id.into(),
            status,
            permission_request_id: None,
        }
    }

    /// Tool id this event refers to, if any.
    pub fn tool_id(&self) -> Option<&str> {
        match self {
            UnifiedEvent::ToolStart { tool_id, .. }
            | UnifiedEvent::ToolStatusUpdate { tool_id, .. }
            | UnifiedEvent::ToolEnd { tool_id, .. } => Some(tool_id),
            _ => None,
        }
    }
}

/// What a session's subscriber receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SessionEvent {
    /// A unified event, ordered within its turn by `index`.
    #[serde(rename_all = "camelCase")]
    Turn {
        turn_id: String,
        index: u64,
        event: UnifiedEvent,
    },
    /// Settings confirmation after a settings-change intent.
    #[serde(rename_all = "camelCase")]
    StateChanged {
        permission_policy: PermissionPolicy,
        model: String,
    },
    /// End of an abort-drain. Replaces `Complete` for an aborted turn.
    #[serde(rename_all = "camelCase")]
    AbortComplete { session_id: String },
}

/// Sending half of a session's event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: String,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Pushes an event. A dropped subscriber is not an error for the turn.
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("[{}] event stream closed, dropping event", self.session_id);
        }
    }
}

/// Receiving half of a session's event stream.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking read, `None` when nothing is queued.
    pub fn try_next(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub fn channel(session_id: impl Into<String>) -> (EventSink, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EventSink {
            session_id: session_id.into(),
            tx,
        },
        EventStream { rx },
    )
}
