//! Tool-permission coordination.
//!
//! A [`PermissionCoordinator`] belongs to one session. Each open request owns a
//! timer task; whichever of respond / timeout / abort reaches the pending map
//! first removes the entry, cancels the timer and queues one [`Resolution`]
//! for the orchestrator. Anything arriving later finds no entry and is a no-op.

mod policy;
mod settings;

pub use policy::{
    determine_permission, is_interactive_tool, requires_permission, PermissionDecision,
    PermissionPolicy,
};
pub use settings::{load_from, load_user_settings, settings_path, ClaudeSettings, Permissions};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backends::types::{PermissionAsk, PermissionReply};
use crate::error::SessionError;

/// A pause point waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    pub turn_id: String,
    pub tool_id: String,
    pub tool_name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// How a request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionOutcome {
    Approved,
    Denied,
    TimedOut,
    Aborted,
    /// The turn finished while the request was still open.
    TurnEnded,
}

impl PermissionOutcome {
    pub fn allowed(self) -> bool {
        self == PermissionOutcome::Approved
    }

    pub fn reason(self) -> &'static str {
        match self {
            PermissionOutcome::Approved => "User approved",
            PermissionOutcome::Denied => "User denied",
            PermissionOutcome::TimedOut => "Permission request timed out",
            PermissionOutcome::Aborted => "Session aborted",
            PermissionOutcome::TurnEnded => "Turn ended before a decision",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub request: PermissionRequest,
    pub reply: PermissionReply,
    pub outcome: PermissionOutcome,
}

struct Pending {
    request: PermissionRequest,
    reply: PermissionReply,
    timer: JoinHandle<()>,
}

struct Shared {
    pending: Mutex<HashMap<String, Pending>>,
    resolved_tx: mpsc::UnboundedSender<Resolution>,
}

impl Shared {
    fn resolve(&self, request_id: &str, outcome: PermissionOutcome) -> bool {
        let Some(pending) = self.pending.lock().remove(request_id) else {
            log::debug!("permission {request_id} already resolved, ignoring {outcome:?}");
            return false;
        };
        pending.timer.abort();
        log::debug!(
            "permission {request_id} for tool {} resolved: {outcome:?}",
            pending.request.tool_id
        );
        let _ = self.resolved_tx.send(Resolution {
            request: pending.request,
            reply: pending.reply,
            outcome,
        });
        true
    }
}

pub struct PermissionCoordinator {
    shared: Arc<Shared>,
    resolved_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Resolution>>,
    timeout: Duration,
}

impl PermissionCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(HashMap::new()),
                resolved_tx,
            }),
            resolved_rx: tokio::sync::Mutex::new(resolved_rx),
            timeout,
        }
    }

    /// Allocates a request for `ask` and arms its timeout.
    pub fn open(&self, turn_id: &str, ask: &PermissionAsk) -> PermissionRequest {
        let created_at = Utc::now();
        let deadline = created_at
            + chrono::Duration::from_std(self.timeout).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let request = PermissionRequest {
            id: Uuid::new_v4().to_string(),
            turn_id: turn_id.to_string(),
            tool_id: ask.tool_id.clone(),
            tool_name: ask.tool_name.clone(),
            description: ask.description.clone(),
            created_at,
            deadline,
        };

        let mut pending = self.shared.pending.lock();
        let timer = spawn_timer(Arc::downgrade(&self.shared), request.id.clone(), self.timeout);
        pending.insert(
            request.id.clone(),
            Pending {
                request: request.clone(),
                reply: ask.reply.clone(),
                timer,
            },
        );
        request
    }

    /// Explicit answer from the UI.
    pub fn respond(&self, request_id: &str, allowed: bool) -> Result<(), SessionError> {
        let outcome = if allowed {
            PermissionOutcome::Approved
        } else {
            PermissionOutcome::Denied
        };
        if self.shared.resolve(request_id, outcome) {
            Ok(())
        } else {
            Err(SessionError::PermissionNotFound(request_id.to_string()))
        }
    }

    /// Resolves every open request with `outcome`. Returns how many were open.
    pub fn deny_all(&self, outcome: PermissionOutcome) -> usize {
        let ids: Vec<String> = self.shared.pending.lock().keys().cloned().collect();
        ids.iter()
            .filter(|id| self.shared.resolve(id, outcome))
            .count()
    }

    /// Next queued resolution. Cancel-safe.
    pub async fn next_resolution(&self) -> Option<Resolution> {
        self.resolved_rx.lock().await.recv().await
    }

    pub fn try_next_resolution(&self) -> Option<Resolution> {
        self.resolved_rx.try_lock().ok()?.try_recv().ok()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn pending_requests(&self) -> Vec<PermissionRequest> {
        self.shared
            .pending
            .lock()
            .values()
            .map(|pending| pending.request.clone())
            .collect()
    }
}

impl Drop for PermissionCoordinator {
    fn drop(&mut self) {
        for (_, pending) in self.shared.pending.lock().drain() {
            pending.timer.abort();
        }
    }
}

fn spawn_timer(shared: Weak<Shared>, request_id: String, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(shared) = shared.upgrade() {
            shared.resolve(&request_id, PermissionOutcome::TimedOut);
        }
    })
}
