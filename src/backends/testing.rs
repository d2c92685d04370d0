//! Scripted backend for driving the orchestrator in tests.
//!
//! Each `send` pops the next scripted turn. The stream parks when its queue is
//! empty, like a live CLI with nothing to say, until an interrupt or a
//! permission reply changes the script.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

use super::types::{
    sealed, AdapterConfig, AgentConnection, AuthStatus, Backend, BackendCapabilities, BackendError,
    BackendKind, InstallStatus, NativeAdapter, PermissionAsk, PermissionModel, PermissionReply,
    ReasoningDepth, SessionSettings, Translated, Translating,
};
use crate::events::{ToolStatus, ToolType, UnifiedEvent};
use crate::turn::TurnContext;

#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Tool {
        id: &'static str,
        tool_type: ToolType,
        target: &'static str,
    },
    /// A tool that needs approval before it runs.
    Ask {
        id: &'static str,
        tool: &'static str,
        input: Value,
    },
    /// Holds the stream until `n` permission replies were received in total.
    AwaitReplies(usize),
    End {
        id: &'static str,
        status: ToolStatus,
    },
    Error {
        message: &'static str,
        recoverable: bool,
    },
    Malformed,
    Fail,
    Complete,
    Close,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedReply {
    pub request_id: String,
    pub allowed: bool,
    pub reason: String,
}

#[derive(Default)]
struct Script {
    turns: VecDeque<Vec<Step>>,
    on_interrupt: Vec<Step>,
    queue: VecDeque<Step>,
    sends: Vec<(String, SessionSettings)>,
    replies: Vec<RecordedReply>,
    interrupts: usize,
    disconnects: usize,
    start_tokens: Vec<Option<String>>,
    send_failure: Option<BackendError>,
}

/// Shared view of the script, kept by the test after the backend is registered.
#[derive(Clone, Default)]
pub struct ScriptHandle {
    state: Arc<Mutex<Script>>,
    changed: Arc<Notify>,
}

impl ScriptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turn(&self, steps: Vec<Step>) -> &Self {
        self.state.lock().turns.push_back(steps);
        self
    }

    /// What the backend emits after an interrupt. Empty means it never stops.
    pub fn on_interrupt(&self, steps: Vec<Step>) -> &Self {
        self.state.lock().on_interrupt = steps;
        self
    }

    /// Makes the next `send` fail with `error`.
    pub fn fail_next_send(&self, error: BackendError) -> &Self {
        self.state.lock().send_failure = Some(error);
        self
    }

    pub fn sends(&self) -> Vec<(String, SessionSettings)> {
        self.state.lock().sends.clone()
    }

    pub fn replies(&self) -> Vec<RecordedReply> {
        self.state.lock().replies.clone()
    }

    pub fn interrupts(&self) -> usize {
        self.state.lock().interrupts
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn starts(&self) -> usize {
        self.state.lock().start_tokens.len()
    }

    pub fn start_tokens(&self) -> Vec<Option<String>> {
        self.state.lock().start_tokens.clone()
    }
}

pub struct ScriptedBackend {
    kind: BackendKind,
    script: ScriptHandle,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, script: &ScriptHandle) -> Self {
        Self {
            kind,
            script: script.clone(),
        }
    }
}

impl sealed::Sealed for ScriptedBackend {}

#[async_trait]
impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            permission_model: PermissionModel::PerOperation,
            supports_streaming: true,
            supports_abort: true,
            supports_resume: true,
            supports_extended_thinking: false,
            reasoning_levels: vec![ReasoningDepth::Low, ReasoningDepth::High],
            available_models: Vec::new(),
        }
    }

    async fn check_installed(&self) -> Result<InstallStatus, BackendError> {
        Ok(InstallStatus {
            installed: true,
            version: Some("scripted".to_string()),
            path: None,
        })
    }

    async fn check_authenticated(&self) -> Result<AuthStatus, BackendError> {
        Ok(AuthStatus {
            authenticated: true,
            method: None,
        })
    }

    async fn start(&self, config: AdapterConfig) -> Result<Box<dyn AgentConnection>, BackendError> {
        self.script
            .state
            .lock()
            .start_tokens
            .push(config.resume_token.clone());
        Ok(Box::new(Translating(ScriptedAdapter {
            script: self.script.clone(),
            token: config.resume_token,
        })))
    }
}

fn scripted_tool_type(name: &str) -> ToolType {
    match name {
        "Bash" => ToolType::Bash,
        "Read" => ToolType::FileRead,
        "Write" => ToolType::FileWrite,
        "Edit" => ToolType::FileEdit,
        _ => ToolType::Generic,
    }
}

pub struct ScriptedAdapter {
    script: ScriptHandle,
    token: Option<String>,
}

impl sealed::Sealed for ScriptedAdapter {}

#[async_trait]
impl NativeAdapter for ScriptedAdapter {
    type Native = Step;

    async fn send(&mut self, message: &str, settings: &SessionSettings) -> Result<(), BackendError> {
        let mut state = self.script.state.lock();
        if let Some(error) = state.send_failure.take() {
            return Err(error);
        }
        state.sends.push((message.to_string(), settings.clone()));
        state.queue = state.turns.pop_front().unwrap_or_default().into();
        if self.token.is_none() {
            self.token = Some(format!("scripted-{}", state.start_tokens.len()));
        }
        drop(state);
        self.script.changed.notify_waiters();
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<Step>, BackendError> {
        loop {
            let changed = self.script.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = self.script.state.lock();
                let ready = match state.queue.front() {
                    None => false,
                    Some(Step::AwaitReplies(n)) => state.replies.len() >= *n,
                    Some(_) => true,
                };
                if ready {
                    match state.queue.pop_front() {
                        Some(Step::AwaitReplies(_)) => continue,
                        Some(Step::Malformed) => {
                            return Err(BackendError::MalformedNativeRecord("{\"type\":".into()))
                        }
                        Some(Step::Fail) => return Err(BackendError::Io("broken pipe".into())),
                        Some(Step::Close) | None => return Ok(None),
                        Some(step) => return Ok(Some(step)),
                    }
                }
            }
            changed.await;
        }
    }

    async fn interrupt(&mut self) -> Result<(), BackendError> {
        let mut state = self.script.state.lock();
        state.interrupts += 1;
        state.queue = state.on_interrupt.clone().into();
        drop(state);
        self.script.changed.notify_waiters();
        Ok(())
    }

    async fn reply_permission(
        &mut self,
        reply: &PermissionReply,
        allowed: bool,
        reason: &str,
    ) -> Result<(), BackendError> {
        self.script.state.lock().replies.push(RecordedReply {
            request_id: reply.request_id.clone(),
            allowed,
            reason: reason.to_string(),
        });
        self.script.changed.notify_waiters();
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.script.state.lock().disconnects += 1;
    }

    fn resume_token(&self) -> Option<String> {
        self.token.clone()
    }

    fn translate(step: Step, ctx: &mut TurnContext) -> Vec<Translated> {
        match step {
            Step::Text(text) => vec![UnifiedEvent::text(text).into()],
            Step::Tool {
                id,
                tool_type,
                target,
            } => {
                let tool_id = ctx.tools_mut().start(id, tool_type, target);
                vec![UnifiedEvent::ToolStart {
                    tool_id,
                    tool_type,
                    target: target.to_string(),
                    raw_input: None,
                }
                .into()]
            }
            Step::Ask { id, tool, input } => {
                let mut out = Vec::new();
                let tool_id = match ctx.tools().resolve_open(id) {
                    Some(open) => open.id.clone(),
                    None => {
                        let tool_type = scripted_tool_type(tool);
                        let tool_id = ctx.tools_mut().start(id, tool_type, tool);
                        out.push(
                            UnifiedEvent::ToolStart {
                                tool_id: tool_id.clone(),
                                tool_type,
                                target: tool.to_string(),
                                raw_input: None,
                            }
                            .into(),
                        );
                        tool_id
                    }
                };
                out.push(Translated::Permission(PermissionAsk {
                    tool_id,
                    tool_name: tool.to_string(),
                    input,
                    description: format!("Use {tool}"),
                    reply: PermissionReply {
                        request_id: format!("hook-{id}"),
                    },
                }));
                out
            }
            Step::End { id, status } => match ctx.tools().resolve_open(id) {
                Some(open) => vec![UnifiedEvent::ToolEnd {
                    tool_id: open.id.clone(),
                    status,
                    output: None,
                }
                .into()],
                None => Vec::new(),
            },
            Step::Error {
                message,
                recoverable,
            } => vec![UnifiedEvent::error(message, recoverable).into()],
            Step::Complete => vec![UnifiedEvent::Complete.into()],
            Step::AwaitReplies(_) | Step::Malformed | Step::Fail | Step::Close => Vec::new(),
        }
    }
}
