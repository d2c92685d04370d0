//! Claude CLI stream-json protocol types.
//!
//! The CLI is started with `--input-format stream-json --output-format stream-json`
//! and speaks newline-delimited JSON in both directions:
//! - stdout: `system`, `assistant`, `user`, `result` records, plus
//!   `control_request` (hook callbacks) and `control_response` (acks)
//! - stdin: `user` messages, `control_request` (initialize, interrupt) and
//!   `control_response` (hook decisions)

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Hook callback ids registered in the initialize request.
pub const PRETOOL_CALLBACK_ID: &str = "pretool_0";
pub const POSTTOOL_CALLBACK_ID: &str = "posttool_0";

// ============================================================================
// Incoming (stdout)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CliEvent {
    System(SystemEvent),
    Assistant(AssistantEvent),
    User(UserEvent),
    Result(ResultEvent),
    ControlRequest(IncomingControlRequest),
    ControlResponse(Value),
    /// Record types added by newer CLI versions.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    /// "init", "health_check", ...
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// "none" for a subscription login, "environment"/"settings" for an API key.
    #[serde(default, rename = "apiKeySource", skip_serializing_if = "Option::is_none")]
    pub api_key_source: Option<String>,
}

impl SystemEvent {
    pub fn auth_type(&self) -> &'static str {
        match self.api_key_source.as_deref() {
            Some("none") => "Claude AI Subscription",
            Some("environment") | Some("settings") => "Anthropic API Key",
            _ => "Unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantEvent {
    pub message: AssistantMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
    Thinking(ThinkingBlock),
    ToolResult(ToolResultBlock),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingBlock {
    pub thinking: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResultBlock {
    /// Flattens string or `[{type: text, text}]` content to plain text.
    pub fn output_text(&self) -> Option<String> {
        match &self.content {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Array(parts) => {
                let text: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| part.get("text").and_then(Value::as_str))
                    .collect();
                Some(text.join("\n"))
            }
            other => Some(other.to_string()),
        }
    }
}

/// Echoed user turn; carries tool results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<UserMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    #[serde(default)]
    pub content: UserContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for UserContent {
    fn default() -> Self {
        UserContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    /// "success", "error_max_turns", "error_during_execution", ...
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

impl ResultEvent {
    pub fn is_success(&self) -> bool {
        self.subtype == "success" && !self.is_error
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl UsageInfo {
    /// Context occupied by this call: fresh input plus both cache sides.
    pub fn context_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingControlRequest {
    pub request_id: String,
    pub request: ControlRequestPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequestPayload {
    /// "hook_callback", "can_use_tool", ...
    pub subtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<HookCallbackInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookCallbackInput {
    pub hook_event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

impl IncomingControlRequest {
    pub fn hook_event(&self) -> Option<&str> {
        if self.request.subtype != "hook_callback" {
            return None;
        }
        self.request.input.as_ref().map(|i| i.hook_event_name.as_str())
    }

    pub fn is_pretool_hook(&self) -> bool {
        self.hook_event() == Some("PreToolUse")
    }
}

// ============================================================================
// Outgoing (stdin)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingControlResponse {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub response: OutgoingResponsePayload,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingResponsePayload {
    pub subtype: &'static str,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HookResponseData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookResponseData {
    #[serde(rename = "continue")]
    pub continue_: bool,
    #[serde(rename = "hookSpecificOutput")]
    pub hook_specific_output: OutgoingHookSpecificOutput,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutgoingHookSpecificOutput {
    #[serde(rename = "hookEventName")]
    pub hook_event_name: &'static str,
    #[serde(rename = "permissionDecision")]
    pub permission_decision: &'static str,
    #[serde(
        rename = "permissionDecisionReason",
        skip_serializing_if = "Option::is_none"
    )]
    pub permission_decision_reason: Option<String>,
}

impl OutgoingControlResponse {
    fn hook(request_id: String, event: &'static str, decision: &'static str, reason: Option<&str>) -> Self {
        Self {
            msg_type: "control_response",
            response: OutgoingResponsePayload {
                subtype: "success",
                request_id,
                response: Some(HookResponseData {
                    continue_: true,
                    hook_specific_output: OutgoingHookSpecificOutput {
                        hook_event_name: event,
                        permission_decision: decision,
                        permission_decision_reason: reason.map(str::to_string),
                    },
                }),
            },
        }
    }

    pub fn allow_pretool(request_id: String, reason: &str) -> Self {
        Self::hook(request_id, "PreToolUse", "allow", Some(reason))
    }

    pub fn deny_pretool(request_id: String, reason: &str) -> Self {
        Self::hook(request_id, "PreToolUse", "deny", Some(reason))
    }

    pub fn ack_posttool(request_id: String) -> Self {
        Self::hook(request_id, "PostToolUse", "allow", None)
    }

    /// Bare success for control requests we have nothing to say about.
    pub fn ack(request_id: String) -> Self {
        Self {
            msg_type: "control_response",
            response: OutgoingResponsePayload {
                subtype: "success",
                request_id,
                response: None,
            },
        }
    }
}

/// `initialize` request registering our PreToolUse/PostToolUse hooks.
pub fn initialize_request(request_id: &str) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": {
            "subtype": "initialize",
            "hooks": {
                "PreToolUse": [{ "matcher": null, "hookCallbackIds": [PRETOOL_CALLBACK_ID] }],
                "PostToolUse": [{ "matcher": null, "hookCallbackIds": [POSTTOOL_CALLBACK_ID] }]
            }
        }
    })
}

pub fn interrupt_request(request_id: &str) -> Value {
    json!({
        "type": "control_request",
        "request_id": request_id,
        "request": { "subtype": "interrupt" }
    })
}

pub fn user_message(content: &str, session_id: Option<&str>) -> Value {
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
        "session_id": session_id.unwrap_or("default")
    })
}
