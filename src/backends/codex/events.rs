//! Codex `exec --json` JSONL records and their translation to unified events.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::backends::types::Translated;
use crate::events::{ToolStatus, ToolType, UnifiedEvent};
use crate::turn::TurnContext;

/// Noise the CLI prints as an error item on every run with experimental flags.
const UNSTABLE_FEATURES_WARNING: &str = "Under-development features";

/// Raw event from Codex CLI JSONL output.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted { thread_id: String },

    #[serde(rename = "turn.started")]
    TurnStarted,

    #[serde(rename = "turn.completed")]
    TurnCompleted {
        #[serde(default)]
        usage: Option<CodexUsage>,
    },

    #[serde(rename = "turn.failed")]
    TurnFailed {
        #[serde(default)]
        error: Option<CodexErrorBody>,
    },

    #[serde(rename = "item.started")]
    ItemStarted { item: CodexItem },

    #[serde(rename = "item.updated")]
    ItemUpdated { item: CodexItem },

    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodexErrorBody {
    pub message: String,
}

/// Item types within Codex events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodexItem {
    AgentMessage {
        id: String,
        #[serde(default)]
        text: String,
    },
    Reasoning {
        id: String,
        #[serde(default)]
        text: String,
    },
    CommandExecution {
        id: String,
        command: String,
        #[serde(default)]
        aggregated_output: String,
        #[serde(default)]
        exit_code: Option<i32>,
        /// "in_progress", "completed" or "failed".
        #[serde(default)]
        status: String,
    },
    FileWrite {
        id: String,
        path: String,
    },
    FileRead {
        id: String,
        path: String,
    },
    FileChange {
        id: String,
        #[serde(default)]
        changes: Vec<FileChange>,
        #[serde(default)]
        status: String,
    },
    WebSearch {
        id: String,
        #[serde(default)]
        query: String,
    },
    McpToolCall {
        id: String,
        #[serde(default)]
        server: String,
        #[serde(default)]
        tool: String,
        #[serde(default)]
        status: String,
    },
    TodoList {
        id: String,
        #[serde(default)]
        items: Vec<Value>,
    },
    Error {
        id: String,
        message: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub kind: String,
}

/// Token usage from Codex. `input_tokens` already includes the cached part.
#[derive(Debug, Clone, Deserialize)]
pub struct CodexUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Tool facet of an item: native id, category, display target.
struct ToolItem {
    id: String,
    tool_type: ToolType,
    target: String,
    raw_input: Option<Value>,
}

impl CodexItem {
    fn as_tool(&self) -> Option<ToolItem> {
        let (id, tool_type, target, raw_input) = match self {
            CodexItem::CommandExecution { id, command, .. } => (id, ToolType::Bash, command.clone(), None),
            CodexItem::FileRead { id, path } => (id, ToolType::FileRead, path.clone(), None),
            CodexItem::FileWrite { id, path } => (id, ToolType::FileWrite, path.clone(), None),
            CodexItem::FileChange { id, changes, .. } => {
                let target = match changes.as_slice() {
                    [single] => single.path.clone(),
                    many => format!("{} files", many.len()),
                };
                (id, ToolType::FileEdit, target, None)
            }
            CodexItem::WebSearch { id, query } => (id, ToolType::WebSearch, query.clone(), None),
            CodexItem::McpToolCall { id, server, tool, .. } => {
                (id, ToolType::Generic, format!("{server}: {tool}"), None)
            }
            CodexItem::TodoList { id, items } => (
                id,
                ToolType::Todo,
                format!("{} todo(s)", items.len()),
                Some(Value::Array(items.clone())),
            ),
            _ => return None,
        };
        Some(ToolItem {
            id: id.clone(),
            tool_type,
            target,
            raw_input,
        })
    }

    /// Final status of a completed tool item.
    fn end_status(&self) -> ToolStatus {
        match self {
            CodexItem::CommandExecution { exit_code, status, .. } => {
                if status == "failed" || exit_code.is_some_and(|code| code != 0) {
                    ToolStatus::Error
                } else {
                    ToolStatus::Completed
                }
            }
            CodexItem::FileChange { status, .. } | CodexItem::McpToolCall { status, .. }
                if status == "failed" =>
            {
                ToolStatus::Error
            }
            _ => ToolStatus::Completed,
        }
    }

    fn output(&self) -> Option<String> {
        match self {
            CodexItem::CommandExecution {
                aggregated_output, ..
            } if !aggregated_output.is_empty() => Some(aggregated_output.clone()),
            _ => None,
        }
    }
}

pub fn translate(event: CodexEvent, ctx: &mut TurnContext) -> Vec<Translated> {
    let events = match event {
        CodexEvent::ThreadStarted { thread_id } => vec![UnifiedEvent::BackendSpecific {
            kind: "thread_started".to_string(),
            payload: json!({ "threadId": thread_id }),
        }],
        CodexEvent::TurnStarted | CodexEvent::Unknown => Vec::new(),
        CodexEvent::TurnCompleted { usage } => {
            let mut out = Vec::new();
            if let Some(usage) = usage {
                out.push(UnifiedEvent::TokenUsage {
                    total: usage.input_tokens + usage.output_tokens,
                    context_used: Some(usage.input_tokens),
                    context_window: None,
                });
            }
            out.push(UnifiedEvent::Complete);
            out
        }
        CodexEvent::TurnFailed { error } => {
            let message = error
                .map(|e| e.message)
                .unwrap_or_else(|| "Codex turn failed".to_string());
            vec![UnifiedEvent::error(message, false)]
        }
        CodexEvent::Error { message } => vec![UnifiedEvent::error(message, true)],
        CodexEvent::ItemStarted { item } => item_started(&item, ctx),
        CodexEvent::ItemUpdated { .. } => Vec::new(),
        CodexEvent::ItemCompleted { item } => item_completed(item, ctx),
    };
    events.into_iter().map(Translated::from).collect()
}

fn start_tool(tool: ToolItem, ctx: &mut TurnContext) -> (String, Vec<UnifiedEvent>) {
    let tool_id = ctx.tools_mut().start(&tool.id, tool.tool_type, &tool.target);
    let events = vec![
        UnifiedEvent::ToolStart {
            tool_id: tool_id.clone(),
            tool_type: tool.tool_type,
            target: tool.target,
            raw_input: tool.raw_input,
        },
        // Codex has no permission gate per operation; started items are running.
        UnifiedEvent::status(tool_id.clone(), ToolStatus::Running),
    ];
    (tool_id, events)
}

fn item_started(item: &CodexItem, ctx: &mut TurnContext) -> Vec<UnifiedEvent> {
    match item.as_tool() {
        Some(tool) => start_tool(tool, ctx).1,
        None => Vec::new(),
    }
}

fn item_completed(item: CodexItem, ctx: &mut TurnContext) -> Vec<UnifiedEvent> {
    if let Some(tool) = item.as_tool() {
        // Some items only ever arrive completed.
        let (tool_id, mut out) = match ctx.tools().resolve_open(&tool.id) {
            Some(open) => (open.id.clone(), Vec::new()),
            None => start_tool(tool, ctx),
        };
        out.push(UnifiedEvent::ToolEnd {
            tool_id,
            status: item.end_status(),
            output: item.output(),
        });
        return out;
    }

    match item {
        CodexItem::AgentMessage { text, .. } if !text.is_empty() => vec![UnifiedEvent::text(text)],
        CodexItem::Reasoning { id, text } => vec![
            UnifiedEvent::ThinkingStart {
                id: id.clone(),
                content: Some(text),
            },
            UnifiedEvent::ThinkingEnd { id },
        ],
        CodexItem::Error { message, .. } if !message.contains(UNSTABLE_FEATURES_WARNING) => {
            vec![UnifiedEvent::error(message, true)]
        }
        _ => Vec::new(),
    }
}
