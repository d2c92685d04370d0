//! Claude stream-json records to unified events.

use serde_json::{json, Value};
use uuid::Uuid;

use super::cli_protocol::{
    AssistantEvent, CliEvent, ContentBlock, IncomingControlRequest, ResultEvent, SystemEvent,
    ToolResultBlock, ToolUseBlock, UsageInfo, UserContent, UserEvent,
};
use super::tool_utils::{describe_permission, exposes_raw_input, extract_tool_target, tool_type};
use crate::backends::types::{PermissionAsk, PermissionReply, Translated};
use crate::events::{ToolStatus, UnifiedEvent};
use crate::turn::TurnContext;

pub fn translate(event: CliEvent, ctx: &mut TurnContext) -> Vec<Translated> {
    match event {
        CliEvent::System(system) => translate_system(system),
        CliEvent::Assistant(assistant) => translate_assistant(assistant, ctx),
        CliEvent::User(user) => translate_user(user, ctx),
        CliEvent::Result(result) => translate_result(result),
        CliEvent::ControlRequest(request) => translate_control_request(request, ctx),
        CliEvent::ControlResponse(_) | CliEvent::Unknown => Vec::new(),
    }
}

fn translate_system(event: SystemEvent) -> Vec<Translated> {
    if event.subtype != "init" {
        return Vec::new();
    }
    vec![UnifiedEvent::BackendSpecific {
        kind: "session_init".to_string(),
        payload: json!({
            "authType": event.auth_type(),
            "sessionId": event.session_id,
            "model": event.model,
        }),
    }
    .into()]
}

fn token_usage(usage: &UsageInfo) -> UnifiedEvent {
    let context = usage.context_tokens();
    UnifiedEvent::TokenUsage {
        total: context + usage.output_tokens,
        context_used: Some(context),
        context_window: None,
    }
}

fn translate_assistant(event: AssistantEvent, ctx: &mut TurnContext) -> Vec<Translated> {
    let mut out = Vec::new();
    // Per-call usage reflects context occupancy; result totals are cumulative.
    if let Some(usage) = &event.message.usage {
        out.push(token_usage(usage).into());
    }

    for block in event.message.content {
        match block {
            ContentBlock::Text(text) if !text.text.is_empty() => {
                out.push(UnifiedEvent::text(text.text).into());
            }
            ContentBlock::Thinking(thinking) => {
                let id = ctx.next_thinking_id();
                out.push(
                    UnifiedEvent::ThinkingStart {
                        id: id.clone(),
                        content: Some(thinking.thinking),
                    }
                    .into(),
                );
                out.push(UnifiedEvent::ThinkingEnd { id }.into());
            }
            ContentBlock::ToolUse(tool_use) => {
                if let Some(start) = start_tool(&tool_use, ctx) {
                    out.push(start.into());
                }
            }
            ContentBlock::ToolResult(result) => out.extend(end_tool(&result, ctx)),
            ContentBlock::Text(_) | ContentBlock::Unknown => {}
        }
    }
    out
}

/// Registers a tool announced in an assistant message unless the hook already did.
fn start_tool(tool_use: &ToolUseBlock, ctx: &mut TurnContext) -> Option<UnifiedEvent> {
    if ctx.tools().resolve_open(&tool_use.id).is_some() {
        return None;
    }
    Some(register_tool(&tool_use.id, &tool_use.name, &tool_use.input, ctx))
}

fn register_tool(native_id: &str, tool_name: &str, input: &Value, ctx: &mut TurnContext) -> UnifiedEvent {
    let target = extract_tool_target(tool_name, input);
    let tool_type = tool_type(tool_name);
    let tool_id = ctx.tools_mut().start(native_id, tool_type, &target);
    UnifiedEvent::ToolStart {
        tool_id,
        tool_type,
        target,
        raw_input: exposes_raw_input(tool_name).then(|| input.clone()),
    }
}

/// Both the user echo and, in some CLI versions, the assistant message carry
/// tool results; only the first one for an open instance counts.
fn end_tool(result: &ToolResultBlock, ctx: &mut TurnContext) -> Option<Translated> {
    let tool_id = ctx.tools().resolve_open(&result.tool_use_id)?.id.clone();
    let status = if result.is_error {
        ToolStatus::Error
    } else {
        ToolStatus::Completed
    };
    Some(
        UnifiedEvent::ToolEnd {
            tool_id,
            status,
            output: result.output_text(),
        }
        .into(),
    )
}

fn translate_user(event: UserEvent, ctx: &mut TurnContext) -> Vec<Translated> {
    let Some(UserContent::Blocks(blocks)) = event.message.map(|m| m.content) else {
        return Vec::new();
    };
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolResult(result) => end_tool(result, ctx),
            _ => None,
        })
        .collect()
}

fn translate_result(event: ResultEvent) -> Vec<Translated> {
    let mut out = Vec::new();
    if !event.is_success() && !event.is_aborted {
        let message = event
            .result
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| format!("Claude CLI finished with {}", event.subtype));
        out.push(UnifiedEvent::error(message, true).into());
    }
    out.push(UnifiedEvent::Complete.into());
    out
}

fn translate_control_request(request: IncomingControlRequest, ctx: &mut TurnContext) -> Vec<Translated> {
    if !request.is_pretool_hook() {
        return Vec::new();
    }
    let Some(input) = request.request.input.as_ref() else {
        return Vec::new();
    };

    let tool_name = input.tool_name.clone().unwrap_or_default();
    let tool_input = input.tool_input.clone().unwrap_or_else(|| json!({}));
    let native_id = request
        .request
        .tool_use_id
        .clone()
        .or_else(|| input.tool_use_id.clone())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut out = Vec::new();
    let tool_id = match ctx.tools().resolve_open(&native_id) {
        Some(open) => open.id.clone(),
        None => {
            let start = register_tool(&native_id, &tool_name, &tool_input, ctx);
            let id = start.tool_id().map(str::to_string).unwrap_or_default();
            out.push(start.into());
            id
        }
    };

    out.push(Translated::Permission(PermissionAsk {
        tool_id,
        description: describe_permission(&tool_name, &tool_input),
        tool_name,
        input: tool_input,
        reply: PermissionReply {
            request_id: request.request_id,
        },
    }));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ToolType;

    fn parse(line: &str) -> CliEvent {
        serde_json::from_str(line).unwrap()
    }

    fn events(out: Vec<Translated>) -> Vec<UnifiedEvent> {
        out.into_iter()
            .map(|t| match t {
                Translated::Event(e) => e,
                Translated::Permission(ask) => panic!("unexpected permission ask {ask:?}"),
            })
            .collect()
    }

    fn pretool(request_id: &str, tool_use_id: &str, tool: &str, input: Value) -> CliEvent {
        parse(
            &json!({
                "type": "control_request",
                "request_id": request_id,
                "request": {
                    "subtype": "hook_callback",
                    "callback_id": "pretool_0",
                    "tool_use_id": tool_use_id,
                    "input": {"hook_event_name": "PreToolUse", "tool_name": tool, "tool_input": input}
                }
            })
            .to_string(),
        )
    }

    #[test]
    fn init_becomes_session_init_signal() {
        let mut ctx = TurnContext::new("t");
        let out = events(translate(
            parse(r#"{"type":"system","subtype":"init","session_id":"s-1","model":"sonnet","apiKeySource":"environment"}"#),
            &mut ctx,
        ));
        assert_eq!(
            out,
            vec![UnifiedEvent::BackendSpecific {
                kind: "session_init".into(),
                payload: json!({"authType": "Anthropic API Key", "sessionId": "s-1", "model": "sonnet"}),
            }]
        );
    }

    #[test]
    fn assistant_message_yields_usage_text_thinking_and_tool_start() {
        let mut ctx = TurnContext::new("t");
        let out = events(translate(
            parse(
                r#"{"type":"assistant","message":{"content":[
                    {"type":"thinking","thinking":"plan"},
                    {"type":"text","text":"Looking"},
                    {"type":"tool_use","id":"toolu_1","name":"Read","input":{"file_path":"src/lib.rs"}}
                ],"usage":{"input_tokens":10,"cache_read_input_tokens":90,"cache_creation_input_tokens":5,"output_tokens":3}}}"#,
            ),
            &mut ctx,
        ));

        assert_eq!(
            out[0],
            UnifiedEvent::TokenUsage {
                total: 108,
                context_used: Some(105),
                context_window: None
            }
        );
        assert_eq!(
            out[1],
            UnifiedEvent::ThinkingStart {
                id: "thinking-1".into(),
                content: Some("plan".into())
            }
        );
        assert_eq!(out[2], UnifiedEvent::ThinkingEnd { id: "thinking-1".into() });
        assert_eq!(out[3], UnifiedEvent::text("Looking"));
        assert_eq!(
            out[4],
            UnifiedEvent::ToolStart {
                tool_id: "toolu_1".into(),
                tool_type: ToolType::FileRead,
                target: "src/lib.rs".into(),
                raw_input: None
            }
        );
    }

    #[test]
    fn hook_after_tool_use_asks_for_the_same_instance() {
        let mut ctx = TurnContext::new("t");
        translate(
            parse(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_2","name":"Bash","input":{"command":"ls"}}]}}"#),
            &mut ctx,
        );
        let out = translate(pretool("req_1", "toolu_2", "Bash", json!({"command": "ls"})), &mut ctx);

        assert_eq!(out.len(), 1);
        let Translated::Permission(ask) = &out[0] else {
            panic!("expected permission ask");
        };
        assert_eq!(ask.tool_id, "toolu_2");
        assert_eq!(ask.reply.request_id, "req_1");
        assert_eq!(ask.description, "Run command: ls");
        assert_eq!(ctx.tools().len(), 1);
    }

    #[test]
    fn hook_before_tool_use_starts_the_tool_once() {
        let mut ctx = TurnContext::new("t");
        let out = translate(
            pretool("req_1", "toolu_3", "Write", json!({"file_path": "a.txt"})),
            &mut ctx,
        );
        assert!(matches!(out[0], Translated::Event(UnifiedEvent::ToolStart { .. })));
        assert!(matches!(out[1], Translated::Permission(_)));

        let later = translate(
            parse(r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_3","name":"Write","input":{"file_path":"a.txt"}}]}}"#),
            &mut ctx,
        );
        assert!(later.is_empty());
    }

    #[test]
    fn tool_result_ends_the_tool_once() {
        let mut ctx = TurnContext::new("t");
        let id = ctx.tools_mut().start("toolu_4", ToolType::FileRead, "a");
        ctx.tools_mut().transition(&id, ToolStatus::Running).unwrap();

        let result = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_4","content":"file body","is_error":false}]}}"#;
        let out = events(translate(parse(result), &mut ctx));
        assert_eq!(
            out,
            vec![UnifiedEvent::ToolEnd {
                tool_id: "toolu_4".into(),
                status: ToolStatus::Completed,
                output: Some("file body".into())
            }]
        );

        ctx.tools_mut().transition(&id, ToolStatus::Completed).unwrap();
        assert!(translate(parse(result), &mut ctx).is_empty());
    }

    #[test]
    fn failed_result_is_a_recoverable_error_then_complete() {
        let mut ctx = TurnContext::new("t");
        let out = events(translate(
            parse(r#"{"type":"result","subtype":"error_max_turns","is_error":true}"#),
            &mut ctx,
        ));
        assert_eq!(
            out,
            vec![
                UnifiedEvent::error("Claude CLI finished with error_max_turns", true),
                UnifiedEvent::Complete
            ]
        );

        let ok = events(translate(parse(r#"{"type":"result","subtype":"success","result":"done"}"#), &mut ctx));
        assert_eq!(ok, vec![UnifiedEvent::Complete]);
    }

    #[test]
    fn unknown_records_translate_to_nothing() {
        let mut ctx = TurnContext::new("t");
        assert!(translate(CliEvent::Unknown, &mut ctx).is_empty());
        assert!(translate(parse(r#"{"type":"system","subtype":"health_check"}"#), &mut ctx).is_empty());
    }
}
