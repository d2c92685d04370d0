//! Claude tool names: classification, display targets, permission prompts.

use serde_json::Value;

use crate::events::ToolType;

/// Maps a Claude tool name to its unified category.
pub fn tool_type(tool_name: &str) -> ToolType {
    match tool_name {
        "Bash" | "BashOutput" | "KillShell" => ToolType::Bash,
        "Read" | "NotebookRead" => ToolType::FileRead,
        "Write" => ToolType::FileWrite,
        "Edit" | "MultiEdit" | "NotebookEdit" => ToolType::FileEdit,
        "Glob" | "Grep" | "LS" => ToolType::Search,
        "WebFetch" => ToolType::WebFetch,
        "WebSearch" => ToolType::WebSearch,
        "Task" | "Agent" => ToolType::AgentSpawn,
        name if name.starts_with("Todo") || name.starts_with("Task") => ToolType::Todo,
        _ => ToolType::Generic,
    }
}

fn first_str<'a>(input: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| input.get(*key).and_then(Value::as_str))
}

/// Short human-readable target (file path, pattern, command) for a tool call.
pub fn extract_tool_target(tool_name: &str, tool_input: &Value) -> String {
    let found = match tool_name {
        "Read" | "Write" | "Edit" | "MultiEdit" => first_str(tool_input, &["file_path", "path"]),
        "Glob" | "Grep" => first_str(tool_input, &["pattern"]),
        // The model's description reads better than the raw command.
        "Bash" => first_str(tool_input, &["description", "command"]),
        "WebSearch" => first_str(tool_input, &["query"]),
        "WebFetch" => first_str(tool_input, &["url"]),
        "Skill" => first_str(tool_input, &["skill"]),
        "Task" | "Agent" => first_str(tool_input, &["description", "prompt"]),
        "NotebookEdit" => first_str(tool_input, &["notebook_path"]),
        "TaskCreate" => first_str(tool_input, &["subject"]),
        "TaskUpdate" => {
            return tool_input
                .get("taskId")
                .and_then(Value::as_str)
                .map_or_else(|| "task".to_string(), |id| format!("task {id}"))
        }
        "TaskList" | "TaskGet" => Some("tasks"),
        "TodoWrite" => {
            return tool_input
                .get("todos")
                .and_then(Value::as_array)
                .map_or_else(|| "todos".to_string(), |todos| format!("{} todo(s)", todos.len()))
        }
        "AskUserQuestion" => Some("asking question..."),
        _ => {
            let generic = [
                "file_path", "path", "pattern", "command", "url", "query", "skill", "prompt",
                "subject", "name",
            ];
            return first_str(tool_input, &generic)
                .map_or_else(|| tool_name.to_string(), |value| format!("{tool_name}: {value}"));
        }
    };
    found.unwrap_or(tool_name).to_string()
}

/// Task and todo tools carry structured input the UI renders directly.
pub fn exposes_raw_input(tool_name: &str) -> bool {
    tool_name.starts_with("Task") || tool_name.starts_with("Todo")
}

/// One-line prompt shown when asking the user to approve a tool call.
pub fn describe_permission(tool_name: &str, tool_input: &Value) -> String {
    match tool_type(tool_name) {
        ToolType::Bash => {
            let command = first_str(tool_input, &["command"]).unwrap_or("a command");
            format!("Run command: {command}")
        }
        ToolType::FileWrite => format!("Write file: {}", extract_tool_target(tool_name, tool_input)),
        ToolType::FileEdit => format!("Edit file: {}", extract_tool_target(tool_name, tool_input)),
        _ => format!("Use {tool_name}: {}", extract_tool_target(tool_name, tool_input)),
    }
}
