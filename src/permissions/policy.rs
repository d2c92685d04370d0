//! Permission policy levels and the per-tool decision made before prompting.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::settings::ClaudeSettings;
use crate::events::ToolType;

/// The three ordered permission levels.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum PermissionPolicy {
    /// Prompt for every protected tool.
    #[default]
    #[serde(rename = "default", alias = "restrictive")]
    Restrictive,
    /// Allow file edits without asking; shell commands still prompt.
    #[serde(rename = "acceptEdits", alias = "auto-edit", alias = "autoEdit")]
    AutoEdit,
    /// Allow everything.
    #[serde(rename = "bypassPermissions", alias = "unrestricted")]
    Unrestricted,
}

impl PermissionPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionPolicy::Restrictive => "default",
            PermissionPolicy::AutoEdit => "acceptEdits",
            PermissionPolicy::Unrestricted => "bypassPermissions",
        }
    }

    /// Codex sandbox level for this policy.
    pub fn sandbox_mode(self) -> &'static str {
        match self {
            PermissionPolicy::Restrictive => "read-only",
            PermissionPolicy::AutoEdit => "workspace-write",
            PermissionPolicy::Unrestricted => "danger-full-access",
        }
    }
}

impl std::fmt::Display for PermissionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PermissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "default" | "restrictive" => Ok(PermissionPolicy::Restrictive),
            "acceptEdits" | "auto-edit" | "autoEdit" => Ok(PermissionPolicy::AutoEdit),
            "bypassPermissions" | "unrestricted" => Ok(PermissionPolicy::Unrestricted),
            other => Err(format!("unknown permission policy: {other}")),
        }
    }
}

/// Result of evaluating whether a tool should be allowed to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow(String),
    Deny(String),
    PromptUser,
}

/// Decides a tool invocation without asking the user, if possible.
///
/// In order: interactive tools are denied, `Unrestricted` allows all,
/// `AutoEdit` allows all but shell commands, the user allow-list allows
/// matches, unprotected tools are allowed, everything else prompts.
pub fn determine_permission(
    policy: PermissionPolicy,
    tool_name: &str,
    tool_type: ToolType,
    tool_input: &Value,
    user_settings: Option<&ClaudeSettings>,
) -> PermissionDecision {
    if is_interactive_tool(tool_name) {
        return PermissionDecision::Deny(
            "Interactive tools requiring TTY input are not supported".to_string(),
        );
    }

    match policy {
        PermissionPolicy::Unrestricted => {
            return PermissionDecision::Allow("Bypass mode - all tools allowed".to_string());
        }
        PermissionPolicy::AutoEdit if tool_type != ToolType::Bash => {
            return PermissionDecision::Allow(
                "AcceptEdits mode - file operations allowed".to_string(),
            );
        }
        _ => {}
    }

    if user_settings.is_some_and(|settings| settings.allows(tool_name, tool_input)) {
        return PermissionDecision::Allow("Allowed by user settings".to_string());
    }

    if !requires_permission(tool_name, tool_type) {
        return PermissionDecision::Allow("Read-only operation".to_string());
    }

    PermissionDecision::PromptUser
}

pub fn requires_permission(tool_name: &str, tool_type: ToolType) -> bool {
    matches!(tool_type, ToolType::Bash | ToolType::FileWrite | ToolType::FileEdit)
        || matches!(tool_name, "Write" | "Edit" | "MultiEdit" | "Bash" | "NotebookEdit" | "Skill")
}

/// Tools that need a TTY we cannot provide.
pub fn is_interactive_tool(tool_name: &str) -> bool {
    matches!(tool_name, "AskUserQuestion" | "EnterPlanMode" | "ExitPlanMode")
}
