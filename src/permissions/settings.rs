//! User allow-list from `~/.claude/settings.json`.
//!
//! Only `permissions.allow` is read. Patterns:
//! - `"WebFetch"` allows the whole tool
//! - `"Skill(email)"` allows one argument value
//! - `"Bash(ls:*)"` allows any command starting with `ls`
//! - `"Bash(uv init)"` allows exactly that command

use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Permissions {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// The part of the Claude settings file we care about.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ClaudeSettings {
    #[serde(default)]
    pub permissions: Permissions,
}

impl ClaudeSettings {
    pub fn with_allow<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            permissions: Permissions {
                allow: patterns.into_iter().map(Into::into).collect(),
                deny: Vec::new(),
            },
        }
    }

    /// Whether any allow pattern matches this invocation.
    pub fn allows(&self, tool_name: &str, tool_input: &Value) -> bool {
        self.permissions
            .allow
            .iter()
            .any(|pattern| matches_pattern(pattern, tool_name, tool_input))
    }
}

pub fn settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}

/// Loads `~/.claude/settings.json`; a missing or unreadable file means no allow-list.
pub fn load_user_settings() -> Option<ClaudeSettings> {
    load_from(&settings_path()?)
}

pub fn load_from(path: &Path) -> Option<ClaudeSettings> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(settings) => Some(settings),
        Err(e) => {
            log::warn!("ignoring unreadable settings file {}: {e}", path.display());
            None
        }
    }
}

fn matches_pattern(pattern: &str, tool_name: &str, tool_input: &Value) -> bool {
    let Some(paren) = pattern.find('(') else {
        return pattern == tool_name;
    };
    if !pattern.ends_with(')') || &pattern[..paren] != tool_name {
        return false;
    }
    let pattern_arg = &pattern[paren + 1..pattern.len() - 1];

    let field = |key: &str| tool_input.get(key).and_then(Value::as_str);
    let value = match tool_name {
        "Bash" => field("command"),
        "Skill" => field("skill"),
        _ => field("pattern")
            .or_else(|| field("path"))
            .or_else(|| field("file_path"))
            .or_else(|| field("url"))
            .or_else(|| field("query")),
    };
    let Some(value) = value else {
        return false;
    };

    match pattern_arg.strip_suffix(":*") {
        Some(prefix) => value.starts_with(prefix),
        None => value == pattern_arg,
    }
}
