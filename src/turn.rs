//! Per-turn state handed to translators.
//!
//! A [`TurnContext`] lives for exactly one turn. It owns the insertion-index
//! counter and the [`ToolRegistry`], which is the only mutable state a
//! translator may touch.

use std::collections::HashMap;

use crate::events::{ToolStatus, ToolType};

/// One tool instance within a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolState {
    /// Unique within the turn. Equals `native_id` unless the backend reused it.
    pub id: String,
    pub native_id: String,
    pub tool_type: ToolType,
    pub target: String,
    pub status: ToolStatus,
    pub permission_request_id: Option<String>,
}

/// Tool instances of the in-progress turn, keyed by unified id.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolState>,
    by_id: HashMap<String, usize>,
    by_native: HashMap<String, Vec<usize>>,
}

impl ToolRegistry {
    /// Registers a new instance in `pending` and returns its unified id.
    ///
    /// A native id seen before in this turn gets a `#n` suffix, n counting
    /// instances of that native id from 1.
    pub fn start(&mut self, native_id: &str, tool_type: ToolType, target: &str) -> String {
        let seen = self.by_native.get(native_id).map_or(0, Vec::len);
        let mut n = seen + 1;
        let mut id = if seen == 0 {
            native_id.to_string()
        } else {
            format!("{native_id}#{n}")
        };
        while self.by_id.contains_key(&id) {
            n += 1;
            id = format!("{native_id}#{n}");
        }

        let slot = self.tools.len();
        self.tools.push(ToolState {
            id: id.clone(),
            native_id: native_id.to_string(),
            tool_type,
            target: target.to_string(),
            status: ToolStatus::Pending,
            permission_request_id: None,
        });
        self.by_id.insert(id.clone(), slot);
        self.by_native.entry(native_id.to_string()).or_default().push(slot);
        id
    }

    /// Latest instance for a native id that has not reached a terminal state.
    pub fn resolve_open(&self, native_id: &str) -> Option<&ToolState> {
        self.by_native
            .get(native_id)?
            .iter()
            .rev()
            .map(|&slot| &self.tools[slot])
            .find(|tool| !tool.status.is_terminal())
    }

    pub fn get(&self, id: &str) -> Option<&ToolState> {
        self.by_id.get(id).and_then(|&slot| self.tools.get(slot))
    }

    /// Moves a tool forward. On rejection returns the status it is stuck in,
    /// or `None` if the id is unknown.
    pub fn transition(&mut self, id: &str, next: ToolStatus) -> Result<ToolStatus, Option<ToolStatus>> {
        let slot = *self.by_id.get(id).ok_or(None::<ToolStatus>)?;
        let tool = &mut self.tools[slot];
        if !tool.status.can_transition_to(next) {
            return Err(Some(tool.status));
        }
        let previous = tool.status;
        tool.status = next;
        Ok(previous)
    }

    pub fn set_permission_request(&mut self, id: &str, request_id: Option<String>) {
        if let Some(&slot) = self.by_id.get(id) {
            self.tools[slot].permission_request_id = request_id;
        }
    }

    /// Ids of instances still in flight, in start order.
    pub fn open_ids(&self) -> Vec<String> {
        self.tools
            .iter()
            .filter(|tool| !tool.status.is_terminal())
            .map(|tool| tool.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ToolState> {
        self.tools.iter()
    }
}

/// Mutable context for one turn.
#[derive(Debug)]
pub struct TurnContext {
    turn_id: String,
    next_index: u64,
    thinking_seq: u64,
    tools: ToolRegistry,
}

impl TurnContext {
    pub fn new(turn_id: impl Into<String>) -> Self {
        Self {
            turn_id: turn_id.into(),
            next_index: 0,
            thinking_seq: 0,
            tools: ToolRegistry::default(),
        }
    }

    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    /// Claims the next insertion index.
    pub fn next_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Id for a thinking block of a backend that does not name them.
    pub fn next_thinking_id(&mut self) -> String {
        self.thinking_seq += 1;
        format!("thinking-{}", self.thinking_seq)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tools_mut(&mut self) -> &mut ToolRegistry {
        &mut self.tools
    }
}
