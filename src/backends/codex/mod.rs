//! Codex CLI backend (`codex exec --json` JSONL).

mod adapter;
mod events;

pub use adapter::CodexBackend;
