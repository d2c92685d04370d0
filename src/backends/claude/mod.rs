//! Claude CLI backend (stream-json over stdio).

mod adapter;
mod cli_protocol;
mod client;
mod tool_utils;
mod translate;

pub use adapter::ClaudeBackend;
