//! NDJSON parser for the Claude Code stream-json protocol.
//!
//! Parses newline-delimited JSON from the agent's stdout into canonical
//! message types, implementing a tolerant reader pattern.

mod parser;
mod types;

pub use parser::{parse_line, parse_value, user_message_line};
pub use types::*;
