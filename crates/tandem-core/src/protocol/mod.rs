//! Bridge wire protocol.
//!
//! One JSON object per WebSocket text frame, discriminated by a `type` field.
//! Field names are camelCase on the wire.

mod codec;
mod types;

pub use codec::{CodecError, decode, encode};
pub use types::*;
