//! Tandem CLI Library
//!
//! Remote side of the session bridge: a WebSocket client that follows the
//! shared agent session and submits prompts into it.

pub mod connection;
pub mod headless;
