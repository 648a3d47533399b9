//! `Tandem` Core Library
//!
//! Shared functionality for `Tandem` components:
//! - Bridge wire protocol shared by host and remote
//! - NDJSON parsing for the Claude Code stream-json protocol
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use protocol::BridgeMessage;
