//! Tandem Daemon Library
//!
//! Core functionality for the Tandem host:
//! - Agent session hosting through the Claude Code CLI
//! - WebSocket bridge server replicating the session to remote clients
//! - Dev tunnel hosting for public reachability
//! - Relay wiring between the session and the bridge
//! - Relaunch script runner and environment check
//! - Shutdown signal handling that covers startup

pub mod agent;
pub mod doctor;
pub mod prompt;
pub mod relaunch;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod subprocess;
pub mod tunnel;
