//! Relay module: bridges the agent session with bridge clients.
//!
//! This is the glue that connects:
//! - `AgentSession` notifications (state, chat, tool events)
//! - `BridgeServer` broadcast to every remote client
//! - the prompt queue fed by remote clients and the host console

mod pipeline;

pub use pipeline::BridgeRelay;
