//! Public reachability through a dev tunnel.

pub mod error;
pub mod manager;

pub use error::TunnelError;
pub use manager::{TunnelManager, TunnelState, find_public_url};
