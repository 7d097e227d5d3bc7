//! Process lifecycle: broker connection, dispatch and logging setup.

pub mod bridge;
pub mod tracing;

pub use bridge::{serve, Bridge, BridgeConfig, BridgeError};
