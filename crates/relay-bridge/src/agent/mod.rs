//! Agent gateway side of the bridge.

mod client;
pub mod protocol;

pub use client::{AgentClient, AgentClientConfig, AgentEvent, ChatAck, LinkState};
pub use protocol::{RunEvent, RunPhase};
