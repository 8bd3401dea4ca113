//! Relay Bridge - IM ⇄ agent gateway relay
//!
//! The [`Bridge`] keeps a robot connection to the IM gateway and an operator
//! connection to the agent gateway, forwards filtered IM messages as
//! `chat.send`, and streams the agent's replies back to the conversation
//! that asked, using the [`StreamingContextTracker`] to route run events.

pub mod agent;
mod bridge;
pub mod context;
pub mod converter;
mod error;
pub mod filter;

pub use agent::{AgentClient, AgentClientConfig, AgentEvent, ChatAck, LinkState, RunEvent, RunPhase};
pub use bridge::{Bridge, BridgeStats};
pub use context::{ContextSource, Resolution, StreamingContext, StreamingContextTracker, TrackerStats};
pub use converter::{AgentMessage, ImMessage, MessageConverter, StreamState};
pub use error::{AgentError, BridgeError, Result};
pub use filter::{FilterChain, GroupFilter, Rejection, WhitelistFilter};
