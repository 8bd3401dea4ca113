//! Wire protocol spoken between robot clients and the IM robot gateway.
//!
//! All frames are JSON text over WebSocket:
//! - `connect` handshake (credentials out, `code`/`msg` back)
//! - request / response pairs correlated by `requestId`
//! - `message` / `event` pushes from the gateway

mod error;
mod frame;
mod message;
mod model;

pub use error::{ProtocolError, Result};
pub use frame::{InboundFrame, ServerFrame};
pub use message::{
    ConnectMessage, PushMessage, RequestMessage, ResponseMessage, CODE_SUCCESS, HEARTBEAT_METHOD,
};
pub use model::{
    content_type, Conversation, ConversationType, GroupInfo, GroupMember, GroupMemberList,
    ImResult, MessagePayload, OutputMessageData, RobotProfile, SendMessageResult, UserInfo,
};

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
