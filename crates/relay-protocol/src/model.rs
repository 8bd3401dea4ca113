//! IM data model carried inside frames.

use serde::{Deserialize, Serialize};

/// Conversation kinds understood by the IM backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationType {
    Single,
    Group,
    SuperGroup,
    Other(i32),
}

impl From<i32> for ConversationType {
    fn from(value: i32) -> Self {
        match value {
            0 => ConversationType::Single,
            1 => ConversationType::Group,
            2 => ConversationType::SuperGroup,
            other => ConversationType::Other(other),
        }
    }
}

impl From<ConversationType> for i32 {
    fn from(value: ConversationType) -> Self {
        match value {
            ConversationType::Single => 0,
            ConversationType::Group => 1,
            ConversationType::SuperGroup => 2,
            ConversationType::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// 0 single chat, 1 group, 2 super group.
    #[serde(rename = "type")]
    pub conv_type: i32,
    /// User id for single chats, group id otherwise.
    pub target: String,
    #[serde(default)]
    pub line: i32,
}

impl Conversation {
    pub fn single(target: impl Into<String>) -> Self {
        Self {
            conv_type: ConversationType::Single.into(),
            target: target.into(),
            line: 0,
        }
    }

    pub fn group(target: impl Into<String>) -> Self {
        Self {
            conv_type: ConversationType::Group.into(),
            target: target.into(),
            line: 0,
        }
    }

    pub fn kind(&self) -> ConversationType {
        ConversationType::from(self.conv_type)
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind(), ConversationType::Group | ConversationType::SuperGroup)
    }
}

/// Well-known payload types.
pub mod content_type {
    pub const TEXT: i32 = 1;
    pub const VOICE: i32 = 2;
    pub const IMAGE: i32 = 3;
    pub const VIDEO: i32 = 4;
    pub const FILE: i32 = 5;
    pub const STREAMING_TEXT_GENERATING: i32 = 14;
    pub const STREAMING_TEXT_GENERATED: i32 = 15;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub payload_type: i32,
    pub searchable_content: String,
    pub push_content: String,
    pub content: String,
    /// Base64 binary data.
    pub data: String,
    pub remote_media_url: String,
    pub expire_duration: i32,
    pub mentioned_type: i32,
    pub mentioned_targets: Vec<String>,
    /// JSON-encoded extra data.
    pub extra: String,
}

impl MessagePayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            payload_type: content_type::TEXT,
            searchable_content: text.into(),
            ..Default::default()
        }
    }
}

/// Message as delivered to a robot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutputMessageData {
    pub sender: String,
    pub conv: Conversation,
    pub payload: MessagePayload,
    pub from_user: String,
    pub timestamp: i64,
    pub message_id: i64,
    pub message_uid: i64,
}

/// Result envelope returned by every IM backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImResult<T> {
    pub code: i32,
    #[serde(default)]
    pub msg: String,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
}

impl<T> ImResult<T> {
    pub fn ok(result: T) -> Self {
        Self {
            code: crate::CODE_SUCCESS,
            msg: "success".to_string(),
            result: Some(result),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            result: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == crate::CODE_SUCCESS
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    pub display_name: String,
    pub portrait: String,
    pub mobile: String,
    pub email: String,
    pub address: String,
    pub company: String,
    pub extra: String,
    pub gender: i32,
}

/// Robot account as stored by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RobotProfile {
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    pub state: i32,
}

impl RobotProfile {
    /// Copy safe to hand back to the robot itself.
    pub fn redacted(&self) -> Self {
        Self {
            secret: None,
            callback: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendMessageResult {
    pub message_id: i64,
    pub message_uid: i64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
    pub portrait: String,
    pub owner: String,
    #[serde(rename = "type")]
    pub group_type: i32,
    pub member_count: i32,
    pub extra: String,
    pub update_dt: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupMember {
    pub group_id: String,
    pub member_id: String,
    pub alias: String,
    pub extra: String,
    /// 0 normal, 1 manager, 2 owner.
    #[serde(rename = "type")]
    pub member_type: i32,
    pub update_dt: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupMemberList {
    pub members: Vec<GroupMember>,
}
