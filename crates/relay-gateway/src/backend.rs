//! Seams to the IM backend.
//!
//! The gateway never talks to the IM server itself. An [`Authenticator`]
//! checks robot credentials and hands back a [`RobotBackend`] bound to that
//! robot; the session owns it until the connection closes.

use async_trait::async_trait;
use relay_protocol::{
    Conversation, GroupInfo, GroupMember, GroupMemberList, ImResult, MessagePayload, RobotProfile,
    SendMessageResult, UserInfo,
};
use std::sync::Arc;

use crate::error::{AuthError, BackendError};

pub type BackendResult<T> = Result<ImResult<T>, BackendError>;

/// Robot operations exposed through the gateway.
///
/// Every call returns the backend's own `ImResult`; an `Err` means the call
/// itself failed.
#[async_trait]
pub trait RobotBackend: Send + Sync {
    async fn send_message(
        &self,
        from: &str,
        conv: Conversation,
        payload: MessagePayload,
        to_users: Option<Vec<String>>,
    ) -> BackendResult<SendMessageResult>;

    async fn reply_message(
        &self,
        message_id: i64,
        payload: MessagePayload,
        mention_sender: bool,
    ) -> BackendResult<SendMessageResult>;

    async fn recall_message(&self, message_id: i64) -> BackendResult<String>;

    async fn update_message(&self, message_id: i64, payload: MessagePayload) -> BackendResult<()>;

    async fn get_user_info(&self, user_id: &str) -> BackendResult<UserInfo>;

    async fn get_user_info_by_mobile(&self, mobile: &str) -> BackendResult<UserInfo>;

    async fn get_profile(&self) -> BackendResult<RobotProfile>;

    async fn get_group_info(&self, group_id: &str) -> BackendResult<GroupInfo>;

    async fn get_group_members(&self, group_id: &str) -> BackendResult<GroupMemberList>;

    async fn get_group_member(&self, group_id: &str, member_id: &str) -> BackendResult<GroupMember>;

    /// Frees backend resources. Called once when the owning session ends.
    fn release(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Validates robot credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, robot_id: &str, secret: &str) -> Result<Arc<dyn RobotBackend>, AuthError>;
}
