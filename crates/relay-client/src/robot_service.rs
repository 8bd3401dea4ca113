//! Typed robot operations over a [`ConnectionManager`].

use relay_protocol::{
    Conversation, GroupInfo, GroupMember, GroupMemberList, ImResult, MessagePayload, RobotProfile,
    SendMessageResult, UserInfo,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ClientConfig, ClientHandler, ConnectionManager};
use crate::error::{ClientError, Result};

/// Robot API facade.
///
/// Gateway-level failures (non-zero response code) come back as an
/// [`ImResult`] carrying that code; transport failures are errors.
#[derive(Debug, Clone)]
pub struct RobotServiceClient {
    connection: ConnectionManager,
}

impl RobotServiceClient {
    pub fn new(config: ClientConfig, handler: Arc<dyn ClientHandler>) -> Self {
        Self {
            connection: ConnectionManager::new(config, handler),
        }
    }

    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    pub async fn connect(&self, robot_id: &str, secret: &str, timeout: Duration) -> Result<()> {
        self.connection
            .connect_and_authenticate(robot_id, secret, timeout)
            .await
    }

    pub async fn close(&self) {
        self.connection.stop().await;
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn robot_id(&self) -> Option<String> {
        self.connection.robot_id()
    }

    pub fn is_authenticated(&self) -> bool {
        self.connection.is_authenticated()
    }

    /// Calls `method` and unwraps the nested `ImResult` the gateway returns.
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<ImResult<T>> {
        let response = self.connection.send_request(method, params).await?;
        if !response.is_success() {
            return Ok(ImResult::error(response.code, response.msg));
        }

        match response.result {
            Some(result) if !result.is_null() => Ok(serde_json::from_value(result)?),
            _ => Ok(ImResult {
                code: response.code,
                msg: response.msg,
                result: None,
            }),
        }
    }

    pub async fn send_message(
        &self,
        conv: &Conversation,
        payload: &MessagePayload,
    ) -> Result<ImResult<SendMessageResult>> {
        let robot_id = self.robot_id().ok_or(ClientError::NotAuthenticated)?;
        self.invoke("sendMessage", vec![json!(robot_id), json!(conv), json!(payload)])
            .await
    }

    pub async fn send_message_to_users(
        &self,
        conv: &Conversation,
        payload: &MessagePayload,
        to_users: &[String],
    ) -> Result<ImResult<SendMessageResult>> {
        let robot_id = self.robot_id().ok_or(ClientError::NotAuthenticated)?;
        self.invoke(
            "sendMessage",
            vec![json!(robot_id), json!(conv), json!(payload), json!(to_users)],
        )
        .await
    }

    pub async fn reply_message(
        &self,
        message_id: i64,
        payload: &MessagePayload,
        mention_sender: bool,
    ) -> Result<ImResult<SendMessageResult>> {
        self.invoke(
            "replyMessage",
            vec![json!(message_id), json!(payload), json!(mention_sender)],
        )
        .await
    }

    pub async fn recall_message(&self, message_id: i64) -> Result<ImResult<String>> {
        self.invoke("recallMessage", vec![json!(message_id)]).await
    }

    pub async fn update_message(&self, message_id: i64, payload: &MessagePayload) -> Result<ImResult<Value>> {
        self.invoke("updateMessage", vec![json!(message_id), json!(payload)])
            .await
    }

    pub async fn get_user_info(&self, user_id: &str) -> Result<ImResult<UserInfo>> {
        self.invoke("getUserInfo", vec![json!(user_id)]).await
    }

    pub async fn get_user_info_by_mobile(&self, mobile: &str) -> Result<ImResult<UserInfo>> {
        self.invoke("getUserInfoByMobile", vec![json!(mobile)]).await
    }

    pub async fn get_profile(&self) -> Result<ImResult<RobotProfile>> {
        self.invoke("getProfile", Vec::new()).await
    }

    pub async fn get_group_info(&self, group_id: &str) -> Result<ImResult<GroupInfo>> {
        self.invoke("getGroupInfo", vec![json!(group_id)]).await
    }

    pub async fn get_group_members(&self, group_id: &str) -> Result<ImResult<GroupMemberList>> {
        self.invoke("getGroupMembers", vec![json!(group_id)]).await
    }

    pub async fn get_group_member(&self, group_id: &str, member_id: &str) -> Result<ImResult<GroupMember>> {
        self.invoke("getGroupMember", vec![json!(group_id), json!(member_id)])
            .await
    }
}
