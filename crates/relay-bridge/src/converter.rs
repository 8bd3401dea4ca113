//! 消息转换
//!
//! IM pushes become agent messages; agent replies become IM `sendMessage`
//! calls addressed at the conversation that asked.

use relay_client::ReplyContext;
use relay_protocol::{content_type, Conversation, MessagePayload, OutputMessageData};
use serde_json::Value;
use tracing::debug;

use crate::agent::protocol::Attachment;

/// An IM message ready to hand to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentMessage {
    pub text: String,
    pub sender_id: String,
    /// Sender for private chats, group id for group chats
    pub thread_id: String,
    pub is_group: bool,
    pub mentions: Vec<String>,
    pub attachment: Option<Attachment>,
    pub timestamp: i64,
}

impl AgentMessage {
    pub fn reply_context(&self) -> ReplyContext {
        ReplyContext {
            sender_id: self.sender_id.clone(),
            thread_id: self.thread_id.clone(),
            is_group: self.is_group,
        }
    }
}

/// Streaming state of an outgoing reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Generating,
    Completed,
}

/// A reply ready for `sendMessage`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImMessage {
    pub conversation: Conversation,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Default)]
pub struct MessageConverter;

impl MessageConverter {
    pub fn new() -> Self {
        Self
    }

    /// Returns `None` when the message carries nothing the agent can read.
    pub fn to_agent(&self, data: &OutputMessageData) -> Option<AgentMessage> {
        let payload = &data.payload;
        let text = describe(payload);
        if text.is_empty() {
            debug!(payload_type = payload.payload_type, "Nothing to forward");
            return None;
        }

        let is_group = data.conv.is_group();
        let thread_id = if is_group {
            data.conv.target.clone()
        } else {
            data.sender.clone()
        };

        Some(AgentMessage {
            text,
            sender_id: data.sender.clone(),
            thread_id,
            is_group,
            mentions: payload.mentioned_targets.clone(),
            attachment: attachment(payload),
            timestamp: data.timestamp,
        })
    }

    /// Builds the IM message for a reply.
    ///
    /// With a stream the payload is a streaming text (14 while generating,
    /// 15 once complete) whose `content` carries the stream id; without one
    /// it is plain text.
    pub fn to_im(&self, target: &ReplyContext, text: &str, stream: Option<(&str, StreamState)>) -> ImMessage {
        let conversation = if target.is_group {
            Conversation::group(&target.thread_id)
        } else if target.thread_id.is_empty() {
            Conversation::single(&target.sender_id)
        } else {
            Conversation::single(&target.thread_id)
        };

        let payload = match stream {
            Some((stream_id, state)) => MessagePayload {
                payload_type: match state {
                    StreamState::Generating => content_type::STREAMING_TEXT_GENERATING,
                    StreamState::Completed => content_type::STREAMING_TEXT_GENERATED,
                },
                searchable_content: text.to_string(),
                content: stream_id.to_string(),
                ..Default::default()
            },
            None => MessagePayload::text(text),
        };

        ImMessage { conversation, payload }
    }
}

fn describe(payload: &MessagePayload) -> String {
    let extra = parse_extra(&payload.extra);
    match payload.payload_type {
        content_type::TEXT => payload.searchable_content.clone(),
        content_type::VOICE => format!(
            "[语音消息] 时长:{}秒 URL:{}",
            extra_i64(extra.as_ref(), "duration"),
            media_url(payload).unwrap_or_default()
        ),
        content_type::IMAGE => {
            let desc = if payload.searchable_content.is_empty() {
                "图片"
            } else {
                payload.searchable_content.as_str()
            };
            format!("[图片消息] {} URL:{}", desc, media_url(payload).unwrap_or_default())
        }
        content_type::VIDEO => {
            let thumbnail = if extra.as_ref().is_some_and(|e| e.get("thumbnail").is_some()) {
                "有缩略图"
            } else {
                "无缩略图"
            };
            format!(
                "[视频消息] 时长:{}秒 {} URL:{}",
                extra_i64(extra.as_ref(), "duration"),
                thumbnail,
                media_url(payload).unwrap_or_default()
            )
        }
        content_type::FILE => {
            let name = if payload.searchable_content.is_empty() {
                "未知文件"
            } else {
                payload.searchable_content.as_str()
            };
            format!(
                "[文件消息] {} 大小:{} URL:{}",
                name,
                format_size(extra_i64(extra.as_ref(), "size")),
                media_url(payload).unwrap_or_default()
            )
        }
        other => format!("[消息类型:{}] {}", other, payload.searchable_content),
    }
}

fn attachment(payload: &MessagePayload) -> Option<Attachment> {
    let kind = match payload.payload_type {
        content_type::VOICE => "audio",
        content_type::IMAGE => "image",
        content_type::VIDEO => "video",
        content_type::FILE => "file",
        _ => return None,
    };
    let url = media_url(payload)?;
    let name = (payload.payload_type == content_type::FILE && !payload.searchable_content.is_empty())
        .then(|| payload.searchable_content.clone());
    Some(Attachment {
        kind: kind.to_string(),
        url,
        name,
    })
}

/// `remoteMediaUrl`, else `url` inside the extra JSON, else a bare URL in extra.
fn media_url(payload: &MessagePayload) -> Option<String> {
    if !payload.remote_media_url.is_empty() {
        return Some(payload.remote_media_url.clone());
    }
    if let Some(url) = parse_extra(&payload.extra)
        .as_ref()
        .and_then(|e| e.get("url"))
        .and_then(Value::as_str)
    {
        return Some(url.to_string());
    }
    let extra = payload.extra.as_str();
    (extra.starts_with("http://") || extra.starts_with("https://")).then(|| extra.to_string())
}

fn parse_extra(extra: &str) -> Option<Value> {
    if extra.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(extra).ok().filter(Value::is_object)
}

fn extra_i64(extra: Option<&Value>, field: &str) -> i64 {
    extra
        .and_then(|e| e.get(field))
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
}

fn format_size(size: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    if size <= 0 {
        return "未知".to_string();
    }
    let bytes = size as f64;
    if bytes < KB {
        format!("{}B", size)
    } else if bytes < MB {
        format!("{:.2}KB", bytes / KB)
    } else if bytes < GB {
        format!("{:.2}MB", bytes / MB)
    } else {
        format!("{:.2}GB", bytes / GB)
    }
}
