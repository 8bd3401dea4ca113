//! Which IM messages reach the agent.

use relay_config::{GroupConfig, WhitelistConfig};
use relay_protocol::OutputMessageData;
use tracing::debug;

use crate::converter::AgentMessage;

/// IM payload types the bridge forwards: regular content and custom types.
pub fn is_supported_type(payload_type: i32) -> bool {
    (1..=15).contains(&payload_type) || (100..=200).contains(&payload_type)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    UnsupportedType(i32),
    SenderBlocked,
    GroupBlocked,
    SenderNotAllowed,
    GroupNotAllowed,
    /// Group message not addressed to the robot
    NotAddressed,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::UnsupportedType(_) => "unsupported_type",
            Rejection::SenderBlocked | Rejection::GroupBlocked => "blocked",
            Rejection::SenderNotAllowed | Rejection::GroupNotAllowed => "not_allowed",
            Rejection::NotAddressed => "not_addressed",
        }
    }
}

/// Block lists first, then allow lists when they are non-empty.
#[derive(Debug, Clone)]
pub struct WhitelistFilter {
    config: WhitelistConfig,
}

impl WhitelistFilter {
    pub fn new(config: WhitelistConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, sender_id: &str, target_id: &str, is_group: bool) -> Result<(), Rejection> {
        let config = &self.config;
        if !config.enabled {
            return Ok(());
        }

        if config.blocked_users.iter().any(|u| u == sender_id) {
            return Err(Rejection::SenderBlocked);
        }
        if is_group && config.blocked_groups.iter().any(|g| g == target_id) {
            return Err(Rejection::GroupBlocked);
        }

        if !config.allowed_users.is_empty() && !config.allowed_users.iter().any(|u| u == sender_id) {
            return Err(Rejection::SenderNotAllowed);
        }
        if is_group && !config.allowed_groups.is_empty() && !config.allowed_groups.iter().any(|g| g == target_id) {
            return Err(Rejection::GroupNotAllowed);
        }
        Ok(())
    }
}

/// Decides whether a group message is meant for the robot.
#[derive(Debug, Clone)]
pub struct GroupFilter {
    config: GroupConfig,
}

impl GroupFilter {
    pub fn new(config: GroupConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, message: &AgentMessage, robot_id: &str) -> Result<(), Rejection> {
        if !message.is_group || !self.config.enabled {
            return Ok(());
        }

        let config = &self.config;
        if !config.allowed_ids.is_empty() && !config.allowed_ids.iter().any(|id| *id == message.thread_id) {
            return Err(Rejection::GroupNotAllowed);
        }

        if config.respond_on_mention && !robot_id.is_empty() && mentions(message, robot_id) {
            debug!("Robot mentioned");
            return Ok(());
        }

        let text = message.text.trim_end();
        if config.respond_on_question && (text.ends_with('?') || text.ends_with('？')) {
            return Ok(());
        }

        if let Some(keyword) = config.help_keywords.iter().find(|k| !k.is_empty() && message.text.contains(k.as_str())) {
            debug!(keyword = %keyword, "Help keyword matched");
            return Ok(());
        }

        Err(Rejection::NotAddressed)
    }
}

fn mentions(message: &AgentMessage, robot_id: &str) -> bool {
    message.mentions.iter().any(|m| m == robot_id) || message.text.contains(&format!("@{}", robot_id))
}

/// The full chain in the order the bridge applies it.
#[derive(Debug, Clone)]
pub struct FilterChain {
    whitelist: WhitelistFilter,
    group: GroupFilter,
}

impl FilterChain {
    pub fn new(whitelist: WhitelistConfig, group: GroupConfig) -> Self {
        Self {
            whitelist: WhitelistFilter::new(whitelist),
            group: GroupFilter::new(group),
        }
    }

    /// Checks applied to the raw push, before conversion.
    pub fn admit_push(&self, data: &OutputMessageData) -> Result<(), Rejection> {
        let payload_type = data.payload.payload_type;
        if !is_supported_type(payload_type) {
            return Err(Rejection::UnsupportedType(payload_type));
        }
        self.whitelist.check(&data.sender, &data.conv.target, data.conv.is_group())
    }

    /// Checks applied to the converted message.
    pub fn admit_message(&self, message: &AgentMessage, robot_id: &str) -> Result<(), Rejection> {
        self.group.check(message, robot_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_message(text: &str, mentions: &[&str]) -> AgentMessage {
        AgentMessage {
            text: text.to_string(),
            sender_id: "u1".to_string(),
            thread_id: "g1".to_string(),
            is_group: true,
            mentions: mentions.iter().map(|m| m.to_string()).collect(),
            attachment: None,
            timestamp: 0,
        }
    }

    #[test]
    fn supported_types() {
        assert!(is_supported_type(1));
        assert!(is_supported_type(15));
        assert!(is_supported_type(150));
        assert!(!is_supported_type(0));
        assert!(!is_supported_type(16));
        assert!(!is_supported_type(99));
        assert!(!is_supported_type(201));
    }

    #[test]
    fn whitelist_blocks_before_allowing() {
        let filter = WhitelistFilter::new(WhitelistConfig {
            enabled: true,
            allowed_users: vec!["u1".to_string(), "u2".to_string()],
            allowed_groups: vec!["g1".to_string()],
            blocked_users: vec!["u2".to_string()],
            blocked_groups: vec![],
        });
        assert_eq!(filter.check("u1", "bot", false), Ok(()));
        assert_eq!(filter.check("u2", "bot", false), Err(Rejection::SenderBlocked));
        assert_eq!(filter.check("u3", "bot", false), Err(Rejection::SenderNotAllowed));
        assert_eq!(filter.check("u1", "g1", true), Ok(()));
        assert_eq!(filter.check("u1", "g2", true), Err(Rejection::GroupNotAllowed));
    }

    #[test]
    fn disabled_whitelist_passes_everything() {
        let filter = WhitelistFilter::new(WhitelistConfig {
            enabled: false,
            blocked_users: vec!["u1".to_string()],
            ..Default::default()
        });
        assert!(filter.check("u1", "bot", false).is_ok());
    }

    #[test]
    fn group_strategies() {
        let filter = GroupFilter::new(GroupConfig {
            help_keywords: vec!["总结".to_string()],
            ..GroupConfig::default()
        });

        assert!(filter.check(&group_message("hello @bot", &[]), "bot").is_ok());
        assert!(filter.check(&group_message("hello", &["bot"]), "bot").is_ok());
        assert!(filter.check(&group_message("is it ready?", &[]), "bot").is_ok());
        assert!(filter.check(&group_message("可以吗？", &[]), "bot").is_ok());
        assert!(filter.check(&group_message("帮我总结一下", &[]), "bot").is_ok());
        assert_eq!(
            filter.check(&group_message("just chatting", &[]), "bot"),
            Err(Rejection::NotAddressed)
        );

        let mut private = group_message("just chatting", &[]);
        private.is_group = false;
        assert!(filter.check(&private, "bot").is_ok());
    }

    #[test]
    fn group_allow_list_applies_first() {
        let filter = GroupFilter::new(GroupConfig {
            allowed_ids: vec!["g2".to_string()],
            ..GroupConfig::default()
        });
        assert_eq!(
            filter.check(&group_message("@bot hi", &[]), "bot"),
            Err(Rejection::GroupNotAllowed)
        );
    }
}
