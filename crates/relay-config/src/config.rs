use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 主配置结构体
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub version: String,
    pub im: ImConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub group: GroupConfig,
    #[serde(default)]
    pub whitelist: WhitelistConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            im: ImConfig::default(),
            agent: AgentConfig::default(),
            session: SessionConfig::default(),
            group: GroupConfig::default(),
            whitelist: WhitelistConfig::default(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// 获取配置值的快捷方法
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["version"] => Some(self.version.clone()),
            ["im", "gateway_url"] => Some(self.im.gateway_url.clone()),
            ["im", "robot_id"] => Some(self.im.robot_id.clone()),
            ["im", "reconnect_interval_secs"] => Some(self.im.reconnect_interval_secs.to_string()),
            ["im", "heartbeat_interval_secs"] => Some(self.im.heartbeat_interval_secs.to_string()),
            ["im", "request_timeout_secs"] => Some(self.im.request_timeout_secs.to_string()),
            ["agent", "url"] => Some(self.agent.url.clone()),
            ["agent", "reconnect_interval_secs"] => Some(self.agent.reconnect_interval_secs.to_string()),
            ["agent", "heartbeat_interval_secs"] => Some(self.agent.heartbeat_interval_secs.to_string()),
            ["agent", "max_reconnect_attempts"] => Some(self.agent.max_reconnect_attempts.to_string()),
            ["agent", "session_key"] => Some(self.agent.session_key.clone()),
            ["session", "context_ttl_secs"] => Some(self.session.context_ttl_secs.to_string()),
            ["group", "enabled"] => Some(self.group.enabled.to_string()),
            ["group", "respond_on_mention"] => Some(self.group.respond_on_mention.to_string()),
            ["group", "respond_on_question"] => Some(self.group.respond_on_question.to_string()),
            ["whitelist", "enabled"] => Some(self.whitelist.enabled.to_string()),
            ["gateway", "bind"] => Some(self.gateway.bind.clone()),
            ["gateway", "max_connections"] => Some(self.gateway.max_connections.to_string()),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json_format"] => Some(self.logging.json_format.to_string()),
            // 密钥类字段不回显
            ["im", "robot_secret"] | ["agent", "token"] => None,
            _ => None,
        }
    }

    /// 设置配置值
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["im", "gateway_url"] => self.im.gateway_url = value.to_string(),
            ["im", "robot_id"] => self.im.robot_id = value.to_string(),
            ["im", "robot_secret"] => self.im.robot_secret = value.to_string(),
            ["im", "reconnect_interval_secs"] => self.im.reconnect_interval_secs = parse_number(value)?,
            ["im", "heartbeat_interval_secs"] => self.im.heartbeat_interval_secs = parse_number(value)?,
            ["im", "request_timeout_secs"] => self.im.request_timeout_secs = parse_number(value)?,
            ["agent", "url"] => self.agent.url = value.to_string(),
            ["agent", "token"] => {
                self.agent.token = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            ["agent", "reconnect_interval_secs"] => {
                self.agent.reconnect_interval_secs = parse_number(value)?;
            }
            ["agent", "heartbeat_interval_secs"] => {
                self.agent.heartbeat_interval_secs = parse_number(value)?;
            }
            ["agent", "max_reconnect_attempts"] => {
                self.agent.max_reconnect_attempts = parse_number(value)?;
            }
            ["agent", "session_key"] => self.agent.session_key = value.to_string(),
            ["session", "context_ttl_secs"] => self.session.context_ttl_secs = parse_number(value)?,
            ["group", "enabled"] => self.group.enabled = parse_bool(value)?,
            ["group", "respond_on_mention"] => self.group.respond_on_mention = parse_bool(value)?,
            ["group", "respond_on_question"] => self.group.respond_on_question = parse_bool(value)?,
            ["whitelist", "enabled"] => self.whitelist.enabled = parse_bool(value)?,
            ["gateway", "bind"] => self.gateway.bind = value.to_string(),
            ["gateway", "max_connections"] => self.gateway.max_connections = parse_number(value)?,
            ["logging", "level"] => self.logging.level = value.parse()?,
            ["logging", "json_format"] => self.logging.json_format = parse_bool(value)?,
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid number: {}", value)))
}

fn parse_bool(value: &str) -> ConfigResult<bool> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid boolean: {}", value)))
}

/// IM 网关连接配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImConfig {
    /// 网关地址 (e.g., "ws://localhost:8884/robot/gateway")
    pub gateway_url: String,
    pub robot_id: String,
    pub robot_secret: String,
    /// 重连间隔（秒）
    pub reconnect_interval_secs: u64,
    /// 心跳间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 请求超时（秒）
    pub request_timeout_secs: u64,
    /// 连接 + 认证超时（秒）
    pub connect_timeout_secs: u64,
}

impl Default for ImConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:8884/robot/gateway".to_string(),
            robot_id: String::new(),
            robot_secret: String::new(),
            reconnect_interval_secs: 5,
            heartbeat_interval_secs: 270,
            request_timeout_secs: 30,
            connect_timeout_secs: 30,
        }
    }
}

impl ImConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Agent 网关配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub url: String,
    /// 可选的认证 token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub reconnect_interval_secs: u64,
    /// 心跳（ping + 上下文清理）间隔（秒）
    pub heartbeat_interval_secs: u64,
    /// 最大重连次数
    pub max_reconnect_attempts: u32,
    /// 等待认证完成的超时（秒）
    pub auth_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// 默认会话 key
    pub session_key: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789".to_string(),
            token: None,
            reconnect_interval_secs: 5,
            heartbeat_interval_secs: 30,
            max_reconnect_attempts: 10,
            auth_timeout_secs: 10,
            request_timeout_secs: 30,
            session_key: "main".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 流式上下文配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// 上下文存活时间（秒）
    pub context_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_ttl_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }
}

/// 群聊响应策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupConfig {
    pub enabled: bool,
    /// 被 @ 时响应
    pub respond_on_mention: bool,
    /// 问句时响应
    pub respond_on_question: bool,
    /// 求助关键词
    pub help_keywords: Vec<String>,
    /// 始终响应的群
    #[serde(default)]
    pub allowed_ids: Vec<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            respond_on_mention: true,
            respond_on_question: true,
            help_keywords: ["帮", "请", "分析", "总结", "怎么", "如何"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            allowed_ids: Vec::new(),
        }
    }
}

/// 黑白名单
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WhitelistConfig {
    pub enabled: bool,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub blocked_users: Vec<String>,
    #[serde(default)]
    pub blocked_groups: Vec<String>,
}

/// 服务端网关配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    /// 绑定地址 (e.g., "127.0.0.1:8884")
    pub bind: String,
    /// 最大并发连接数
    pub max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8884".to_string(),
            max_connections: 1000,
        }
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging 配置
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// JSON 格式输出
    #[serde(default)]
    pub json_format: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Watch error: {0}")]
    #[cfg(feature = "hot-reload")]
    Watch(#[from] notify::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
