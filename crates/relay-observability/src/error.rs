//! 观测性错误

/// 日志与指标初始化、更新时的错误
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ObservabilityError {
    /// 级别或模块指令无法解析
    #[error("Invalid log filter '{directive}': {reason}")]
    InvalidFilter {
        /// 出错的指令
        directive: String,
        /// 解析器给出的原因
        reason: String,
    },

    /// 全局订阅者已被安装（每个进程只能安装一次）
    #[error("Failed to install log subscriber: {0}")]
    SubscriberInstall(String),

    /// 运行时替换过滤器失败
    #[error("Failed to reload log filter: {0}")]
    Reload(String),
}

impl ObservabilityError {
    pub(crate) fn invalid_filter(directive: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidFilter {
            directive: directive.into(),
            reason: reason.to_string(),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, ObservabilityError>;
