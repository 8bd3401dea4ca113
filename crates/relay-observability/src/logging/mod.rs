//! 结构化日志
//!
//! 安装全局 tracing 订阅者，过滤器可在运行时替换（配置热重载时调整级别）。

use tracing_subscriber::{
    layer::SubscriberExt,
    reload::{self, Handle},
    util::SubscriberInitExt,
    EnvFilter, Registry,
};

use crate::config::{Config, LoggingConfig};
use crate::error::{ObservabilityError, Result};

type FilterHandle = Handle<EnvFilter, Registry>;

/// 已安装的日志订阅者
#[derive(Debug)]
pub struct LogManager {
    config: LoggingConfig,
    filter: FilterHandle,
}

impl LogManager {
    /// 安装全局日志订阅者，每个进程只能成功一次
    pub fn new(config: &Config) -> Result<Self> {
        let config = config.logging.clone();
        let (filter_layer, filter) = reload::Layer::new(build_filter(&config.level, &config)?);
        let registry = tracing_subscriber::registry().with(filter_layer);

        let installed = if config.json_format {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_file(config.with_location)
                .with_line_number(config.with_location)
                .with_ansi(false);
            registry.with(layer).try_init()
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_file(config.with_location)
                .with_line_number(config.with_location)
                .with_ansi(config.ansi);
            registry.with(layer).try_init()
        };
        installed.map_err(|e| ObservabilityError::SubscriberInstall(e.to_string()))?;

        tracing::info!(target: "relay_observability", level = %config.level, json = config.json_format, "Logging initialized");
        Ok(Self { config, filter })
    }

    /// 替换基础级别，模块指令保持不变
    pub fn update_level(&mut self, level: &str) -> Result<()> {
        if level == self.config.level {
            return Ok(());
        }
        let filter = build_filter(level, &self.config)?;
        self.filter
            .reload(filter)
            .map_err(|e| ObservabilityError::Reload(e.to_string()))?;

        tracing::info!(target: "relay_observability", from = %self.config.level, to = %level, "Log level updated");
        self.config.level = level.to_string();
        Ok(())
    }

    /// 获取当前配置
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }
}

/// 基础级别在前，模块指令依次追加
fn build_filter(level: &str, config: &LoggingConfig) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(level).map_err(|e| ObservabilityError::invalid_filter(level, e))?;

    for (module, module_level) in &config.module_levels {
        let directive = format!("{}={}", module, module_level);
        let parsed = directive
            .parse()
            .map_err(|e| ObservabilityError::invalid_filter(&directive, e))?;
        filter = filter.add_directive(parsed);
    }

    Ok(filter)
}

/// 单条 WebSocket 连接的 span
pub fn connection_span(peer: &str, url: &str) -> tracing::Span {
    tracing::info_span!("connection", peer = %peer, url = %url)
}

/// 服务端会话的 span
pub fn session_span(session_id: &str, identity: Option<&str>) -> tracing::Span {
    if let Some(identity) = identity {
        tracing::info_span!("session", session_id = %session_id, identity = %identity)
    } else {
        tracing::info_span!("session", session_id = %session_id)
    }
}

/// 一次异步 agent 运行的 span
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("run", run_id = %run_id)
}
