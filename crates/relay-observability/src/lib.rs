//! Relay Observability
//!
//! 日志订阅者安装、运行时调级，以及各 crate 共用的指标记录器。
//! 库代码只依赖 `metrics` 模块和 span 辅助函数；安装订阅者是二进制的事。

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{Config, LoggingConfig};
pub use error::{ObservabilityError, Result};
pub use logging::LogManager;
pub use metrics::MetricsCollector;

use parking_lot::Mutex;

/// 进程级观测性句柄，由二进制在启动时创建一次
#[derive(Debug)]
pub struct Observability {
    logs: Mutex<LogManager>,
    metrics: MetricsCollector,
}

impl Observability {
    /// 安装日志订阅者并注册指标描述
    pub fn init(config: Config) -> Result<Self> {
        let logs = LogManager::new(&config)?;
        let metrics = MetricsCollector::new(&config);
        Ok(Self {
            logs: Mutex::new(logs),
            metrics,
        })
    }

    /// 当前基础日志级别
    pub fn log_level(&self) -> String {
        self.logs.lock().config().level.clone()
    }

    /// 运行时调整日志级别
    pub fn update_log_level(&self, level: &str) -> Result<()> {
        self.logs.lock().update_level(level)
    }

    /// 指标收集器
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}
