//! 观测性配置
//!
//! 通常由 relay-config 的 `logging` 段转换得到，命令行参数再覆盖。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 观测性配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 日志配置
    pub logging: LoggingConfig,

    /// 是否注册指标描述
    pub metrics_enabled: bool,
}

impl Config {
    /// 设置日志级别或完整的过滤指令
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.logging.level = level.into();
        self
    }

    /// 设置是否使用 JSON 格式
    pub fn with_json_format(mut self, json: bool) -> Self {
        self.logging.json_format = json;
        self
    }

    /// 覆盖某个模块的日志级别
    pub fn with_module_level(mut self, module: impl Into<String>, level: impl Into<String>) -> Self {
        self.logging.module_levels.insert(module.into(), level.into());
        self
    }
}

#[cfg(feature = "relay-config")]
impl From<&relay_config::LoggingConfig> for Config {
    fn from(logging: &relay_config::LoggingConfig) -> Self {
        Self {
            metrics_enabled: true,
            ..Self::default()
        }
        .with_log_level(logging.level.as_str())
        .with_json_format(logging.json_format)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 基础级别（trace..error）或 EnvFilter 指令
    pub level: String,

    /// JSON 输出，适合日志采集
    pub json_format: bool,

    /// 追加在基础级别之后的模块指令
    pub module_levels: BTreeMap<String, String>,

    /// 终端输出是否带颜色
    pub ansi: bool,

    /// 是否输出文件名和行号
    pub with_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        // WebSocket 库在 debug 级别下逐帧输出
        let module_levels = [("tungstenite", "warn"), ("tokio_tungstenite", "warn")]
            .into_iter()
            .map(|(module, level)| (module.to_string(), level.to_string()))
            .collect();

        Self {
            level: "info".to_string(),
            json_format: false,
            module_levels,
            ansi: true,
            with_location: false,
        }
    }
}
