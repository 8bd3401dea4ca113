//! 配置文件的加载、落盘与热重载

use crate::config::{Config, ConfigError, ConfigResult};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 共享的配置及其文件位置
#[derive(Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: Arc<RwLock<Config>>,
    #[cfg(feature = "hot-reload")]
    watcher: Option<Arc<std::sync::Mutex<notify::RecommendedWatcher>>>,
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigManager").field("path", &self.path).finish_non_exhaustive()
    }
}

impl ConfigManager {
    /// 读取配置；文件不存在时写入默认配置。
    ///
    /// 不做校验，这样 `config set` 仍能修复一份无效的文件；运行前由调用方
    /// 调用 [`validate`](Self::validate)。
    pub async fn load(path: &Path) -> ConfigResult<Self> {
        let config = match tokio::fs::try_exists(path).await? {
            true => {
                debug!(path = ?path, "Reading config");
                read_config(path).await?
            }
            false => {
                info!(path = ?path, "No config file, writing defaults");
                let config = Config::default();
                write_atomic(path, &serde_json::to_string_pretty(&config)?).await?;
                config
            }
        };
        Ok(Self::new(config, path.to_path_buf()))
    }

    /// 从 `~/.relay/config.json` 加载
    pub async fn load_default() -> ConfigResult<Self> {
        Self::load(&Self::default_config_path()?).await
    }

    pub fn default_config_path() -> ConfigResult<PathBuf> {
        crate::default_config_path().ok_or_else(|| ConfigError::InvalidPath("no home directory".to_string()))
    }

    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            path,
            config: Arc::new(RwLock::new(config)),
            #[cfg(feature = "hot-reload")]
            watcher: None,
        }
    }

    pub fn get(&self) -> Arc<RwLock<Config>> {
        Arc::clone(&self.config)
    }

    pub async fn snapshot(&self) -> Config {
        self.config.read().await.clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 写入临时文件后改名，读者不会看到半份配置
    pub async fn save(&self) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read().await)?;
        write_atomic(&self.path, &content).await?;
        debug!(path = ?self.path, "Config saved");
        Ok(())
    }

    /// 重新读取文件；新配置无效时保留旧配置
    pub async fn reload(&self) -> ConfigResult<()> {
        let fresh = read_config(&self.path).await?;
        Self::validate(&fresh)?;
        *self.config.write().await = fresh;
        info!(path = ?self.path, "Config reloaded");
        Ok(())
    }

    /// 在副本上修改，校验通过后替换并落盘
    pub async fn update<F>(&self, f: F) -> ConfigResult<()>
    where
        F: FnOnce(&mut Config) -> ConfigResult<()>,
    {
        {
            let mut current = self.config.write().await;
            let mut candidate = current.clone();
            f(&mut candidate)?;
            Self::validate(&candidate)?;
            *current = candidate;
        }
        self.save().await
    }

    /// 运行桥接前的完整性检查
    pub fn validate(config: &Config) -> ConfigResult<()> {
        let invalid = |msg: String| Err(ConfigError::Validation(msg));

        for (name, url) in [("im.gateway_url", &config.im.gateway_url), ("agent.url", &config.agent.url)] {
            if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                return invalid(format!("{} must be a ws:// or wss:// url, got '{}'", name, url));
            }
        }

        let durations = [
            ("im.reconnect_interval_secs", config.im.reconnect_interval_secs),
            ("im.heartbeat_interval_secs", config.im.heartbeat_interval_secs),
            ("im.request_timeout_secs", config.im.request_timeout_secs),
            ("im.connect_timeout_secs", config.im.connect_timeout_secs),
            ("agent.reconnect_interval_secs", config.agent.reconnect_interval_secs),
            ("agent.heartbeat_interval_secs", config.agent.heartbeat_interval_secs),
            ("agent.auth_timeout_secs", config.agent.auth_timeout_secs),
            ("agent.request_timeout_secs", config.agent.request_timeout_secs),
            ("session.context_ttl_secs", config.session.context_ttl_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, secs)| *secs == 0) {
            return invalid(format!("{} must be greater than 0", name));
        }

        if config.gateway.max_connections == 0 {
            return invalid("gateway.max_connections must be greater than 0".to_string());
        }
        Ok(())
    }

    /// 展开 `${VAR}` 与 `${VAR:-default}`；未设置且无默认值时报错
    pub fn expand_env_vars(content: &str) -> ConfigResult<String> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = match PATTERN.get() {
            Some(pattern) => pattern,
            None => {
                let compiled = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
                    .map_err(|e| ConfigError::Validation(e.to_string()))?;
                PATTERN.get_or_init(|| compiled)
            }
        };

        let mut expanded = String::with_capacity(content.len());
        let mut tail = 0;
        for caps in pattern.captures_iter(content) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = match (std::env::var(name.as_str()), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(default)) => default.as_str().to_string(),
                (Err(_), None) => return Err(ConfigError::EnvVarNotFound(name.as_str().to_string())),
            };
            expanded.push_str(&content[tail..whole.start()]);
            expanded.push_str(&value);
            tail = whole.end();
        }
        expanded.push_str(&content[tail..]);
        Ok(expanded)
    }
}

async fn read_config(path: &Path) -> ConfigResult<Config> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&ConfigManager::expand_env_vars(&raw)?)?)
}

async fn write_atomic(path: &Path, content: &str) -> ConfigResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, content).await?;
    tokio::fs::rename(&staging, path).await?;
    Ok(())
}

#[cfg(feature = "hot-reload")]
impl ConfigManager {
    /// 监听配置文件变化，重载成功后调用 `on_change`。必须在 tokio runtime 中调用。
    ///
    /// 监听的是所在目录：原子保存会用新文件替换旧文件。
    pub fn watch<F>(&mut self, on_change: F) -> ConfigResult<()>
    where
        F: Fn(&Config) + Send + Sync + 'static,
    {
        use notify::{RecommendedWatcher, RecursiveMode, Watcher};
        use std::time::Duration;

        let dir = match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir.to_path_buf(),
            None => PathBuf::from("."),
        };
        let file_name = self.path.file_name().map(|n| n.to_os_string());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                let Ok(event) = res else { return };
                let ours = event.paths.iter().any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours && (event.kind.is_modify() || event.kind.is_create()) {
                    let _ = tx.send(());
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        // 任务持有的副本不含 watcher；watcher 释放后通道关闭，任务退出
        let manager = Self {
            path: self.path.clone(),
            config: Arc::clone(&self.config),
            watcher: None,
        };
        self.watcher = Some(Arc::new(std::sync::Mutex::new(watcher)));

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                // 一次保存会触发多个事件
                tokio::time::sleep(Duration::from_millis(100)).await;
                while rx.try_recv().is_ok() {}

                match manager.reload().await {
                    Ok(()) => on_change(&*manager.config.read().await),
                    Err(e) => warn!("Ignoring config change: {}", e),
                }
            }
        });

        info!(path = ?self.path, "Watching config file");
        Ok(())
    }

    pub fn unwatch(&mut self) -> ConfigResult<()> {
        if let Some(watcher) = self.watcher.take() {
            use notify::Watcher;
            if let (Ok(mut watcher), Some(dir)) = (watcher.lock(), self.path.parent()) {
                let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
                watcher.unwatch(dir)?;
            }
            debug!(path = ?self.path, "Stopped watching config file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let manager = ConfigManager::load(&path).await.unwrap();
        let config = manager.snapshot().await;

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(config.im.gateway_url, "ws://localhost:8884/robot/gateway");
        assert_eq!(config.agent.url, "ws://127.0.0.1:18789");
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("RELAY_TEST_SECRET", "s3cret");

        let content = r#"{"secret": "${RELAY_TEST_SECRET}", "url": "${RELAY_TEST_UNSET_URL:-ws://fallback}", "empty": "${RELAY_TEST_UNSET_EMPTY:-}"}"#;
        let expanded = ConfigManager::expand_env_vars(content).unwrap();

        assert_eq!(
            expanded,
            r#"{"secret": "s3cret", "url": "ws://fallback", "empty": ""}"#
        );
    }

    #[test]
    fn test_env_var_missing() {
        let result = ConfigManager::expand_env_vars("${RELAY_TEST_DEFINITELY_UNSET}");
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(name)) if name == "RELAY_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(ConfigManager::validate(&config).is_ok());

        config.im.heartbeat_interval_secs = 0;
        assert!(ConfigManager::validate(&config).is_err());

        config.im.heartbeat_interval_secs = 270;
        config.agent.url = "http://127.0.0.1:18789".to_string();
        assert!(ConfigManager::validate(&config).is_err());
    }

    #[tokio::test]
    async fn test_update_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let manager = ConfigManager::load(&path).await.unwrap();

        manager
            .update(|config| config.set_value("im.robot_id", "robot-42"))
            .await
            .unwrap();

        let reloaded = ConfigManager::load(&path).await.unwrap();
        assert_eq!(reloaded.snapshot().await.im.robot_id, "robot-42");
    }

    #[tokio::test]
    async fn test_invalid_update_leaves_config_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let manager = ConfigManager::load(&path).await.unwrap();

        let result = manager
            .update(|config| config.set_value("gateway.max_connections", "0"))
            .await;
        assert!(matches!(result, Err(ConfigError::Validation(_))));
        assert_ne!(manager.snapshot().await.gateway.max_connections, 0);
    }

    #[tokio::test]
    async fn test_reload_keeps_previous_config_on_bad_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let manager = ConfigManager::load(&path).await.unwrap();
        manager.update(|config| config.set_value("agent.session_key", "ops")).await.unwrap();

        tokio::fs::write(&path, r#"{"agent": {"url": "http://nope"}}"#).await.unwrap();
        assert!(manager.reload().await.is_err());
        assert_eq!(manager.snapshot().await.agent.session_key, "ops");
    }
}
