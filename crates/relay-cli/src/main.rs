use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use relay_bridge::Bridge;
use relay_config::{Config, ConfigManager};
use relay_observability::Observability;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Relay between an IM robot gateway and an agent gateway")]
#[command(version)]
struct Cli {
    /// Config file path
    #[arg(long, env = "RELAY_CONFIG", default_value = "~/.relay/config.json")]
    config: String,

    /// Log level or filter directives (overrides config)
    #[arg(long, env = "RUST_LOG")]
    log_level: Option<String>,

    /// Emit logs as JSON (overrides config)
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行桥接，直到 Ctrl-C
    Bridge {
        /// Disable config hot-reload
        #[arg(long, default_value = "false")]
        no_watch: bool,
    },
    /// 配置管理命令
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// 显示当前配置
    Show,
    /// 获取配置值
    Get {
        /// 配置键 (如: agent.url, session.context_ttl_secs)
        key: String,
    },
    /// 设置配置值
    Set {
        /// 配置键 (如: agent.url, session.context_ttl_secs)
        key: String,
        /// 配置值
        value: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = relay_config::expand_tilde(&cli.config).unwrap_or_else(|| PathBuf::from(&cli.config));
    let manager = ConfigManager::load(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    match cli.command {
        Commands::Bridge { no_watch } => {
            let config = manager.snapshot().await;
            let observability = Arc::new(init_observability(&config, cli.log_level.as_deref(), cli.json_logs)?);
            run_bridge(manager, config, observability, no_watch).await
        }
        Commands::Config(args) => handle_config(args, &manager).await,
    }
}

fn init_observability(config: &Config, log_level: Option<&str>, json_logs: bool) -> anyhow::Result<Observability> {
    let mut settings = relay_observability::Config::from(&config.logging);
    if let Some(level) = log_level {
        settings = settings.with_log_level(level);
    }
    if json_logs {
        settings = settings.with_json_format(true);
    }
    Ok(Observability::init(settings)?)
}

async fn run_bridge(
    mut manager: ConfigManager,
    config: Config,
    observability: Arc<Observability>,
    no_watch: bool,
) -> anyhow::Result<()> {
    ConfigManager::validate(&config)?;

    info!("Starting relay bridge");
    info!("  IM gateway: {}", config.im.gateway_url);
    info!("  Robot: {}", config.im.robot_id);
    info!("  Agent gateway: {}", config.agent.url);
    info!("  Session key: {}", config.agent.session_key);

    // Only the log level applies live; bridge settings take effect on restart.
    if !no_watch {
        let observability = Arc::clone(&observability);
        if let Err(e) = manager.watch(move |config| {
            info!("Config hot-reloaded");
            if let Err(e) = observability.update_log_level(config.logging.level.as_str()) {
                warn!("Failed to apply log level: {}", e);
            }
        }) {
            warn!("Failed to start config watcher: {}", e);
        }
    }

    let bridge = Bridge::new(config);
    bridge.start().await.context("Failed to start bridge")?;

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let stats = bridge.stats();
    info!(
        received = stats.messages_received,
        forwarded = stats.messages_forwarded,
        filtered = stats.messages_filtered,
        replies = stats.replies_sent,
        failed = stats.replies_failed,
        "Bridge statistics"
    );
    bridge.stop().await;

    if let Err(e) = manager.unwatch() {
        error!("Failed to stop config watcher: {}", e);
    }
    Ok(())
}

async fn handle_config(args: ConfigArgs, manager: &ConfigManager) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Show => {
            let mut value = serde_json::to_value(manager.snapshot().await)?;
            for (section, key) in [("im", "robot_secret"), ("agent", "token")] {
                if let Some(field) = value.get_mut(section).and_then(|s| s.get_mut(key)) {
                    if !field.is_null() {
                        *field = serde_json::Value::String("***".to_string());
                    }
                }
            }

            println!("{}", "📋 Current Configuration:".cyan().bold());
            println!("{}", format!("   {:?}", manager.path()).dimmed());
            println!();
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        ConfigCommands::Get { key } => match manager.snapshot().await.get_value(&key) {
            Some(value) => println!("{}", format!("{} = {}", key, value).green()),
            None => anyhow::bail!("Key not found: {}", key),
        },
        ConfigCommands::Set { key, value } => {
            manager.update(|config| config.set_value(&key, &value)).await?;
            println!("{}", format!("✅ Set {} = {}", key, value).green());
        }
    }
    Ok(())
}
