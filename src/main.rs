//! curium 命令行程序
//!
//! 运行一个监听节点，或向总线上的节点发送查询

mod cli;
mod error;
mod observability;

use clap::Parser;
use curium_common::{ConfigError, CuriumConfig, CuriumResult};
use curium_node::{ALL_CHANNEL, AnyCommand, GetNodeInfos, Node, NodeInfos, Responses};
use observability::init_observability;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{error, info, warn};

macro_rules! bootstrap_info {
    ($($arg:tt)*) => {
        println!($($arg)*);
    };
}

macro_rules! bootstrap_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

use cli::{Cli, Commands};
use error::{Error, Result};

const DEFAULT_CONFIG: &str = "curium.toml";

/// Application launcher utilities
struct ApplicationLauncher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Test { config_file }) => {
            let config_path =
                ApplicationLauncher::find_config_file(config_file.as_ref().unwrap_or(&cli.config))?;
            ApplicationLauncher::test_config_file(&config_path)
        }
        Some(Commands::Listen { channels }) => {
            let config = ApplicationLauncher::load_config(&cli.config)?;
            ApplicationLauncher::runtime()?
                .block_on(ApplicationLauncher::run_listener(config, channels))
        }
        Some(Commands::Nodes { timeout_ms }) => {
            let config = ApplicationLauncher::load_config(&cli.config)?;
            ApplicationLauncher::runtime()?
                .block_on(ApplicationLauncher::run_nodes_query(config, *timeout_ms))
        }
        None => {
            let config = ApplicationLauncher::load_config(&cli.config)?;
            ApplicationLauncher::runtime()?
                .block_on(ApplicationLauncher::run_listener(config, &[]))
        }
    }
}

impl ApplicationLauncher {
    fn runtime() -> Result<tokio::runtime::Runtime> {
        Ok(tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?)
    }

    /// Find config file with fallback locations
    fn find_config_file(provided_path: &PathBuf) -> Result<PathBuf> {
        // If the provided path is not the default, check if it exists
        if provided_path != Path::new(DEFAULT_CONFIG) {
            if provided_path.exists() {
                bootstrap_info!("Using provided config file: {:?}", provided_path);
                return Ok(provided_path.clone());
            } else {
                bootstrap_error!("Provided config file not found: {:?}", provided_path);
                return Err(Error::custom(format!(
                    "Config file not found: {provided_path:?}"
                )));
            }
        }

        let fallback_paths = vec![
            // 1. Current working directory
            PathBuf::from(DEFAULT_CONFIG),
            // 2. System config directory
            PathBuf::from("/etc/curium/curium.toml"),
        ];

        bootstrap_info!("Searching for config file in default locations...");

        for path in &fallback_paths {
            if path.exists() {
                bootstrap_info!("Found config file: {:?}", path);
                return Ok(path.clone());
            } else {
                bootstrap_info!("Config not found at: {:?}", path);
            }
        }

        bootstrap_error!("No configuration file found!");
        bootstrap_error!("Please create a config file in one of these locations:");
        for (i, path) in fallback_paths.iter().enumerate() {
            bootstrap_error!("  {}. {:?}", i + 1, path);
        }
        bootstrap_error!("Or specify a custom path with: curium --config <path>");

        Err(Error::custom(
            "No configuration file found. Please create one or specify path with --config",
        ))
    }

    /// 测试配置文件是否有效
    fn test_config_file(config_path: &Path) -> Result<()> {
        // Initialize basic logging for test command
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();

        match CuriumConfig::from_file(config_path) {
            Ok(config) => {
                info!("✅ 配置文件解析成功: {:?}", config_path);

                match config.validate() {
                    Ok(()) => {
                        info!("✅ 配置验证通过");
                    }
                    Err(errors) => {
                        warn!("配置验证发现问题:");
                        for (i, err) in errors.iter().enumerate() {
                            if err.starts_with("Warning:") {
                                warn!("  {}. ⚠️  {}", i + 1, err);
                            } else {
                                error!("  {}. ❌ {}", i + 1, err);
                            }
                        }
                        let has_errors = errors.iter().any(|e| !e.starts_with("Warning:"));
                        if has_errors {
                            return Err(Error::config_validation("配置验证失败"));
                        }
                    }
                }

                info!("✅ 完整配置验证通过");
                Ok(())
            }
            Err(e) => {
                error!("❌ 配置文件解析失败: {}", e);
                Err(Error::config_validation(format!("配置解析失败: {e}")))
            }
        }
    }

    /// 查找、加载并验证配置
    fn load_config(provided_path: &PathBuf) -> Result<CuriumConfig> {
        let config_path = Self::find_config_file(provided_path)?;
        bootstrap_info!("📄 加载配置文件: {:?}", config_path);

        let config = CuriumConfig::from_file(&config_path).map_err(|e| {
            bootstrap_error!("❌ 配置加载失败: {}", e);
            Error::custom(format!("配置加载失败: {e}"))
        })?;

        match config.validate_strict() {
            Ok(warnings) => {
                for (i, warning) in warnings.iter().enumerate() {
                    bootstrap_info!("  {}. ⚠️  {}", i + 1, warning);
                }
            }
            Err(e) => {
                bootstrap_error!("❌ 配置验证发现问题:");
                if let ConfigError::Validation { errors } = &e {
                    for (i, err) in errors.iter().enumerate() {
                        bootstrap_error!("  {}. {}", i + 1, err);
                    }
                }
                return Err(Error::config_validation("配置验证失败，请修复上述错误"));
            }
        }

        bootstrap_info!("✅ 配置加载成功");
        Ok(config)
    }

    /// 连接节点并执行收到的命令，直到 Ctrl-C
    async fn run_listener(config: CuriumConfig, channels: &[String]) -> Result<()> {
        let _observability_guard = init_observability(&config)?;
        info!("🚀 启动 curium 节点: {}", config.name);

        let node = Node::from_config(&config)?;
        node.set_error_handler(|cmd: &dyn AnyCommand, e: &anyhow::Error| {
            error!("命令 {} 执行失败: {:#}", cmd.name(), e);
        });
        node.connect(config.node.send_only)
            .await
            .map_err(|e| Error::node_startup(format!("连接后端失败: {e}")))?;

        for channel in channels {
            node.join(channel).await?;
            info!("  - 已加入频道: {}", channel);
        }

        info!(
            "✅ 节点 {} 正在监听 (send_only: {})",
            node.nid()?,
            config.node.send_only
        );

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听Ctrl-C信号: {}", e);
        } else {
            info!("收到Ctrl-C信号，开始优雅关闭...");
        }

        node.close().await?;
        info!("🛑 节点已安全关闭");
        Ok(())
    }

    /// 查询总线上所有节点的 ID
    async fn run_nodes_query(config: CuriumConfig, timeout_ms: Option<u64>) -> Result<()> {
        let _observability_guard = init_observability(&config)?;

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| config.node.response_timeout());

        let node = Node::from_config(&config)?;
        node.connect(true)
            .await
            .map_err(|e| Error::node_startup(format!("连接后端失败: {e}")))?;

        let result = Self::query_node_infos(&node, timeout).await;
        node.close().await?;
        let responses = result?;

        if !responses.finished {
            warn!("Not every node answered within {:?}", timeout);
        }
        for info in &responses.values {
            println!("{}", info.nid);
        }
        info!("{} node(s) answered", responses.values.len());
        Ok(())
    }

    async fn query_node_infos(
        node: &Node,
        timeout: Duration,
    ) -> CuriumResult<Responses<NodeInfos>> {
        let handle = node
            .send(&GetNodeInfos {}, &[ALL_CHANNEL], None, Some(timeout))
            .await?;
        handle.wait().await
    }
}
