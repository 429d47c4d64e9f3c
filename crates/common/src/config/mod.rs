//! 统一配置管理系统
//!
//! 本模块是 curium 节点与命令行工具配置的"单一真理之源"。
//! 所有配置项的定义、文档、默认值都在这里统一管理。

pub mod node;
pub mod redis;

pub use crate::config::node::NodeConfig;
pub use crate::config::redis::RedisConfig;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// curium 的主配置结构体
///
/// 配置文件使用 TOML 格式，所有段都有默认值，空文件即是一份可用配置。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CuriumConfig {
    /// 实例名称
    ///
    /// 仅用于日志中区分不同进程，不参与节点寻址。
    #[serde(default = "default_name")]
    pub name: String,

    /// Redis 后端配置
    #[serde(default)]
    pub redis: RedisConfig,

    /// 节点行为配置
    #[serde(default)]
    pub node: NodeConfig,

    /// 可观测性配置（日志）
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// 可观测性配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObservabilityConfig {
    /// 过滤级别
    ///
    /// 支持 EnvFilter 语法（如 "info,redis=warn"）。默认值 "info"。
    #[serde(default = "default_filter_level")]
    pub filter_level: String,

    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    /// 日志输出目标
    ///
    /// - "console": 仅输出到控制台（默认）
    /// - "file": 输出到文件
    #[serde(default = "default_log_output")]
    pub output: String,

    /// 日志轮转开关
    ///
    /// 当 output = "file" 时有效：
    /// - true: 按天轮转日志文件
    /// - false: 追加到单个文件
    #[serde(default)]
    pub rotate: bool,

    /// 日志文件目录
    ///
    /// 当 output = "file" 时有效
    #[serde(default = "default_log_path")]
    pub path: String,
}

impl Default for CuriumConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            redis: RedisConfig::default(),
            node: NodeConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            rotate: false,
            path: default_log_path(),
        }
    }
}

fn default_name() -> String {
    "curium".to_string()
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_path() -> String {
    "logs/".to_string()
}

fn default_filter_level() -> String {
    "info".to_string()
}

impl CuriumConfig {
    /// 返回可观测性配置引用
    pub fn observability_config(&self) -> &ObservabilityConfig {
        &self.observability
    }

    /// 检查是否使用控制台日志输出
    pub fn is_console_logging(&self) -> bool {
        self.observability.log.output == "console"
    }

    /// 检查是否应该轮转日志
    pub fn should_rotate_logs(&self) -> bool {
        self.observability.log.output == "file" && self.observability.log.rotate
    }

    /// 获取日志过滤级别，优先使用 RUST_LOG
    pub fn get_filter_level(&self) -> String {
        std::env::var("RUST_LOG")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.observability.filter_level.clone())
    }

    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(ConfigError::FileNotFound {
                path: path_ref.display().to_string(),
            });
        }

        if !path_ref.is_file() {
            return Err(ConfigError::NotAFile {
                path: path_ref.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(path_ref)?;
        Self::from_toml(&content)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// 将配置序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// 验证配置有效性
    ///
    /// 返回发现的全部问题。以 `Warning:` 开头的条目不影响启动。
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name cannot be empty".to_string());
        }

        self.redis.validate_into(&mut errors);
        self.node.validate_into(&mut errors);

        match self.observability.log.output.as_str() {
            "console" | "file" => {}
            other => errors.push(format!(
                "observability.log.output must be \"console\" or \"file\", got: {other}"
            )),
        }

        if self.observability.log.output == "file" && self.observability.log.path.trim().is_empty()
        {
            errors.push("observability.log.path cannot be empty when output = \"file\"".to_string());
        }

        if self.observability.log.rotate && self.observability.log.output == "console" {
            errors.push(
                "Warning: observability.log.rotate has no effect when output = \"console\""
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// 验证配置，只把非警告问题视为失败
    pub fn validate_strict(&self) -> Result<Vec<String>, ConfigError> {
        match self.validate() {
            Ok(()) => Ok(Vec::new()),
            Err(errors) => split_warnings(errors),
        }
    }
}

/// 含有非警告条目时失败，否则返回全部警告
pub(crate) fn split_warnings(errors: Vec<String>) -> Result<Vec<String>, ConfigError> {
    if errors.iter().any(|e| !e.starts_with("Warning:")) {
        Err(ConfigError::Validation { errors })
    } else {
        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = CuriumConfig::from_toml("").unwrap();
        assert_eq!(config.name, "curium");
        assert_eq!(config.redis.url, "redis://127.0.0.1:6379/0");
        assert_eq!(config.redis.namespace, "curium");
        assert_eq!(config.redis.expire_secs, 600);
        assert!(!config.node.send_only);
        assert!(config.is_console_logging());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            name = "worker-1"

            [redis]
            url = "redis://redis:6379/2"
            namespace = "jobs"
            expire_secs = 30
            refresh_interval_ms = 500

            [node]
            send_only = true
            response_timeout_ms = 2000

            [observability]
            filter_level = "debug"

            [observability.log]
            output = "file"
            rotate = true
            path = "/var/log/curium"
        "#;

        let config = CuriumConfig::from_toml(toml).unwrap();
        assert_eq!(config.name, "worker-1");
        assert_eq!(config.redis.namespace, "jobs");
        assert_eq!(config.redis.expire().as_secs(), 30);
        assert_eq!(config.redis.refresh_interval().as_millis(), 500);
        assert!(config.node.send_only);
        assert_eq!(config.node.response_timeout().as_millis(), 2000);
        assert_eq!(config.node.recv_poll_ms, 1000);
        assert!(config.should_rotate_logs());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let mut config = CuriumConfig::default();
        config.redis.url = "http://localhost".to_string();
        config.redis.namespace = "a|b".to_string();
        config.redis.expire_secs = 0;
        config.observability.log.output = "syslog".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(errors.iter().all(|e| !e.starts_with("Warning:")));
        assert!(config.validate_strict().is_err());
    }

    #[test]
    fn test_refresh_interval_longer_than_expiry_is_warning() {
        let mut config = CuriumConfig::default();
        config.redis.expire_secs = 1;
        config.redis.refresh_interval_ms = 1500;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Warning:"));
        assert_eq!(config.validate_strict().unwrap().len(), 1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = CuriumConfig::default();
        config.name = "roundtrip".to_string();
        config.node.send_only = true;

        let text = config.to_toml().unwrap();
        let parsed = CuriumConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.name, "roundtrip");
        assert!(parsed.node.send_only);
    }

    #[test]
    fn test_from_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            CuriumConfig::from_file(&missing),
            Err(ConfigError::FileNotFound { .. })
        ));
        assert!(matches!(
            CuriumConfig::from_file(dir.path()),
            Err(ConfigError::NotAFile { .. })
        ));

        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "name = [\n").unwrap();
        assert!(matches!(
            CuriumConfig::from_file(&bad),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    #[serial]
    fn test_rust_log_takes_precedence() {
        let config = CuriumConfig::default();

        // SAFETY: serialized test, no other thread reads the environment
        unsafe { std::env::set_var("RUST_LOG", "trace") };
        assert_eq!(config.get_filter_level(), "trace");

        unsafe { std::env::set_var("RUST_LOG", "  ") };
        assert_eq!(config.get_filter_level(), "info");

        unsafe { std::env::remove_var("RUST_LOG") };
        assert_eq!(config.get_filter_level(), "info");
    }
}
