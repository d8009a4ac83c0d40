/// 统一配置系统
///
/// 提供TOML/JSON配置文件、环境变量覆盖和配置验证
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod services;
pub mod vm;

pub use services::{AssetConfig, StorageConfig};
pub use vm::{SchedulerConfig, VmConfig};

use crate::impl_default;

/// 配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    /// 文件读取错误
    #[error("Config file error: {0}")]
    FileError(#[from] std::io::Error),
    /// 解析错误
    #[error("Config parse error: {0}")]
    ParseError(String),
    /// 验证错误
    #[error("Config validation error: {0}")]
    ValidationError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// 桥接层主配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// VM 槽位与调用深度配置
    #[serde(default)]
    pub vm: VmConfig,

    /// 异步任务调度配置
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// 资源加载配置
    #[serde(default)]
    pub assets: AssetConfig,

    /// 键值存储配置
    #[serde(default)]
    pub storage: StorageConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BridgeConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 从TOML文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 从TOML字符串解析配置
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// 从JSON字符串解析配置
    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// 根据扩展名加载配置文件（`.json` 之外一律按 TOML 解析）
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    /// 保存为TOML文件
    pub fn save_toml<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 保存为JSON文件
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> ConfigResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        fs::write(path, content).map_err(ConfigError::FileError)
    }

    /// 从环境变量覆盖配置
    pub fn apply_env_overrides(&mut self) {
        // VM 配置
        if let Ok(val) = env::var("BRIDGE_VM_MAX_SLOTS") {
            if let Ok(max_slots) = val.parse() {
                self.vm.max_slots = max_slots;
            }
        }
        if let Ok(val) = env::var("BRIDGE_VM_MAX_CALL_DEPTH") {
            if let Ok(depth) = val.parse() {
                self.vm.max_call_depth = depth;
            }
        }

        // 调度配置
        if let Ok(val) = env::var("BRIDGE_SCHEDULER_WORKERS") {
            if let Ok(workers) = val.parse() {
                self.scheduler.worker_threads = workers;
            }
        }

        // 服务配置
        if let Ok(val) = env::var("BRIDGE_ASSET_ROOT") {
            self.assets.root = PathBuf::from(val);
        }
        if let Ok(val) = env::var("BRIDGE_STORAGE_PATH") {
            self.storage.path = Some(PathBuf::from(val));
        }

        // 日志配置
        if let Ok(val) = env::var("BRIDGE_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                self.logging.level = level;
            }
        }
    }

    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        self.vm.validate()?;
        self.scheduler.validate()?;
        self.assets.validate()?;
        Ok(())
    }

    /// 自动查找并加载配置文件
    ///
    /// 按以下顺序查找：
    /// 1. ./bridge.toml
    /// 2. ./bridge.json
    /// 3. <用户配置目录>/slot_bridge/bridge.toml
    /// 4. 使用默认配置
    pub fn load_or_default() -> Self {
        if let Ok(config) = Self::from_toml_file("bridge.toml") {
            tracing::info!(target: "bridge", "Loaded config from bridge.toml");
            return config;
        }

        if let Ok(config) = Self::from_json_file("bridge.json") {
            tracing::info!(target: "bridge", "Loaded config from bridge.json");
            return config;
        }

        if let Some(dir) = dirs::config_dir() {
            let config_path = dir.join("slot_bridge").join("bridge.toml");
            if let Ok(config) = Self::from_toml_file(&config_path) {
                tracing::info!(target: "bridge", "Loaded config from {:?}", config_path);
                return config;
            }
        }

        tracing::info!(target: "bridge", "Using default configuration");
        Self::default()
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（`RUST_LOG` 优先）
    pub level: LogLevel,

    /// 是否输出到控制台
    pub log_to_console: bool,
}

impl_default!(LoggingConfig {
    level: LogLevel::Info,
    log_to_console: true,
});

impl LoggingConfig {
    /// 安装全局 tracing 订阅器，重复调用无副作用
    pub fn install(&self) {
        if !self.log_to_console {
            return;
        }
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(self.level.as_filter()));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// 跟踪
    Trace,
    /// 调试
    Debug,
    /// 信息
    Info,
    /// 警告
    Warn,
    /// 错误
    Error,
}

impl LogLevel {
    /// 解析不区分大小写的级别名称
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// 对应的 `EnvFilter` 指令
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}
