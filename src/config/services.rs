/// 原生服务配置

use super::{ConfigError, ConfigResult};
use crate::impl_default;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 资源加载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// 资源根目录，脚本中的绝对路径相对于此目录
    pub root: PathBuf,

    /// 分块读取大小（字节），每块上报一次进度
    pub chunk_size: usize,
}

impl_default!(AssetConfig {
    root: PathBuf::from("assets"),
    chunk_size: 64 * 1024,
});

impl AssetConfig {
    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "chunk_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// 键值存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 存储键前缀
    pub key_prefix: String,

    /// 持久化文件路径，`None` 表示仅保存在内存中
    pub path: Option<PathBuf>,
}

impl_default!(StorageConfig {
    key_prefix: "sock_".to_string(),
    path: None,
});
