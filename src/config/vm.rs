/// VM 与调度配置

use super::{ConfigError, ConfigResult};
use crate::impl_default;
use serde::{Deserialize, Serialize};

/// VM 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// 新建 VM 时预留的槽位数
    pub initial_slots: usize,

    /// 槽位区的最大容量
    pub max_slots: usize,

    /// 宿主与 VM 互相调用的最大嵌套深度
    pub max_call_depth: usize,

    /// 编组列表/映射时允许的最大嵌套深度
    pub marshal_max_depth: usize,
}

impl_default!(VmConfig {
    initial_slots: 8,
    max_slots: 256,
    max_call_depth: 64,
    marshal_max_depth: 32,
});

impl VmConfig {
    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        // resolve_(_,_) 至少需要三个槽位
        if self.max_slots < 3 {
            return Err(ConfigError::ValidationError(
                "max_slots must be at least 3".to_string(),
            ));
        }
        if self.initial_slots > self.max_slots {
            return Err(ConfigError::ValidationError(
                "initial_slots exceeds max_slots".to_string(),
            ));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::ValidationError(
                "max_call_depth must be positive".to_string(),
            ));
        }
        if self.marshal_max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "marshal_max_depth must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// 异步任务调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 工作线程数，0 表示使用 CPU 核心数
    pub worker_threads: usize,

    /// 工作线程名称
    pub thread_name: String,
}

impl_default!(SchedulerConfig {
    worker_threads: 0,
    thread_name: "bridge-io".to_string(),
});

impl SchedulerConfig {
    /// 验证配置
    pub fn validate(&self) -> ConfigResult<()> {
        if self.thread_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// 实际使用的工作线程数
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}
