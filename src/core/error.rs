//! 统一错误处理模块
//!
//! 提供桥接层范围内的统一错误类型定义
//!
//! ## 错误类型分层
//!
//! - **槽位错误** (`SlotError`): 槽位越界、类型标签不匹配、句柄失效
//! - **编组错误** (`MarshalError`): 宿主值与槽位值之间的转换失败
//! - **绑定错误** (`BindingError`): 外部方法/类的注册缺失或签名错误
//! - **脚本错误** (`ScriptError`): VM 编译错误、运行时错误
//! - **异步错误** (`AsyncError`): 异步解析桥的生命周期错误
//!
//! `BridgeError` 汇总以上所有错误，外部方法回调统一返回 `BridgeResult<()>`。

use crate::vm::{HandleId, SlotType};
use thiserror::Error;

/// 桥接层核心错误类型
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Slot error: {0}")]
    Slot(#[from] SlotError),

    #[error("Marshal error: {0}")]
    Marshal(#[from] MarshalError),

    #[error("Binding error: {0}")]
    Binding(#[from] BindingError),

    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    #[error("Async error: {0}")]
    Async(#[from] AsyncError),

    #[error("Config error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// 外部方法检测到非法参数，终止当前 fiber
    #[error("{0}")]
    Abort(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("General error: {0}")]
    General(String),
}

impl BridgeError {
    /// 构造一个 fiber 终止错误
    pub fn abort(message: impl Into<String>) -> Self {
        Self::Abort(message.into())
    }

    /// 作为 fiber 终止消息展示给脚本作者的文本
    ///
    /// `Abort` 原样返回消息，其余错误使用完整的 `Display` 输出。
    pub fn abort_message(&self) -> String {
        match self {
            Self::Abort(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

/// 槽位访问错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SlotError {
    #[error("slot {slot} is out of range (slot count is {count})")]
    OutOfRange { slot: usize, count: usize },

    #[error("cannot ensure {requested} slots, capacity is {max}")]
    CapacityExceeded { requested: usize, max: usize },

    #[error("slot {slot} holds {found:?}, expected {expected:?}")]
    TypeMismatch {
        slot: usize,
        expected: SlotType,
        found: SlotType,
    },

    #[error("slot {slot} does not hold valid UTF-8 text")]
    InvalidUtf8 { slot: usize },

    #[error("index {index} out of bounds for length {count}")]
    IndexOutOfBounds { index: i64, count: usize },

    #[error("handle {0:?} does not belong to this VM")]
    ForeignHandle(HandleId),

    #[error("handle {0:?} was issued by a VM that has been torn down")]
    TornDown(HandleId),

    #[error("module '{module}' has no variable '{name}'")]
    UnknownVariable { module: String, name: String },

    #[error("slot {slot} does not hold a class")]
    NotAClass { slot: usize },
}

/// 编组错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MarshalError {
    #[error(transparent)]
    Slot(#[from] SlotError),

    /// 宿主值类型不被边界接受（显式失败，不会静默转换为 null）
    #[error("unsupported value type: {0}")]
    UnsupportedType(String),

    #[error("value nesting exceeds the maximum depth of {0}")]
    DepthExceeded(usize),
}

/// 外部绑定错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindingError {
    #[error("no foreign method bound for {0}")]
    MissingMethod(String),

    #[error("foreign class {module}:{class} has no allocator")]
    MissingClass { module: String, class: String },

    #[error("malformed signature '{0}'")]
    InvalidSignature(String),

    #[error("{} unresolved foreign declaration(s): {}", .0.len(), .0.join(", "))]
    Unresolved(Vec<String>),
}

/// 脚本系统错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Script compilation error: [{module} line {line}] {message}")]
    Compilation {
        module: String,
        line: u32,
        message: String,
    },

    #[error("Script runtime error: {message}")]
    Runtime {
        message: String,
        stack: Vec<crate::scripting::StackFrame>,
    },

    #[error("Script call already failed; no further re-entry is allowed")]
    AlreadyFailed,

    #[error("Script module not found: {0}")]
    ModuleNotFound(String),
}

/// 异步解析桥错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsyncError {
    #[error("async bridge has been torn down")]
    TornDown,

    #[error("a VM re-entry is already in progress")]
    ReentryInProgress,

    #[error("unknown async operation {0}")]
    UnknownOperation(u64),

    #[error("host scheduler has shut down")]
    SchedulerShutdown,
}

/// 桥接层结果类型别名
pub type BridgeResult<T> = Result<T, BridgeError>;
pub type SlotResult<T> = Result<T, SlotError>;
pub type MarshalResult<T> = Result<T, MarshalError>;
pub type BindingResult<T> = Result<T, BindingError>;
pub type ScriptResult<T> = Result<T, ScriptError>;
pub type AsyncResult<T> = Result<T, AsyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let slot_err = SlotError::OutOfRange { slot: 4, count: 2 };
        let bridge_err: BridgeError = slot_err.into();
        assert!(matches!(bridge_err, BridgeError::Slot(_)));

        let marshal_err: MarshalError = SlotError::InvalidUtf8 { slot: 1 }.into();
        assert!(matches!(marshal_err, MarshalError::Slot(_)));
    }

    #[test]
    fn test_error_display() {
        let err = SlotError::TypeMismatch {
            slot: 1,
            expected: SlotType::String,
            found: SlotType::Num,
        };
        assert_eq!(err.to_string(), "slot 1 holds Num, expected String");

        let err = BindingError::Unresolved(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "2 unresolved foreign declaration(s): a, b");
    }

    #[test]
    fn test_async_result_propagates() {
        fn schedule() -> AsyncResult<u64> {
            Err(AsyncError::TornDown)
        }
        fn start() -> BridgeResult<u64> {
            Ok(schedule()?)
        }
        assert!(matches!(start(), Err(BridgeError::Async(AsyncError::TornDown))));
    }

    #[test]
    fn test_abort_message_is_verbatim() {
        assert_eq!(BridgeError::abort("invalid args").abort_message(), "invalid args");

        let wrapped: BridgeError = SlotError::NotAClass { slot: 0 }.into();
        assert_eq!(wrapped.abort_message(), "Slot error: slot 0 does not hold a class");
    }
}
