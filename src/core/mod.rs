//! 核心模块
//!
//! 包含桥接层的基础设施：
//! - `error` - 错误类型定义
//! - `macros` - 样板代码宏

pub mod error;
#[macro_use]
pub mod macros;

// 重新导出错误类型
pub use error::{
    AsyncError, AsyncResult, BindingError, BindingResult, BridgeError, BridgeResult, MarshalError,
    MarshalResult, ScriptError, ScriptResult, SlotError, SlotResult,
};
