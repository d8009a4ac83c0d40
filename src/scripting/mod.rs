//! 脚本运行时
//!
//! 把 VM 边界、绑定层和宿主服务组装成可以运行脚本的宿主：
//!
//! - [`async_bridge`]: 宿主异步操作与 VM 续体之间的解析桥
//! - [`errors`]: VM 错误回调的汇总与 fiber 终止
//! - [`scheduler`]: 承载宿主异步任务的 tokio 运行时
//! - [`host`]: 把以上部分按固定顺序组装起来的 [`HostRuntime`]

pub mod async_bridge;
pub mod errors;
pub mod host;
pub mod scheduler;

pub use async_bridge::{
    AsyncBridge, AsyncValue, BridgeStats, Finisher, OperationId, Outcome, ProgressReporter,
    PumpReport, Settler,
};
pub use errors::{abort, ErrorChannel, ErrorReport, ErrorState, StackFrame};
pub use host::{HostRuntime, HostRuntimeBuilder};
pub use scheduler::HostScheduler;
