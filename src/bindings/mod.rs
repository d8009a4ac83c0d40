//! 语言绑定层
//!
//! VM 与宿主之间的类型化边界：
//!
//! ```text
//! ┌──────────────┐   外部方法 (ForeignRegistry)   ┌──────────────┐
//! │              │ ─────────────────────────────▶ │              │
//! │   脚本 VM    │        槽位区 + 编组器          │     宿主     │
//! │              │ ◀───────────────────────────── │              │
//! └──────────────┘   调用句柄 (CallHandles)        └──────────────┘
//! ```
//!
//! - [`registry`]: VM → 宿主的分派表
//! - [`call_handles`]: 宿主 → VM 的预解析签名
//! - [`marshal`]: 宿主值与槽位值的转换和参数校验
//! - [`foreign_store`]: 外部对象的宿主侧状态

pub mod call_handles;
pub mod foreign_store;
pub mod marshal;
pub mod registry;

pub use call_handles::CallHandles;
pub use foreign_store::ForeignStore;
pub use marshal::{read_slot, write_slot, HostValue, Marshaller};
pub use registry::{
    ClassKey, FinalizeFn, ForeignClassMethods, ForeignMethodFn, ForeignRegistry, MethodKey,
    ModuleDecls,
};
