//! # Slot Bridge
//!
//! 单线程脚本 VM 与宿主之间的编组桥。
//!
//! ## 特性
//!
//! - **槽位区**: 宿主与 VM 之间唯一的数据通道，带类型标签的定长槽位
//! - **句柄表**: 宿主持有 VM 对象的引用计数根，恰好释放一次
//! - **外部调用注册表**: (模块, 类, 是否静态, 签名) → 宿主回调
//! - **调用句柄**: 启动时预解析的宿主 → VM 调用签名
//! - **异步解析桥**: 宿主异步操作完成后重新进入 VM 解析续体
//! - **错误通道**: 编译/运行时错误与调用栈的结构化汇总
//!
//! ## 架构
//!
//! ```text
//! ┌───────────────┐      ┌──────────────────┐      ┌────────────────┐
//! │   services    │ ───▶ │     bindings     │ ───▶ │       vm       │
//! │ 原生子系统     │      │ 注册表/编组/句柄  │      │ Vm 边界 + 沙盒  │
//! └───────────────┘      └──────────────────┘      └────────────────┘
//!         ▲                       ▲                        ▲
//!         └────────────── scripting (HostRuntime) ─────────┘
//! ```
//!
//! ### 示例
//!
//! ```ignore
//! use slot_bridge::config::BridgeConfig;
//! use slot_bridge::scripting::HostRuntime;
//!
//! let mut runtime = HostRuntime::new(BridgeConfig::load_or_default())?;
//! runtime.load_file("scripts/main.wren")?;
//! runtime.tick()?;
//! ```
//!
//! ## 模块
//!
//! - [`core`]: 错误类型与宏
//! - [`config`]: 配置系统
//! - [`vm`]: VM 边界 trait、槽位区、句柄表与沙盒 VM
//! - [`bindings`]: 外部调用注册表、调用句柄与编组
//! - [`scripting`]: 异步解析桥、错误通道、调度器与宿主运行时
//! - [`services`]: 暴露给脚本的原生服务

/// 错误类型与宏
pub mod core;
/// 配置系统
pub mod config;
/// VM 边界
pub mod vm;
/// 语言绑定层
pub mod bindings;
/// 宿主运行时
pub mod scripting;
/// 原生服务
pub mod services;

pub use crate::core::{BridgeError, BridgeResult};
pub use crate::scripting::{HostRuntime, HostRuntimeBuilder};
