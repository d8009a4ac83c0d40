//! 错误/终止通道
//!
//! VM 通过错误回调逐条报告编译错误、运行时错误和调用栈帧。
//! [`ErrorChannel`] 把这些报告汇总成结构化的 [`ErrorReport`]，
//! 并维护当前顶层调用的状态机：
//!
//! ```text
//! Idle ──begin()──▶ Running ──finish()──▶ CompletedOk
//!                      │
//!                      ├── 编译错误报告 ──▶ CompileError
//!                      └── 运行时错误报告 ─▶ RuntimeError
//! ```
//!
//! 失败之后，同一顶层调用内的任何再次进入都会被 [`ErrorChannel::guard_reentry`] 拒绝。

use crate::core::error::{BridgeResult, ScriptError, ScriptResult};
use crate::vm::{ErrorFn, ErrorKind, InterpretResult, Vm};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

/// 调用栈帧（最早的调用在前）
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub module: String,
    pub line: u32,
    /// 函数/方法名，模块顶层为 `(script)`
    pub location: String,
}

/// 顶层调用状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorState {
    Idle,
    Running,
    CompletedOk,
    CompileError,
    RuntimeError,
}

impl ErrorState {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::CompileError | Self::RuntimeError)
    }
}

/// 一条完整的错误报告
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorReport {
    Compile {
        module: String,
        line: u32,
        message: String,
    },
    Runtime {
        message: String,
        frames: Vec<StackFrame>,
    },
}

impl ErrorReport {
    pub fn to_script_error(&self) -> ScriptError {
        match self {
            Self::Compile {
                module,
                line,
                message,
            } => ScriptError::Compilation {
                module: module.clone(),
                line: *line,
                message: message.clone(),
            },
            Self::Runtime { message, frames } => ScriptError::Runtime {
                message: message.clone(),
                stack: frames.clone(),
            },
        }
    }

    /// 人类可读的报告文本
    pub fn render(&self) -> String {
        match self {
            Self::Compile {
                module,
                line,
                message,
            } => format!("[{} line {}] {}", module, line, message),
            Self::Runtime { message, frames } => {
                let mut out = message.clone();
                if frames.is_empty() {
                    out.push_str("\n[no stack trace]");
                }
                for frame in frames {
                    let _ = write!(out, "\n  {} at {}:{}", frame.location, frame.module, frame.line);
                }
                out
            }
        }
    }
}

struct ChannelState {
    state: ErrorState,
    reports: Vec<ErrorReport>,
}

/// VM 错误回调的接收端
#[derive(Clone)]
pub struct ErrorChannel {
    inner: Rc<RefCell<ChannelState>>,
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ChannelState {
                state: ErrorState::Idle,
                reports: Vec::new(),
            })),
        }
    }

    /// 生成交给 VM 的错误回调
    pub fn error_fn(&self) -> ErrorFn {
        let inner = Rc::clone(&self.inner);
        Box::new(move |kind, module, line, message| {
            let mut channel = inner.borrow_mut();
            match kind {
                ErrorKind::Compile => {
                    tracing::error!(target: "script", "[{} line {}] {}", module, line, message);
                    channel.reports.push(ErrorReport::Compile {
                        module: module.to_string(),
                        line,
                        message: message.to_string(),
                    });
                    channel.state = ErrorState::CompileError;
                }
                ErrorKind::Runtime => {
                    tracing::error!(target: "script", "{}", message);
                    channel.reports.push(ErrorReport::Runtime {
                        message: message.to_string(),
                        frames: Vec::new(),
                    });
                    channel.state = ErrorState::RuntimeError;
                }
                ErrorKind::StackTrace => {
                    tracing::error!(target: "script", "  {} at {}:{}", message, module, line);
                    // VM 由内向外报告，这里按最早的调用在前保存
                    if let Some(ErrorReport::Runtime { frames, .. }) = channel.reports.last_mut() {
                        frames.insert(
                            0,
                            StackFrame {
                                module: module.to_string(),
                                line,
                                location: message.to_string(),
                            },
                        );
                    }
                }
            }
        })
    }

    /// 开始新的顶层调用，与之前的失败无关
    pub fn begin(&self) {
        let mut channel = self.inner.borrow_mut();
        channel.state = ErrorState::Running;
        channel.reports.clear();
    }

    /// 以 VM 返回值结束当前顶层调用
    pub fn finish(&self, result: InterpretResult) -> ErrorState {
        let mut channel = self.inner.borrow_mut();
        channel.state = match (result, channel.state) {
            (_, state) if state.is_failed() => state,
            (InterpretResult::Success, _) => ErrorState::CompletedOk,
            (InterpretResult::CompileError, _) => ErrorState::CompileError,
            (InterpretResult::RuntimeError, _) => ErrorState::RuntimeError,
        };
        channel.state
    }

    /// 当前调用失败后拒绝再次进入 VM
    pub fn guard_reentry(&self) -> ScriptResult<()> {
        if self.state().is_failed() {
            Err(ScriptError::AlreadyFailed)
        } else {
            Ok(())
        }
    }

    /// 回到 Idle 并清空报告
    pub fn reset(&self) {
        let mut channel = self.inner.borrow_mut();
        channel.state = ErrorState::Idle;
        channel.reports.clear();
    }

    pub fn state(&self) -> ErrorState {
        self.inner.borrow().state
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.inner.borrow().reports.clone()
    }

    pub fn last_error(&self) -> Option<ScriptError> {
        self.inner
            .borrow()
            .reports
            .last()
            .map(ErrorReport::to_script_error)
    }

    /// 所有报告的文本形式
    pub fn render(&self) -> String {
        let channel = self.inner.borrow();
        channel
            .reports
            .iter()
            .map(ErrorReport::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 在外部方法中终止当前 fiber
///
/// 消息写入槽位 0，随后调用 `abort_fiber(0)`。返回后外部方法应立即返回。
pub fn abort(vm: &mut dyn Vm, message: &str) -> BridgeResult<()> {
    vm.ensure_slots(1)?;
    vm.set_slot_string(0, message)?;
    vm.abort_fiber(0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::ForeignRegistry;
    use crate::config::VmConfig;
    use crate::vm::sandbox::{SandboxVm, ScriptLibrary};

    fn feed(channel: &ErrorChannel, calls: &[(ErrorKind, &str, u32, &str)]) {
        let mut error_fn = channel.error_fn();
        for (kind, module, line, message) in calls {
            error_fn(*kind, module, *line, message);
        }
    }

    #[test]
    fn test_frames_stored_oldest_first() {
        let channel = ErrorChannel::new();
        channel.begin();
        feed(
            &channel,
            &[
                (ErrorKind::Runtime, "", 0, "boom"),
                (ErrorKind::StackTrace, "main", 7, "Enemy.hit(_)"),
                (ErrorKind::StackTrace, "main", 3, "(script)"),
            ],
        );
        assert_eq!(channel.finish(InterpretResult::RuntimeError), ErrorState::RuntimeError);

        let reports = channel.reports();
        let ErrorReport::Runtime { frames, .. } = &reports[0] else {
            panic!("expected a runtime report");
        };
        assert_eq!(frames[0].location, "(script)");
        assert_eq!(frames[1].location, "Enemy.hit(_)");
        assert_eq!(
            channel.render(),
            "boom\n  (script) at main:3\n  Enemy.hit(_) at main:7"
        );
    }

    #[test]
    fn test_runtime_error_without_frames() {
        let channel = ErrorChannel::new();
        channel.begin();
        feed(&channel, &[(ErrorKind::Runtime, "", 0, "lost")]);
        assert_eq!(channel.render(), "lost\n[no stack trace]");
    }

    #[test]
    fn test_reentry_guard_and_begin() {
        let channel = ErrorChannel::new();
        channel.begin();
        feed(&channel, &[(ErrorKind::Compile, "main", 2, "unexpected statement 'x'")]);
        channel.finish(InterpretResult::CompileError);
        assert_eq!(channel.guard_reentry(), Err(ScriptError::AlreadyFailed));
        assert_eq!(
            channel.last_error(),
            Some(ScriptError::Compilation {
                module: "main".into(),
                line: 2,
                message: "unexpected statement 'x'".into()
            })
        );

        // 新的顶层调用不受之前失败影响
        channel.begin();
        assert!(channel.guard_reentry().is_ok());
        assert_eq!(channel.finish(InterpretResult::Success), ErrorState::CompletedOk);
        assert!(channel.reports().is_empty());
    }

    #[test]
    fn test_abort_from_foreign_method() {
        let mut registry = ForeignRegistry::new();
        registry
            .register_method("main", "Check", true, "positive(_)", |vm| {
                if vm.get_slot_double(1)? <= 0.0 {
                    return abort(vm, "value must be positive");
                }
                vm.set_slot_bool(0, true)?;
                Ok(())
            })
            .unwrap();
        let mut vm = SandboxVm::new(&VmConfig::default(), Rc::new(registry), Rc::new(ScriptLibrary::new()));
        let channel = ErrorChannel::new();
        vm.set_error_fn(channel.error_fn());

        channel.begin();
        let source = "class Check\nforeign static Check.positive(_)\ncall Check.positive(1)\ncall Check.positive(-1)";
        let result = vm.interpret("main", source);
        assert_eq!(channel.finish(result), ErrorState::RuntimeError);
        assert_eq!(channel.render(), "value must be positive\n  (script) at main:4");
    }
}
