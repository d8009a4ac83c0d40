//! 宿主运行时
//!
//! 按固定顺序组装桥接层：配置 → 调度器 → 注册表（全部服务）→ 沙盒 VM →
//! 调用句柄 → 异步解析桥，然后加载宿主前导模块。
//!
//! 每帧由宿主调用 [`HostRuntime::tick`]：
//!
//! 1. 上一次顶层调用已失败时拒绝进入 VM
//! 2. 交付已结算的异步操作
//! 3. `Time.update_(frame)`
//! 4. 脚本声明了 `Game` 时调用 `Game.update_()`

use crate::bindings::{CallHandles, ForeignRegistry};
use crate::config::BridgeConfig;
use crate::core::error::{BindingResult, BridgeError, BridgeResult, ScriptError};
use crate::scripting::async_bridge::{AsyncBridge, PumpReport};
use crate::scripting::errors::{ErrorChannel, ErrorState};
use crate::scripting::scheduler::HostScheduler;
use crate::services::{self, Services, HOST_MODULE, PRELUDE_SOURCE};
use crate::vm::sandbox::{declarations, SandboxVm, ScriptLibrary};
use crate::vm::{Handle, InterpretResult, Vm};
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// 每帧调用 `update_()` 的脚本类名
pub const GAME_CLASS: &str = "Game";

type Registration = Box<dyn FnOnce(&mut ForeignRegistry) -> BindingResult<()>>;

/// [`HostRuntime`] 构建器
///
/// 除内置服务外，可以追加外部方法注册和脚本方法体。
pub struct HostRuntimeBuilder {
    config: BridgeConfig,
    registrations: Vec<Registration>,
    library: ScriptLibrary,
    write_fn: Option<Box<dyn FnMut(&str)>>,
}

impl HostRuntimeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            registrations: Vec::new(),
            library: ScriptLibrary::new(),
            write_fn: None,
        }
    }

    /// 追加外部方法/类注册
    pub fn register<F>(mut self, registration: F) -> Self
    where
        F: FnOnce(&mut ForeignRegistry) -> BindingResult<()> + 'static,
    {
        self.registrations.push(Box::new(registration));
        self
    }

    /// 追加脚本方法体
    pub fn library(mut self, library: &ScriptLibrary) -> Self {
        self.library.extend(library);
        self
    }

    /// `print` 输出回调
    pub fn write_fn(mut self, write_fn: impl FnMut(&str) + 'static) -> Self {
        self.write_fn = Some(Box::new(write_fn));
        self
    }

    pub fn build(self) -> BridgeResult<HostRuntime> {
        let config = self.config;
        config.validate()?;

        let scheduler = Rc::new(HostScheduler::new(&config.scheduler)?);
        let bridge = AsyncBridge::new(Rc::clone(&scheduler));

        let mut registry = ForeignRegistry::new();
        let services = services::install_all(&mut registry, &bridge, &config)?;
        for registration in self.registrations {
            registration(&mut registry)?;
        }

        let mut library = services::prelude_library();
        library.extend(&self.library);

        let errors = ErrorChannel::new();
        let mut vm = SandboxVm::new(&config.vm, Rc::new(registry), Rc::new(library));
        vm.set_error_fn(errors.error_fn());
        if let Some(write_fn) = self.write_fn {
            vm.set_write_fn(write_fn);
        }

        let calls = CallHandles::make(&mut vm)?;
        bridge.attach_calls(Rc::clone(&calls));

        let mut runtime = HostRuntime {
            config,
            scheduler,
            vm,
            calls: Some(calls),
            bridge,
            errors,
            time_class: None,
            game_class: None,
            frame: 0,
            services,
            torn_down: false,
        };

        runtime.load_module(HOST_MODULE, PRELUDE_SOURCE)?;
        runtime.time_class = Some(runtime.class_handle(HOST_MODULE, "Time")?);

        tracing::info!(target: "bridge", "Host runtime ready");
        Ok(runtime)
    }
}

/// 宿主运行时
pub struct HostRuntime {
    config: BridgeConfig,
    scheduler: Rc<HostScheduler>,
    vm: SandboxVm,
    calls: Option<Rc<CallHandles>>,
    bridge: AsyncBridge,
    errors: ErrorChannel,
    time_class: Option<Handle>,
    game_class: Option<Handle>,
    frame: u64,
    services: Services,
    torn_down: bool,
}

impl HostRuntime {
    pub fn new(config: BridgeConfig) -> BridgeResult<Self> {
        HostRuntimeBuilder::new(config).build()
    }

    pub fn builder(config: BridgeConfig) -> HostRuntimeBuilder {
        HostRuntimeBuilder::new(config)
    }

    fn ensure_live(&self) -> BridgeResult<()> {
        if self.torn_down {
            return Err(BridgeError::General("host runtime has been torn down".to_string()));
        }
        Ok(())
    }

    fn class_handle(&mut self, module: &str, class: &str) -> BridgeResult<Handle> {
        self.vm.ensure_slots(1)?;
        self.vm.get_variable(module, class, 0)?;
        Ok(self.vm.get_slot_handle(0)?)
    }

    /// 当前失败对应的错误
    fn failure(&self) -> BridgeError {
        let err = self.errors.last_error().unwrap_or(ScriptError::Runtime {
            message: "script call failed without a report".to_string(),
            stack: Vec::new(),
        });
        BridgeError::Script(err)
    }

    /// 加载并执行一个模块
    ///
    /// 先校验模块声明的外部绑定，缺失项一次性报告，不进入 VM。
    pub fn load_module(&mut self, name: &str, source: &str) -> BridgeResult<()> {
        self.ensure_live()?;
        let decls = declarations(name, source)?;
        self.vm.registry().validate(&decls)?;

        self.errors.begin();
        let result = self.vm.interpret(name, source);
        if self.errors.finish(result).is_failed() {
            return Err(self.failure());
        }
        tracing::info!(target: "bridge", "Loaded module '{}'", name);

        if name != HOST_MODULE && self.game_class.is_none() && self.vm.has_variable(name, GAME_CLASS) {
            self.game_class = Some(self.class_handle(name, GAME_CLASS)?);
            tracing::debug!(target: "bridge", "Retained {} class from module '{}'", GAME_CLASS, name);
        }
        Ok(())
    }

    /// 以文件名（不含扩展名）为模块名加载脚本文件
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> BridgeResult<String> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| BridgeError::General(format!("invalid script path {:?}", path)))?
            .to_string();
        let source = std::fs::read_to_string(path)?;
        self.load_module(&name, &source)?;
        Ok(name)
    }

    /// 推进一帧
    pub fn tick(&mut self) -> BridgeResult<PumpReport> {
        self.ensure_live()?;
        self.errors.guard_reentry()?;
        self.errors.begin();

        let report = self.bridge.pump(&mut self.vm);
        if self.errors.state().is_failed() {
            self.errors.finish(InterpretResult::RuntimeError);
            return Err(self.failure());
        }

        self.frame += 1;
        let mut result = self.call_update(true)?;
        if result.is_success() {
            result = self.call_update(false)?;
        }
        if self.errors.finish(result).is_failed() {
            return Err(self.failure());
        }
        Ok(report)
    }

    /// `Time.update_(frame)` 或 `Game.update_()`
    fn call_update(&mut self, time: bool) -> BridgeResult<InterpretResult> {
        let Some(calls) = self.calls.clone() else {
            return Ok(InterpretResult::Success);
        };
        let (class, method) = if time {
            (self.time_class.as_ref(), &calls.update_1)
        } else {
            (self.game_class.as_ref(), &calls.update_0)
        };
        let Some(class) = class else {
            return Ok(InterpretResult::Success);
        };

        self.vm.ensure_slots(method.arity() + 1)?;
        self.vm.set_slot_handle(0, class)?;
        if time {
            self.vm.set_slot_double(1, self.frame as f64)?;
        }
        Ok(calls.invoke(&mut self.vm, method))
    }

    /// 只交付异步结果，不推进帧
    pub fn pump(&mut self) -> BridgeResult<PumpReport> {
        self.ensure_live()?;
        self.errors.guard_reentry()?;
        self.errors.begin();
        let report = self.bridge.pump(&mut self.vm);
        let result = if self.errors.state().is_failed() {
            InterpretResult::RuntimeError
        } else {
            InterpretResult::Success
        };
        if self.errors.finish(result).is_failed() {
            return Err(self.failure());
        }
        Ok(report)
    }

    /// 等待并交付异步结果，直到没有未完成的操作或超时
    ///
    /// 返回交付的结算数；超时时仍未完成的操作保持登记。
    pub fn run_until_idle(&mut self, timeout: Duration) -> BridgeResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut resolved = 0;
        loop {
            if self.bridge.has_queued() {
                resolved += self.pump()?.resolved;
                continue;
            }
            if self.bridge.pending_count() == 0 {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.bridge.wait(remaining) {
                tracing::warn!(
                    target: "bridge",
                    "Timed out with {} async operation(s) pending",
                    self.bridge.pending_count()
                );
                break;
            }
        }
        Ok(resolved)
    }

    /// 销毁运行时：拆除异步桥，释放保留的类句柄，销毁 VM，关闭调度器
    ///
    /// 可以重复调用；`Drop` 时自动执行。
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.bridge.teardown();
        self.time_class = None;
        self.game_class = None;
        self.calls = None;
        self.vm.dispose();
        self.scheduler.shutdown();

        let stats = self.bridge.stats();
        tracing::info!(
            target: "bridge",
            "Host runtime torn down after {} frames ({} async operations, {} diverted)",
            self.frame,
            stats.started,
            stats.diverted
        );
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn vm(&self) -> &SandboxVm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut SandboxVm {
        &mut self.vm
    }

    pub fn bridge(&self) -> &AsyncBridge {
        &self.bridge
    }

    pub fn errors(&self) -> &ErrorChannel {
        &self.errors
    }

    pub fn error_state(&self) -> ErrorState {
        self.errors.state()
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn has_game(&self) -> bool {
        self.game_class.is_some()
    }
}

impl Drop for HostRuntime {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{read_slot, HostValue};
    use crate::config::SchedulerConfig;
    use crate::vm::sandbox::Value;
    use std::fs;

    fn config() -> BridgeConfig {
        BridgeConfig {
            scheduler: SchedulerConfig {
                worker_threads: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn var(runtime: &mut HostRuntime, module: &str, name: &str) -> HostValue {
        let vm = runtime.vm_mut();
        vm.ensure_slots(1).unwrap();
        vm.get_variable(module, name, 0).unwrap();
        read_slot(vm, 0).unwrap()
    }

    fn game_library() -> ScriptLibrary {
        let mut library = ScriptLibrary::new();
        library
            .static_method("main", "Game", "update_()", |ctx| {
                let ticks = ctx.field("ticks").as_num().unwrap_or(0.0);
                ctx.set_field("ticks", Value::Num(ticks + 1.0))?;
                Ok(Value::Null)
            })
            .static_method("main", "Game", "ticks", |ctx| {
                Ok(ctx.field("ticks").as_num().map(Value::Num).unwrap_or(Value::Num(0.0)))
            });
        library
    }

    #[test]
    fn test_tick_updates_time_and_game() {
        let mut runtime = HostRuntime::builder(config()).library(&game_library()).build().unwrap();
        runtime.load_module("main", "class Game").unwrap();
        assert!(runtime.has_game());

        for _ in 0..3 {
            runtime.tick().unwrap();
        }
        assert_eq!(runtime.frame(), 3);

        runtime
            .load_module(
                "check",
                "import \"host\" for Time\nimport \"main\" for Game\nvar frame = Time.frame\nvar ticks = Game.ticks",
            )
            .unwrap();
        assert_eq!(var(&mut runtime, "check", "frame"), HostValue::Num(3.0));
        assert_eq!(var(&mut runtime, "check", "ticks"), HostValue::Num(3.0));
    }

    #[test]
    fn test_asset_and_buffer_loads_resolve_promises() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("text")).unwrap();
        fs::write(dir.path().join("text").join("hello.txt"), "hello").unwrap();

        let mut config = config();
        config.assets.root = dir.path().to_path_buf();
        config.assets.chunk_size = 2;
        let mut runtime = HostRuntime::new(config).unwrap();

        let source = "import \"host\" for Asset, Buffer, Promise\n\
                      var path = Asset.path(\"/text/readme.md\", \"hello.txt\")\n\
                      var text = Promise.new()\n\
                      call Asset.loadString_(path, text)\n\
                      var bytes = Promise.new()\n\
                      call Buffer.load_(path, bytes)\n\
                      var missing = Promise.new()\n\
                      call Asset.loadString_(\"/nope.txt\", missing)";
        runtime.load_module("main", source).unwrap();
        assert_eq!(runtime.bridge().pending_count(), 3);

        let resolved = runtime.run_until_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(resolved, 3);
        assert_eq!(runtime.bridge().pending_count(), 0);

        runtime
            .load_module(
                "check",
                "import \"main\" for path, text, bytes, missing\n\
                 var value = text.value\n\
                 var progress = text.progressCount\n\
                 var array = bytes.value\n\
                 var count = array.count\n\
                 var failed = missing.state",
            )
            .unwrap();
        assert_eq!(var(&mut runtime, "check", "path"), HostValue::from("/text/hello.txt"));
        assert_eq!(var(&mut runtime, "check", "value"), HostValue::from("hello"));
        assert_eq!(var(&mut runtime, "check", "count"), HostValue::Num(5.0));
        assert_eq!(var(&mut runtime, "check", "failed"), HostValue::from("rejected"));
        assert!(matches!(var(&mut runtime, "check", "progress"), HostValue::Num(n) if n >= 1.0));
        assert_eq!(runtime.services().arrays.store().len(), 1);
    }

    #[test]
    fn test_timer_and_javascript() {
        let mut runtime = HostRuntime::new(config()).unwrap();
        let source = "import \"host\" for Timer, JavaScript, Promise\n\
                      var slept = Promise.new()\n\
                      call Timer.sleep_(5, slept)\n\
                      var product = JavaScript.eval_(true, \"[2,3]\", \"[\\\"a\\\",\\\"b\\\"]\", \"return a * b\")\n\
                      var later = Promise.new()\n\
                      call JavaScript.eval_(later, null, null, \"return [1, 2]\")";
        runtime.load_module("main", source).unwrap();
        assert_eq!(var(&mut runtime, "main", "product"), HostValue::from("6"));

        runtime.run_until_idle(Duration::from_secs(5)).unwrap();
        runtime
            .load_module(
                "check",
                "import \"main\" for slept, later\nvar sleptState = slept.state\nvar json = later.value",
            )
            .unwrap();
        assert_eq!(var(&mut runtime, "check", "sleptState"), HostValue::from("resolved"));
        assert_eq!(var(&mut runtime, "check", "json"), HostValue::from("[1,2]"));
    }

    #[test]
    fn test_failure_blocks_further_ticks() {
        let mut runtime = HostRuntime::new(config()).unwrap();
        let err = runtime.load_module("main", "abort \"boom\"").unwrap_err();
        match err {
            BridgeError::Script(ScriptError::Runtime { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(matches!(
            runtime.tick(),
            Err(BridgeError::Script(ScriptError::AlreadyFailed))
        ));
        assert_eq!(runtime.frame(), 0);
    }

    #[test]
    fn test_unbound_declarations_are_rejected_before_running() {
        let mut runtime = HostRuntime::new(config()).unwrap();
        let err = runtime
            .load_module("main", "foreign class Missing\nvar x = 1")
            .unwrap_err();
        assert!(matches!(err, BridgeError::Binding(_)));
        assert!(!runtime.vm().has_variable("main", "x"));
    }

    #[test]
    fn test_teardown_releases_pending_work() {
        let mut runtime = HostRuntime::new(config()).unwrap();
        runtime
            .load_module(
                "main",
                "import \"host\" for Timer, Promise\nvar p = Promise.new()\ncall Timer.sleep_(60000, p)",
            )
            .unwrap();
        assert_eq!(runtime.bridge().pending_count(), 1);

        runtime.teardown();
        runtime.teardown();
        assert!(runtime.is_torn_down());
        assert!(runtime.vm().is_disposed());
        assert_eq!(runtime.bridge().pending_count(), 0);
        assert!(runtime.tick().is_err());
    }
}
