use proptest::prelude::*;
use slot_bridge::bindings::{read_slot, write_slot, ForeignRegistry, HostValue};
use slot_bridge::config::{BridgeConfig, SchedulerConfig, VmConfig};
use slot_bridge::core::{BridgeError, SlotError};
use slot_bridge::scripting::{AsyncBridge, HostRuntime, HostScheduler};
use slot_bridge::vm::sandbox::{SandboxVm, ScriptLibrary, Value};
use slot_bridge::vm::{Handle, SlotType, Vm};
use std::cell::RefCell;
use std::fs;
use std::rc::Rc;
use std::time::Duration;

type Log = Rc<RefCell<Vec<String>>>;

fn scheduler() -> anyhow::Result<Rc<HostScheduler>> {
    Ok(Rc::new(HostScheduler::new(&SchedulerConfig {
        worker_threads: 1,
        ..Default::default()
    })?))
}

fn runtime_config() -> BridgeConfig {
    BridgeConfig {
        scheduler: SchedulerConfig {
            worker_threads: 1,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// 记录每次 `resolve_(_,_)` 与 `progress_(_)` 调用的续体
fn recorder_library(log: &Log) -> ScriptLibrary {
    fn name_of(value: Value) -> String {
        value
            .as_bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_default()
    }

    let mut library = ScriptLibrary::new();
    library.constructor("main", "Recorder", "new(_)", |ctx| {
        let name = ctx.arg(0);
        ctx.set_field("name", name)?;
        Ok(Value::Null)
    });

    let sink = Rc::clone(log);
    library.method("main", "Recorder", "resolve_(_,_)", move |ctx| {
        let name = name_of(ctx.field("name"));
        let success = ctx.arg(0).as_bool();
        let value = match ctx.arg(1) {
            Value::Num(n) => n.to_string(),
            other => name_of(other),
        };
        sink.borrow_mut().push(format!("{}:{:?}:{}", name, success, value));
        Ok(Value::Bool(true))
    });

    let sink = Rc::clone(log);
    library.method("main", "Recorder", "progress_(_)", move |ctx| {
        let name = name_of(ctx.field("name"));
        sink.borrow_mut().push(format!("{}:progress", name));
        Ok(Value::Null)
    });
    library
}

fn recorder_vm(log: &Log) -> SandboxVm {
    let mut vm = SandboxVm::new(
        &VmConfig::default(),
        Rc::new(ForeignRegistry::new()),
        Rc::new(recorder_library(log)),
    );
    assert!(vm.interpret("main", "class Recorder").is_success());
    vm
}

fn continuation(vm: &mut SandboxVm, name: &str) -> anyhow::Result<Handle> {
    let source = format!("var {} = Recorder.new(\"{}\")", name, name);
    assert!(vm.interpret("main", &source).is_success());
    vm.ensure_slots(1)?;
    vm.get_variable("main", name, 0)?;
    Ok(vm.get_slot_handle(0)?)
}

fn drain(bridge: &AsyncBridge, vm: &mut SandboxVm) {
    while bridge.pending_count() > 0 {
        assert!(bridge.wait(Duration::from_secs(5)), "operation never settled");
        bridge.pump(vm);
    }
}

#[test]
fn test_success_path_resolves_once_with_bytes() -> anyhow::Result<()> {
    let log = Log::default();
    let bridge = AsyncBridge::new(scheduler()?);
    let mut vm = recorder_vm(&log);
    let fetch = continuation(&mut vm, "fetch")?;

    bridge.spawn(fetch, |progress| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        progress.report(1.0);
        Ok(HostValue::Bytes(vec![1, 2, 3]))
    })?;
    drain(&bridge, &mut vm);

    assert_eq!(
        *log.borrow(),
        vec!["fetch:progress".to_string(), "fetch:Some(true):\u{1}\u{2}\u{3}".to_string()]
    );
    let stats = bridge.stats();
    assert_eq!(stats.resolve_calls, 1);
    assert_eq!(stats.settled, 1);
    assert_eq!(vm.handle_root_count(), 0);
    assert!(vm.handle_table().stats().is_balanced());
    Ok(())
}

#[test]
fn test_failure_path_resolves_once_with_message() -> anyhow::Result<()> {
    let log = Log::default();
    let bridge = AsyncBridge::new(scheduler()?);
    let mut vm = recorder_vm(&log);
    let fetch = continuation(&mut vm, "fetch")?;

    bridge.spawn(fetch, |_| async move { Err("not found".to_string()) })?;
    drain(&bridge, &mut vm);

    assert_eq!(*log.borrow(), vec!["fetch:Some(false):not found".to_string()]);
    assert_eq!(bridge.stats().resolve_calls, 1);
    assert_eq!(vm.handle_table().stats().live, 0);
    Ok(())
}

#[test]
fn test_resolutions_follow_settlement_order() -> anyhow::Result<()> {
    let log = Log::default();
    let bridge = AsyncBridge::new(scheduler()?);
    let mut vm = recorder_vm(&log);

    let a = bridge.begin(continuation(&mut vm, "a")?)?;
    let b = bridge.begin(continuation(&mut vm, "b")?)?;
    b.resolve(2.0);
    a.resolve(1.0);
    let report = bridge.pump(&mut vm);

    assert_eq!(report.resolved, 2);
    assert_eq!(
        *log.borrow(),
        vec!["b:Some(true):2".to_string(), "a:Some(true):1".to_string()]
    );
    Ok(())
}

#[test]
fn test_teardown_during_pending_operation() -> anyhow::Result<()> {
    let log = Log::default();
    let bridge = AsyncBridge::new(scheduler()?);
    let mut vm = recorder_vm(&log);
    let pending = continuation(&mut vm, "pending")?;

    bridge.spawn(pending, |_| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(HostValue::Num(1.0))
    })?;
    bridge.teardown();
    vm.dispose();
    assert_eq!(vm.handle_table().stats().live, 0);

    // 结算到达后被丢弃，不会重新进入 VM
    assert!(bridge.wait(Duration::from_secs(5)));
    let report = bridge.pump(&mut vm);
    assert_eq!(report.diverted, 1);
    assert_eq!(report.resolved, 0);
    assert!(log.borrow().is_empty());
    assert!(vm.handle_table().stats().is_balanced());
    Ok(())
}

#[test]
fn test_allocate_only_class_is_accepted() -> anyhow::Result<()> {
    let mut registry = ForeignRegistry::new();
    registry.register_class(
        "main",
        "Token",
        |vm| {
            vm.set_slot_new_foreign(0, 0, slot_bridge::vm::ForeignRef(7))?;
            Ok(())
        },
        None,
    );
    let class = registry.resolve_class("main", "Token").expect("class registered");
    assert!(class.finalize.is_none());

    let mut vm = SandboxVm::new(&VmConfig::default(), Rc::new(registry), Rc::new(ScriptLibrary::new()));
    assert!(vm.interpret("main", "foreign class Token\ncall Token.new()").is_success());
    vm.collect_garbage();
    vm.dispose();
    Ok(())
}

#[test]
fn test_typed_getters_reject_mismatched_tags() -> anyhow::Result<()> {
    let mut vm = SandboxVm::default();
    vm.ensure_slots(2)?;
    vm.set_slot_double(0, 1.0)?;
    vm.set_slot_bool(1, false)?;

    assert!(matches!(
        vm.get_slot_string(0),
        Err(SlotError::TypeMismatch {
            expected: SlotType::String,
            found: SlotType::Num,
            ..
        })
    ));
    assert!(matches!(vm.get_slot_double(1), Err(SlotError::TypeMismatch { .. })));
    let beyond = vm.slot_count() + 1;
    assert!(matches!(vm.get_slot_bool(beyond), Err(SlotError::OutOfRange { .. })));
    Ok(())
}

#[test]
fn test_runtime_handle_balance_across_scripts() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("data.bin"), [1u8, 2, 3])?;
    let mut config = runtime_config();
    config.assets.root = dir.path().to_path_buf();

    let mut runtime = HostRuntime::new(config)?;
    runtime.load_module(
        "main",
        "import \"host\" for Asset, Buffer, Timer, Promise\n\
         var text = Promise.new()\n\
         call Asset.loadString_(\"/data.bin\", text)\n\
         var buffer = Promise.new()\n\
         call Buffer.load_(\"/data.bin\", buffer)\n\
         var nap = Promise.new()\n\
         call Timer.sleep_(1, nap)",
    )?;
    runtime.run_until_idle(Duration::from_secs(5))?;
    assert_eq!(runtime.bridge().pending_count(), 0);
    runtime.tick()?;

    // 参数校验失败的调用不会遗留句柄
    for (module, source) in [
        ("bad_path", "import \"host\" for Asset, Promise\nvar p = Promise.new()\ncall Asset.loadString_(1, p)"),
        ("bad_ms", "import \"host\" for Timer, Promise\nvar p = Promise.new()\ncall Timer.sleep_(-1, p)"),
        ("bad_promise", "import \"host\" for Buffer\ncall Buffer.load_(\"/data.bin\", 3)"),
    ] {
        let err = runtime.load_module(module, source).unwrap_err();
        assert!(matches!(err, BridgeError::Script(_)), "{}: {:?}", module, err);
    }
    assert_eq!(runtime.bridge().pending_count(), 0);

    runtime.teardown();
    let stats = runtime.vm().handle_table().stats();
    assert!(stats.is_balanced(), "{:?}", stats);
    Ok(())
}

proptest! {
    #[test]
    fn prop_scalar_round_trip(
        num in prop_oneof![any::<f64>(), Just(f64::NAN), Just(f64::INFINITY), Just(f64::NEG_INFINITY)],
        flag in any::<bool>(),
        text in ".*",
        bytes in proptest::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut vm = SandboxVm::default();
        vm.ensure_slots(4).unwrap();

        write_slot(&mut vm, 0, &HostValue::Num(num)).unwrap();
        write_slot(&mut vm, 1, &HostValue::Bool(flag)).unwrap();
        write_slot(&mut vm, 2, &HostValue::Text(text.clone())).unwrap();
        vm.set_slot_bytes(3, &bytes).unwrap();

        match read_slot(&mut vm, 0).unwrap() {
            HostValue::Num(read) if num.is_nan() => prop_assert!(read.is_nan()),
            read => prop_assert_eq!(read, HostValue::Num(num)),
        }
        prop_assert_eq!(read_slot(&mut vm, 1).unwrap(), HostValue::Bool(flag));
        prop_assert_eq!(read_slot(&mut vm, 2).unwrap(), HostValue::Text(text));
        prop_assert_eq!(vm.get_slot_bytes(3).unwrap(), bytes);
    }
}
