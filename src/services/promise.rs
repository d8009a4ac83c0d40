//! Promise 续体
//!
//! 异步解析桥交付结果的目标对象。状态只会从 `pending` 变为
//! `resolved` 或 `rejected` 一次，之后的结算只计数不改写。
//!
//! 通过 `then_(_)` 挂接的后续 Promise 以链式方式逐个解析：
//! 每次 `resolve_(_,_)` 最多转发给一个后续对象并返回 null，
//! 桥看到 null 会再次调用，直到返回 Bool 为止。

use crate::vm::sandbox::{ScriptCtx, ScriptLibrary, Trap, Value};

const PENDING: &str = "pending";
const RESOLVED: &str = "resolved";
const REJECTED: &str = "rejected";

fn state_of(ctx: &ScriptCtx<'_>) -> String {
    ctx.field("state")
        .as_bytes()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .unwrap_or_else(|| PENDING.to_string())
}

fn increment(ctx: &mut ScriptCtx<'_>, field: &str) -> Result<(), Trap> {
    let count = ctx.field(field).as_num().unwrap_or(0.0);
    ctx.set_field(field, Value::Num(count + 1.0))
}

/// 把已结算的结果转发给一个后续对象
///
/// 后续对象自身也可能挂有后续对象，持续调用它的 `resolve_(_,_)`
/// 直到返回 Bool。
fn forward(ctx: &mut ScriptCtx<'_>, target: Value) -> Result<(), Trap> {
    let success = state_of(ctx) == RESOLVED;
    let value = ctx.field("value");
    let mut args = vec![Value::Bool(success), value];
    loop {
        let done = ctx.call(target.clone(), "resolve_(_,_)", args)?;
        if done.as_bool().is_some() {
            return Ok(());
        }
        args = vec![Value::Null, Value::Null];
    }
}

fn resolve(ctx: &mut ScriptCtx<'_>) -> Result<Value, Trap> {
    if let Some(success) = ctx.arg(0).as_bool() {
        increment(ctx, "settleCount")?;
        if state_of(ctx) == PENDING {
            let state = if success { RESOLVED } else { REJECTED };
            ctx.set_field("state", Value::string(state))?;
            let value = ctx.arg(1);
            ctx.set_field("value", value)?;
        }
    }

    let targets = ctx.field("targets");
    if state_of(ctx) != PENDING {
        if let Some(target) = ctx.list_shift(&targets)? {
            forward(ctx, target)?;
            return Ok(Value::Null);
        }
    }
    Ok(Value::Bool(true))
}

/// `module` 中 `class Promise` 的方法体
pub fn promise_library(module: &str) -> ScriptLibrary {
    let mut library = ScriptLibrary::new();
    library
        .constructor(module, "Promise", "new()", |ctx| {
            ctx.set_field("state", Value::string(PENDING))?;
            ctx.set_field("value", Value::Null)?;
            ctx.set_field("progress", Value::Num(0.0))?;
            ctx.set_field("settleCount", Value::Num(0.0))?;
            ctx.set_field("progressCount", Value::Num(0.0))?;
            let targets = ctx.new_list(Vec::new());
            ctx.set_field("targets", targets)?;
            Ok(Value::Null)
        })
        .method(module, "Promise", "resolve_(_,_)", resolve)
        .method(module, "Promise", "progress_(_)", |ctx| {
            let fraction = ctx.num_arg(0, "progress")?;
            ctx.set_field("progress", Value::Num(fraction))?;
            increment(ctx, "progressCount")?;
            Ok(Value::Null)
        })
        .method(module, "Promise", "then_(_)", |ctx| {
            let target = ctx.arg(0);
            if state_of(ctx) == PENDING {
                let targets = ctx.field("targets");
                ctx.list_push(&targets, target.clone())?;
            } else {
                forward(ctx, target.clone())?;
            }
            Ok(target)
        })
        .method(module, "Promise", "state", |ctx| Ok(Value::string(&state_of(ctx))))
        .method(module, "Promise", "value", |ctx| Ok(ctx.field("value")))
        .method(module, "Promise", "progress", |ctx| Ok(ctx.field("progress")))
        .method(module, "Promise", "settleCount", |ctx| Ok(ctx.field("settleCount")))
        .method(module, "Promise", "progressCount", |ctx| Ok(ctx.field("progressCount")))
        .method(module, "Promise", "isDone", |ctx| {
            Ok(Value::Bool(state_of(ctx) != PENDING))
        })
        .method(module, "Promise", "toString", |ctx| {
            Ok(Value::string(&format!("Promise ({})", state_of(ctx))))
        });
    library
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{read_slot, ForeignRegistry, HostValue};
    use crate::config::VmConfig;
    use crate::vm::{SandboxVm, Vm};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn vm() -> SandboxVm {
        let mut vm = SandboxVm::new(
            &VmConfig::default(),
            Rc::new(ForeignRegistry::new()),
            Rc::new(promise_library("main")),
        );
        assert!(vm.interpret("main", "class Promise").is_success());
        vm
    }

    static EVALS: AtomicUsize = AtomicUsize::new(0);

    fn eval(vm: &mut SandboxVm, expr: &str) -> HostValue {
        let name = format!("eval{}", EVALS.fetch_add(1, Ordering::Relaxed));
        let source = format!("var {} = {}", name, expr);
        assert!(vm.interpret("main", &source).is_success(), "{source}");
        vm.ensure_slots(1).unwrap();
        vm.get_variable("main", &name, 0).unwrap();
        read_slot(vm, 0).unwrap()
    }

    #[test]
    fn test_first_settlement_wins() {
        let mut vm = vm();
        assert!(vm
            .interpret(
                "main",
                "var p = Promise.new()\ncall p.resolve_(true, 5)\ncall p.resolve_(false, \"late\")"
            )
            .is_success());
        assert_eq!(eval(&mut vm, "p.state"), HostValue::from("resolved"));
        assert_eq!(eval(&mut vm, "p.value"), HostValue::Num(5.0));
        assert_eq!(eval(&mut vm, "p.settleCount"), HostValue::Num(2.0));
        assert_eq!(eval(&mut vm, "p.isDone"), HostValue::Bool(true));
    }

    #[test]
    fn test_chained_targets_resolve_one_per_call() {
        let mut vm = vm();
        let source = "var p = Promise.new()\nvar a = Promise.new()\nvar b = Promise.new()\n\
                      call p.then_(a)\ncall p.then_(b)\nvar first = p.resolve_(false, \"gone\")";
        assert!(vm.interpret("main", source).is_success());
        assert_eq!(eval(&mut vm, "first"), HostValue::Null);
        assert_eq!(eval(&mut vm, "a.state"), HostValue::from("rejected"));
        assert_eq!(eval(&mut vm, "b.state"), HostValue::from("pending"));

        // 后续调用不带结果，继续转发已保存的结果
        assert_eq!(eval(&mut vm, "p.resolve_(null, null)"), HostValue::Null);
        assert_eq!(eval(&mut vm, "b.value"), HostValue::from("gone"));
        assert_eq!(eval(&mut vm, "p.resolve_(null, null)"), HostValue::Bool(true));
        assert_eq!(eval(&mut vm, "p.settleCount"), HostValue::Num(1.0));
    }

    #[test]
    fn test_nested_targets_all_resolve() {
        let mut vm = vm();
        let source = "var p = Promise.new()\nvar a = Promise.new()\nvar b = Promise.new()\n\
                      var c = Promise.new()\ncall a.then_(b)\ncall a.then_(c)\ncall p.then_(a)\n\
                      var first = p.resolve_(true, 7)";
        assert!(vm.interpret("main", source).is_success());
        assert_eq!(eval(&mut vm, "first"), HostValue::Null);
        assert_eq!(eval(&mut vm, "p.resolve_(null, null)"), HostValue::Bool(true));

        for name in ["a", "b", "c"] {
            assert_eq!(eval(&mut vm, &format!("{}.state", name)), HostValue::from("resolved"), "{name}");
            assert_eq!(eval(&mut vm, &format!("{}.value", name)), HostValue::Num(7.0), "{name}");
            assert_eq!(eval(&mut vm, &format!("{}.settleCount", name)), HostValue::Num(1.0), "{name}");
        }
    }

    #[test]
    fn test_then_on_settled_promise_reaches_nested_targets() {
        let mut vm = vm();
        let source = "var p = Promise.new()\ncall p.resolve_(false, \"late\")\nvar a = Promise.new()\n\
                      var b = Promise.new()\nvar c = Promise.new()\ncall a.then_(b)\ncall a.then_(c)\n\
                      call p.then_(a)";
        assert!(vm.interpret("main", source).is_success());
        for name in ["a", "b", "c"] {
            assert_eq!(eval(&mut vm, &format!("{}.state", name)), HostValue::from("rejected"), "{name}");
            assert_eq!(eval(&mut vm, &format!("{}.value", name)), HostValue::from("late"), "{name}");
        }
    }

    #[test]
    fn test_progress_and_display() {
        let mut vm = vm();
        assert!(vm
            .interpret("main", "var p = Promise.new()\ncall p.progress_(0.25)")
            .is_success());
        assert_eq!(eval(&mut vm, "p.progress"), HostValue::Num(0.25));
        assert_eq!(eval(&mut vm, "p.progressCount"), HostValue::Num(1.0));
        assert_eq!(eval(&mut vm, "p.toString"), HostValue::from("Promise (pending)"));
    }
}
