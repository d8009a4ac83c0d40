//! 沙盒 VM
//!
//! 进程内的参考 VM，实现 [`Vm`] 边界，供测试和命令行运行器使用。
//! 它不是真正的脚本解释器：模块源码是逐行的声明（见 [`loader`]），
//! 脚本类的方法体由 [`ScriptLibrary`] 中的宿主闭包提供。
//!
//! 与真实 VM 保持一致的部分：
//!
//! - 固定容量的槽位区，外部方法调用时整帧换出/换回
//! - 标记-清除堆，根为模块变量、句柄、槽位与正在执行的帧
//! - 外部对象被回收或 VM 销毁时调用 finalize
//! - 错误回调：编译错误一次；运行时错误先报消息，再由内向外逐帧报告调用栈

pub mod heap;
pub mod library;
pub mod loader;

pub use heap::Value;
pub use library::{MethodKind, ScriptCtx, ScriptLibrary, ScriptMethodFn};
pub use loader::declarations;

use self::heap::{ClassObj, DeadForeign, ForeignObj, Heap, InstanceObj, Method, ObjRef, Object};
use self::loader::{Expr, Line, Literal, Stmt};
use crate::bindings::registry::{ForeignMethodFn, ForeignRegistry, MethodKey};
use crate::config::VmConfig;
use crate::core::error::{BindingError, BindingResult, ScriptError, ScriptResult, SlotError, SlotResult};
use crate::vm::{
    CallHandle, ErrorFn, ErrorKind, ForeignRef, Handle, HandleId, HandleTable, InterpretResult,
    SlotArea, SlotType, Vm,
};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

const SCRIPT_LOCATION: &str = "(script)";
const INITIAL_GC_THRESHOLD: usize = 1024;

/// 调用栈中的一帧
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub module: String,
    pub line: u32,
    pub location: String,
}

/// 运行时错误
///
/// 调用栈在错误离开最内层脚本帧时捕获，由内向外排列。
#[derive(Debug, Clone)]
pub struct Trap {
    message: String,
    frames: Option<Vec<TraceFrame>>,
}

impl Trap {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: None,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    fn capture(mut self, stack: &[TraceFrame]) -> Self {
        if self.frames.is_none() {
            self.frames = Some(stack.iter().rev().cloned().collect());
        }
        self
    }
}

impl From<&str> for Trap {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for Trap {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<SlotError> for Trap {
    fn from(err: SlotError) -> Self {
        Self::new(err.to_string())
    }
}

#[derive(Default)]
struct Module {
    vars: HashMap<String, Value>,
}

/// 沙盒 VM
pub struct SandboxVm {
    config: VmConfig,
    registry: Rc<ForeignRegistry>,
    library: Rc<ScriptLibrary>,
    heap: Heap,
    slots: SlotArea<Value>,
    /// 外部方法执行期间换出的外层帧
    saved_frames: Vec<Vec<Value>>,
    /// 正在求值的接收者、参数与新建对象
    temp_roots: Vec<Value>,
    modules: HashMap<String, Module>,
    handles: Rc<HandleTable>,
    handle_roots: HashMap<HandleId, Value>,
    call_signatures: Vec<Rc<str>>,
    stack: Vec<TraceFrame>,
    /// 宿主进入 VM 的层数
    depth: usize,
    /// 方法调用嵌套层数
    nesting: usize,
    pending_abort: Option<Value>,
    error_fn: Option<ErrorFn>,
    write_fn: Option<Box<dyn FnMut(&str)>>,
    next_gc: usize,
    disposed: bool,
}

impl Default for SandboxVm {
    fn default() -> Self {
        Self::new(
            &VmConfig::default(),
            Rc::new(ForeignRegistry::new()),
            Rc::new(ScriptLibrary::new()),
        )
    }
}

impl SandboxVm {
    pub fn new(config: &VmConfig, registry: Rc<ForeignRegistry>, library: Rc<ScriptLibrary>) -> Self {
        let mut slots = SlotArea::new(config.max_slots);
        // 配置已校验 initial_slots <= max_slots
        let _ = slots.ensure(config.initial_slots);

        tracing::debug!(
            target: "sandbox",
            "Creating sandbox VM ({} foreign methods, {} library classes)",
            registry.method_count(),
            library.class_count()
        );

        Self {
            config: config.clone(),
            registry,
            library,
            heap: Heap::new(),
            slots,
            saved_frames: Vec::new(),
            temp_roots: Vec::new(),
            modules: HashMap::new(),
            handles: HandleTable::new(),
            handle_roots: HashMap::new(),
            call_signatures: Vec::new(),
            stack: Vec::new(),
            depth: 0,
            nesting: 0,
            pending_abort: None,
            error_fn: None,
            write_fn: None,
            next_gc: INITIAL_GC_THRESHOLD,
            disposed: false,
        }
    }

    /// 设置错误回调
    pub fn set_error_fn(&mut self, error_fn: ErrorFn) {
        self.error_fn = Some(error_fn);
    }

    /// 设置 `print` 输出回调（默认写入 `script.console` 日志）
    pub fn set_write_fn(&mut self, write_fn: impl FnMut(&str) + 'static) {
        self.write_fn = Some(Box::new(write_fn));
    }

    pub fn registry(&self) -> &Rc<ForeignRegistry> {
        &self.registry
    }

    pub fn object_count(&self) -> usize {
        self.heap.live_count()
    }

    /// VM 侧仍被句柄持有的根数
    pub fn handle_root_count(&mut self) -> usize {
        self.drain_handles();
        self.handle_roots.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// 销毁 VM：终结所有外部对象，句柄表进入销毁状态
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.drain_handles();
        self.handle_roots.clear();
        self.modules.clear();
        self.slots.clear();
        self.saved_frames.clear();
        self.temp_roots.clear();
        let dead = self.heap.clear();
        let finalized = dead.len();
        self.finalize(dead);
        self.handles.teardown();

        tracing::debug!(target: "sandbox", "Sandbox VM disposed ({} foreign objects finalized)", finalized);
    }

    // ---- 内部：句柄与回收 ----

    fn drain_handles(&mut self) {
        for id in self.handles.drain_released() {
            self.handle_roots.remove(&id);
        }
    }

    fn finalize(&self, dead: Vec<DeadForeign>) {
        for (methods, data) in dead {
            methods.finalize(data);
        }
    }

    fn maybe_collect(&mut self) {
        if self.depth == 0 && self.heap.live_count() >= self.next_gc {
            self.collect_garbage();
            self.next_gc = (self.heap.live_count() * 2).max(INITIAL_GC_THRESHOLD);
        }
    }

    // ---- 内部：错误报告 ----

    fn report(&mut self, kind: ErrorKind, module: &str, line: u32, message: &str) {
        match self.error_fn.as_mut() {
            Some(error_fn) => error_fn(kind, module, line, message),
            None => tracing::error!(target: "sandbox", "{:?} [{} line {}] {}", kind, module, line, message),
        }
    }

    fn report_compile(&mut self, err: &ScriptError) {
        match err {
            ScriptError::Compilation {
                module,
                line,
                message,
            } => self.report(ErrorKind::Compile, module, *line, message),
            other => self.report(ErrorKind::Compile, "", 0, &other.to_string()),
        }
    }

    fn report_runtime(&mut self, trap: Trap) {
        self.report(ErrorKind::Runtime, "", 0, &trap.message);
        for frame in trap.frames.unwrap_or_default() {
            self.report(ErrorKind::StackTrace, &frame.module, frame.line, &frame.location);
        }
    }

    fn write(&mut self, text: &str) {
        match self.write_fn.as_mut() {
            Some(write_fn) => write_fn(text),
            None => tracing::info!(target: "script.console", "{}", text),
        }
    }

    // ---- 内部：编译与执行 ----

    fn compile(&self, module: &str, source: &str) -> ScriptResult<Vec<Line>> {
        let lines = loader::parse(module, source)?;
        let error = |line: u32, message: String| ScriptError::Compilation {
            module: module.to_string(),
            line,
            message,
        };

        let existing = self.modules.get(module);
        let mut defined: HashSet<String> = existing
            .map(|m| m.vars.keys().cloned().collect())
            .unwrap_or_default();
        let mut classes: HashSet<String> = existing
            .map(|m| {
                m.vars
                    .iter()
                    .filter(|(_, v)| v.as_obj().and_then(|r| self.heap.class(r)).is_some())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();

        for line in &lines {
            match &line.stmt {
                Stmt::Import {
                    module: from,
                    names,
                } => {
                    let source_module = self
                        .modules
                        .get(from)
                        .ok_or_else(|| error(line.number, format!("could not find module '{}'", from)))?;
                    if let Some(missing) = names.iter().find(|n| !source_module.vars.contains_key(*n)) {
                        return Err(error(
                            line.number,
                            format!("module '{}' has no variable '{}'", from, missing),
                        ));
                    }
                }
                Stmt::ForeignClass(class) => {
                    if self.registry.resolve_class(module, class).is_none() {
                        let err = BindingError::MissingClass {
                            module: module.to_string(),
                            class: class.clone(),
                        };
                        return Err(error(line.number, err.to_string()));
                    }
                }
                Stmt::Foreign {
                    class,
                    is_static,
                    signature,
                } => {
                    if !classes.contains(class) {
                        return Err(error(
                            line.number,
                            format!("'{}' is not a class declared in module '{}'", class, module),
                        ));
                    }
                    if self
                        .registry
                        .resolve_method(module, class, *is_static, signature)
                        .is_none()
                    {
                        let key = MethodKey::new(module, class, *is_static, signature);
                        let err = BindingError::MissingMethod(key.to_string());
                        return Err(error(line.number, err.to_string()));
                    }
                }
                _ => {}
            }

            if let Some(name) = line
                .stmt
                .referenced_vars()
                .into_iter()
                .find(|name| !defined.contains(*name))
            {
                return Err(error(line.number, format!("variable '{}' is used but not defined", name)));
            }
            for name in line.stmt.defined_vars() {
                if !defined.insert(name.to_string()) {
                    return Err(error(line.number, format!("variable '{}' is already defined", name)));
                }
            }
            if let Stmt::Class(name) | Stmt::ForeignClass(name) = &line.stmt {
                classes.insert(name.clone());
            }
        }
        Ok(lines)
    }

    fn run(&mut self, module: &str, lines: Vec<Line>) -> Result<(), Trap> {
        self.modules.entry(module.to_string()).or_default();
        for line in lines {
            if let Some(frame) = self.stack.last_mut() {
                frame.line = line.number;
            }
            self.exec(module, line.stmt)?;
        }
        Ok(())
    }

    fn exec(&mut self, module: &str, stmt: Stmt) -> Result<(), Trap> {
        match stmt {
            Stmt::Import {
                module: from,
                names,
            } => {
                for name in names {
                    let value = self.variable(&from, &name)?;
                    self.define(module, name, value);
                }
            }
            Stmt::Class(name) => {
                let class = self.new_class(module, &name, false)?;
                self.define(module, name, class);
            }
            Stmt::ForeignClass(name) => {
                let class = self.new_class(module, &name, true)?;
                self.define(module, name, class);
            }
            Stmt::Foreign {
                class,
                is_static,
                signature,
            } => {
                let method = self
                    .registry
                    .resolve_method(module, &class, is_static, &signature)
                    .ok_or_else(|| Trap::new(format!("no foreign method bound for {}.{}", class, signature)))?;
                let class_ref = self
                    .variable(module, &class)?
                    .as_obj()
                    .ok_or_else(|| Trap::new(format!("'{}' is not a class", class)))?;
                match self.heap.get_mut(class_ref) {
                    Some(Object::Class(class)) => {
                        class
                            .methods
                            .insert((is_static, signature), Method::Foreign(method));
                    }
                    _ => return Err(Trap::new(format!("'{}' is not a class", class))),
                }
            }
            Stmt::Var { name, value } => {
                let value = self.eval(module, &value)?;
                self.define(module, name, value);
            }
            Stmt::Call(expr) => {
                self.eval(module, &expr)?;
            }
            Stmt::Print(expr) => {
                let value = self.eval(module, &expr)?;
                self.temp_roots.push(value.clone());
                let text = self.display(&value);
                self.temp_roots.pop();
                self.write(&text?);
            }
            Stmt::Abort(expr) => {
                let value = self.eval(module, &expr)?;
                return Err(Trap::new(self.display_plain(&value, 0)));
            }
        }
        Ok(())
    }

    fn define(&mut self, module: &str, name: String, value: Value) {
        self.modules
            .entry(module.to_string())
            .or_default()
            .vars
            .insert(name, value);
    }

    fn variable(&self, module: &str, name: &str) -> Result<Value, Trap> {
        self.modules
            .get(module)
            .and_then(|m| m.vars.get(name))
            .cloned()
            .ok_or_else(|| Trap::new(format!("module '{}' has no variable '{}'", module, name)))
    }

    fn new_class(&mut self, module: &str, name: &str, foreign: bool) -> Result<Value, Trap> {
        let foreign = if foreign {
            Some(
                self.registry
                    .resolve_class(module, name)
                    .ok_or_else(|| Trap::new(format!("foreign class {}:{} has no allocator", module, name)))?,
            )
        } else {
            None
        };

        let methods = self
            .library
            .methods_for(module, name)
            .iter()
            .map(|m| {
                let (is_static, method) = match m.kind {
                    MethodKind::Instance => (false, Method::Script(m.body.clone())),
                    MethodKind::Static => (true, Method::Script(m.body.clone())),
                    MethodKind::Constructor => (true, Method::Constructor(m.body.clone())),
                };
                ((is_static, m.signature.clone()), method)
            })
            .collect();

        let class = ClassObj {
            module: module.to_string(),
            name: name.to_string(),
            foreign,
            methods,
            static_fields: HashMap::new(),
        };
        Ok(Value::Obj(self.heap.alloc(Object::Class(class))))
    }

    fn eval(&mut self, module: &str, expr: &Expr) -> Result<Value, Trap> {
        match expr {
            Expr::Literal(literal) => Ok(match literal {
                Literal::Null => Value::Null,
                Literal::Bool(b) => Value::Bool(*b),
                Literal::Num(n) => Value::Num(*n),
                Literal::Str(s) => Value::string(s),
            }),
            Expr::Var(name) => self.variable(module, name),
            Expr::Call {
                receiver,
                name,
                args,
            } => {
                let signature = Expr::signature(name, args.as_deref());
                self.eval_invoke(module, receiver, &signature, args.as_deref().unwrap_or(&[]))
            }
            Expr::Setter {
                receiver,
                name,
                value,
            } => {
                let signature = format!("{}=(_)", name);
                self.eval_invoke(module, receiver, &signature, std::slice::from_ref(value.as_ref()))
            }
        }
    }

    fn eval_invoke(
        &mut self,
        module: &str,
        receiver: &Expr,
        signature: &str,
        args: &[Expr],
    ) -> Result<Value, Trap> {
        let mark = self.temp_roots.len();
        let result = (|| {
            let receiver = self.eval(module, receiver)?;
            self.temp_roots.push(receiver.clone());
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                let value = self.eval(module, arg)?;
                self.temp_roots.push(value.clone());
                values.push(value);
            }
            self.invoke(receiver, signature, values)
        })();
        self.temp_roots.truncate(mark);
        result
    }

    // ---- 内部：方法调用 ----

    fn invoke(&mut self, receiver: Value, signature: &str, args: Vec<Value>) -> Result<Value, Trap> {
        if self.nesting >= self.config.max_call_depth {
            return Err(Trap::new("Maximum call depth exceeded."));
        }
        let mark = self.temp_roots.len();
        self.temp_roots.push(receiver.clone());
        self.temp_roots.extend(args.iter().cloned());
        self.nesting += 1;

        let result = self.dispatch(receiver, signature, args);

        self.nesting -= 1;
        self.temp_roots.truncate(mark);
        result
    }

    fn dispatch(&mut self, receiver: Value, signature: &str, args: Vec<Value>) -> Result<Value, Trap> {
        let target = match &receiver {
            Value::Obj(r) => match self.heap.get(*r) {
                Some(Object::Class(_)) => Some((*r, true)),
                Some(Object::Instance(instance)) => Some((instance.class, false)),
                Some(Object::Foreign(foreign)) => Some((foreign.class, false)),
                Some(_) => None,
                None => return Err(Trap::new("object has been collected")),
            },
            _ => None,
        };

        if let Some((class_ref, is_static)) = target {
            let (method, module, location, foreign) = {
                let class = self
                    .heap
                    .class(class_ref)
                    .ok_or_else(|| Trap::new("object has no class"))?;
                (
                    class.methods.get(&(is_static, signature.to_string())).cloned(),
                    class.module.clone(),
                    format!("{}.{}", class.name, signature),
                    class.foreign.is_some(),
                )
            };
            match method {
                Some(Method::Foreign(method)) => return self.call_foreign(&method, receiver, args),
                Some(Method::Script(body)) => {
                    return self.call_script(&body, module, location, receiver, args)
                }
                Some(Method::Constructor(body)) => {
                    return self.construct(class_ref, Some((&body, module, location)), args)
                }
                None if is_static
                    && (signature == "new()" || (foreign && signature.starts_with("new"))) =>
                {
                    return self.construct(class_ref, None, args)
                }
                None => {}
            }
        }

        if let Some(value) = self.builtin(&receiver, signature, &args) {
            return Ok(value);
        }
        Err(Trap::new(format!(
            "{} does not implement '{}'.",
            self.type_name(&receiver),
            signature
        )))
    }

    fn call_foreign(
        &mut self,
        method: &ForeignMethodFn,
        receiver: Value,
        args: Vec<Value>,
    ) -> Result<Value, Trap> {
        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(receiver);
        frame.extend(args);
        let outer = self.slots.take(frame)?;
        self.saved_frames.push(outer);
        let outer_abort = self.pending_abort.take();

        let result = method(self);

        let abort = std::mem::replace(&mut self.pending_abort, outer_abort);
        let outer = self.saved_frames.pop().unwrap_or_default();
        let inner = self.slots.restore(outer);

        if let Err(err) = result {
            return Err(Trap::new(err.abort_message()));
        }
        if let Some(message) = abort {
            return Err(Trap::new(self.display_plain(&message, 0)));
        }
        Ok(inner.into_iter().next().unwrap_or_default())
    }

    fn call_script(
        &mut self,
        body: &ScriptMethodFn,
        module: String,
        location: String,
        receiver: Value,
        args: Vec<Value>,
    ) -> Result<Value, Trap> {
        self.stack.push(TraceFrame {
            module,
            line: 0,
            location,
        });
        let result = {
            let mut ctx = ScriptCtx {
                vm: &mut *self,
                receiver,
                args,
            };
            body(&mut ctx)
        };
        let result = result.map_err(|trap| trap.capture(&self.stack));
        self.stack.pop();
        result
    }

    fn construct(
        &mut self,
        class_ref: ObjRef,
        constructor: Option<(&ScriptMethodFn, String, String)>,
        args: Vec<Value>,
    ) -> Result<Value, Trap> {
        let (name, foreign) = match self.heap.class(class_ref) {
            Some(class) => (class.name.clone(), class.foreign.clone()),
            None => return Err(Trap::new("object has no class")),
        };

        let instance = match foreign {
            Some(methods) => {
                let created =
                    self.call_foreign(&methods.allocate, Value::Obj(class_ref), args.clone())?;
                match created.as_obj().and_then(|r| self.heap.get(r)) {
                    Some(Object::Foreign(obj)) if obj.class == class_ref => created,
                    _ => {
                        return Err(Trap::new(format!(
                            "{} allocator did not create a foreign object",
                            name
                        )))
                    }
                }
            }
            None => Value::Obj(self.heap.alloc(Object::Instance(InstanceObj {
                class: class_ref,
                fields: HashMap::new(),
            }))),
        };

        if let Some((body, module, location)) = constructor {
            self.temp_roots.push(instance.clone());
            self.call_script(body, module, location, instance.clone(), args)?;
        }
        Ok(instance)
    }

    fn builtin(&mut self, receiver: &Value, signature: &str, args: &[Value]) -> Option<Value> {
        if signature == "toString" {
            return Some(Value::string(&self.display_plain(receiver, 0)));
        }
        let object = receiver.as_obj().and_then(|r| self.heap.get_mut(r));
        match (signature, receiver, object) {
            ("count", Value::Str(bytes), _) => Some(Value::Num(bytes.len() as f64)),
            ("count", _, Some(Object::List(items))) => Some(Value::Num(items.len() as f64)),
            ("count", _, Some(Object::Map(entries))) => Some(Value::Num(entries.len() as f64)),
            ("add(_)", _, Some(Object::List(items))) => {
                let item = args.first().cloned().unwrap_or_default();
                items.push(item.clone());
                Some(item)
            }
            _ => None,
        }
    }

    fn type_name(&self, value: &Value) -> String {
        match value {
            Value::Null => "Null".to_string(),
            Value::Bool(_) => "Bool".to_string(),
            Value::Num(_) => "Num".to_string(),
            Value::Str(_) => "String".to_string(),
            Value::Obj(r) => match self.heap.get(*r) {
                Some(Object::List(_)) => "List".to_string(),
                Some(Object::Map(_)) => "Map".to_string(),
                Some(Object::Class(class)) => format!("{} metaclass", class.name),
                Some(Object::Instance(InstanceObj { class, .. }))
                | Some(Object::Foreign(ForeignObj { class, .. })) => self
                    .heap
                    .class(*class)
                    .map(|c| c.name.clone())
                    .unwrap_or_else(|| "Object".to_string()),
                None => "Object".to_string(),
            },
        }
    }

    /// 通过 `toString` 协议得到显示文本
    fn display(&mut self, value: &Value) -> Result<String, Trap> {
        if let Value::Str(bytes) = value {
            return Ok(String::from_utf8_lossy(bytes).into_owned());
        }
        let text = self.invoke(value.clone(), "toString", Vec::new())?;
        Ok(self.display_plain(&text, 0))
    }

    /// 不进入脚本方法的显示文本
    fn display_plain(&self, value: &Value, depth: usize) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => format_num(*n),
            Value::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Value::Obj(_) if depth > 8 => "...".to_string(),
            Value::Obj(r) => match self.heap.get(*r) {
                Some(Object::List(items)) => {
                    let parts: Vec<String> =
                        items.iter().map(|v| self.display_plain(v, depth + 1)).collect();
                    format!("[{}]", parts.join(", "))
                }
                Some(Object::Map(entries)) => {
                    let parts: Vec<String> = entries
                        .iter()
                        .map(|(k, v)| {
                            format!(
                                "{}: {}",
                                self.display_plain(k, depth + 1),
                                self.display_plain(v, depth + 1)
                            )
                        })
                        .collect();
                    format!("{{{}}}", parts.join(", "))
                }
                Some(Object::Class(class)) => class.name.clone(),
                Some(_) => format!("instance of {}", self.type_name(value)),
                None => "<collected>".to_string(),
            },
        }
    }

    // ---- 内部：槽位访问 ----

    fn value_type(&self, value: &Value) -> SlotType {
        match value {
            Value::Null => SlotType::Null,
            Value::Bool(_) => SlotType::Bool,
            Value::Num(_) => SlotType::Num,
            Value::Str(_) => SlotType::String,
            Value::Obj(r) => self
                .heap
                .get(*r)
                .map(Object::slot_type)
                .unwrap_or(SlotType::Object),
        }
    }

    fn typed_slot(&self, slot: usize, expected: SlotType) -> SlotResult<&Value> {
        let value = self.slots.get(slot)?;
        let found = self.value_type(value);
        if found == expected {
            Ok(value)
        } else {
            Err(SlotError::TypeMismatch {
                slot,
                expected,
                found,
            })
        }
    }

    fn object_ref(&self, slot: usize, expected: SlotType) -> SlotResult<ObjRef> {
        self.typed_slot(slot, expected)?
            .as_obj()
            .ok_or(SlotError::TypeMismatch {
                slot,
                expected,
                found: SlotType::Null,
            })
    }

    fn list(&self, slot: usize) -> SlotResult<&Vec<Value>> {
        let r = self.object_ref(slot, SlotType::List)?;
        match self.heap.get(r) {
            Some(Object::List(items)) => Ok(items),
            _ => Err(SlotError::TypeMismatch {
                slot,
                expected: SlotType::List,
                found: SlotType::Object,
            }),
        }
    }

    fn list_mut(&mut self, slot: usize) -> SlotResult<&mut Vec<Value>> {
        let r = self.object_ref(slot, SlotType::List)?;
        match self.heap.get_mut(r) {
            Some(Object::List(items)) => Ok(items),
            _ => Err(SlotError::TypeMismatch {
                slot,
                expected: SlotType::List,
                found: SlotType::Object,
            }),
        }
    }

    fn map(&self, slot: usize) -> SlotResult<&Vec<(Value, Value)>> {
        let r = self.object_ref(slot, SlotType::Map)?;
        match self.heap.get(r) {
            Some(Object::Map(entries)) => Ok(entries),
            _ => Err(SlotError::TypeMismatch {
                slot,
                expected: SlotType::Map,
                found: SlotType::Object,
            }),
        }
    }

    fn map_mut(&mut self, slot: usize) -> SlotResult<&mut Vec<(Value, Value)>> {
        let r = self.object_ref(slot, SlotType::Map)?;
        match self.heap.get_mut(r) {
            Some(Object::Map(entries)) => Ok(entries),
            _ => Err(SlotError::TypeMismatch {
                slot,
                expected: SlotType::Map,
                found: SlotType::Object,
            }),
        }
    }

    fn set_new_object(&mut self, slot: usize, object: Object) -> SlotResult<()> {
        self.slots.get(slot)?;
        let r = self.heap.alloc(object);
        self.slots.set(slot, Value::Obj(r))
    }
}

/// 数字的显示格式：整数不带小数点
fn format_num(n: f64) -> String {
    if n.is_nan() {
        "nan".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "infinity" } else { "-infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn resolve_index(index: i64, count: usize) -> SlotResult<usize> {
    let resolved = if index < 0 { index + count as i64 } else { index };
    if resolved < 0 || resolved >= count as i64 {
        Err(SlotError::IndexOutOfBounds { index, count })
    } else {
        Ok(resolved as usize)
    }
}

impl Vm for SandboxVm {
    fn ensure_slots(&mut self, count: usize) -> SlotResult<()> {
        self.slots.ensure(count)
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_type(&self, slot: usize) -> SlotResult<SlotType> {
        Ok(self.value_type(self.slots.get(slot)?))
    }

    fn get_slot_bool(&self, slot: usize) -> SlotResult<bool> {
        match self.typed_slot(slot, SlotType::Bool)? {
            Value::Bool(b) => Ok(*b),
            _ => unreachable!("typed_slot checked the tag"),
        }
    }

    fn get_slot_double(&self, slot: usize) -> SlotResult<f64> {
        match self.typed_slot(slot, SlotType::Num)? {
            Value::Num(n) => Ok(*n),
            _ => unreachable!("typed_slot checked the tag"),
        }
    }

    fn get_slot_bytes(&self, slot: usize) -> SlotResult<Vec<u8>> {
        match self.typed_slot(slot, SlotType::String)? {
            Value::Str(bytes) => Ok(bytes.to_vec()),
            _ => unreachable!("typed_slot checked the tag"),
        }
    }

    fn get_slot_string(&self, slot: usize) -> SlotResult<String> {
        String::from_utf8(self.get_slot_bytes(slot)?).map_err(|_| SlotError::InvalidUtf8 { slot })
    }

    fn get_slot_foreign(&self, slot: usize) -> SlotResult<ForeignRef> {
        let r = self.object_ref(slot, SlotType::Foreign)?;
        match self.heap.get(r) {
            Some(Object::Foreign(foreign)) => Ok(foreign.data),
            _ => Err(SlotError::TypeMismatch {
                slot,
                expected: SlotType::Foreign,
                found: SlotType::Object,
            }),
        }
    }

    fn set_slot_null(&mut self, slot: usize) -> SlotResult<()> {
        self.slots.set(slot, Value::Null)
    }

    fn set_slot_bool(&mut self, slot: usize, value: bool) -> SlotResult<()> {
        self.slots.set(slot, Value::Bool(value))
    }

    fn set_slot_double(&mut self, slot: usize, value: f64) -> SlotResult<()> {
        self.slots.set(slot, Value::Num(value))
    }

    fn set_slot_bytes(&mut self, slot: usize, bytes: &[u8]) -> SlotResult<()> {
        self.slots.set(slot, Value::bytes(bytes))
    }

    fn set_slot_string(&mut self, slot: usize, text: &str) -> SlotResult<()> {
        self.slots.set(slot, Value::string(text))
    }

    fn set_slot_new_list(&mut self, slot: usize) -> SlotResult<()> {
        self.set_new_object(slot, Object::List(Vec::new()))
    }

    fn set_slot_new_map(&mut self, slot: usize) -> SlotResult<()> {
        self.set_new_object(slot, Object::Map(Vec::new()))
    }

    fn list_count(&self, slot: usize) -> SlotResult<usize> {
        Ok(self.list(slot)?.len())
    }

    fn get_list_element(&mut self, list_slot: usize, index: i64, element_slot: usize) -> SlotResult<()> {
        self.slots.get(element_slot)?;
        let items = self.list(list_slot)?;
        let value = items[resolve_index(index, items.len())?].clone();
        self.slots.set(element_slot, value)
    }

    fn set_list_element(&mut self, list_slot: usize, index: i64, element_slot: usize) -> SlotResult<()> {
        let value = self.slots.get(element_slot)?.clone();
        let items = self.list_mut(list_slot)?;
        let position = resolve_index(index, items.len())?;
        items[position] = value;
        Ok(())
    }

    fn insert_in_list(&mut self, list_slot: usize, index: i64, element_slot: usize) -> SlotResult<()> {
        let value = self.slots.get(element_slot)?.clone();
        let items = self.list_mut(list_slot)?;
        let count = items.len();
        let position = if index < 0 { index + count as i64 + 1 } else { index };
        if position < 0 || position > count as i64 {
            return Err(SlotError::IndexOutOfBounds { index, count });
        }
        items.insert(position as usize, value);
        Ok(())
    }

    fn map_count(&self, slot: usize) -> SlotResult<usize> {
        Ok(self.map(slot)?.len())
    }

    fn map_contains_key(&self, map_slot: usize, key_slot: usize) -> SlotResult<bool> {
        let key = self.slots.get(key_slot)?;
        Ok(self.map(map_slot)?.iter().any(|(k, _)| k.same_as(key)))
    }

    fn get_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) -> SlotResult<()> {
        self.slots.get(value_slot)?;
        let key = self.slots.get(key_slot)?;
        let value = self
            .map(map_slot)?
            .iter()
            .find(|(k, _)| k.same_as(key))
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        self.slots.set(value_slot, value)
    }

    fn set_map_value(&mut self, map_slot: usize, key_slot: usize, value_slot: usize) -> SlotResult<()> {
        let key = self.slots.get(key_slot)?.clone();
        let value = self.slots.get(value_slot)?.clone();
        let entries = self.map_mut(map_slot)?;
        match entries.iter_mut().find(|(k, _)| k.same_as(&key)) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
        Ok(())
    }

    fn get_map_entry(
        &mut self,
        map_slot: usize,
        index: usize,
        key_slot: usize,
        value_slot: usize,
    ) -> SlotResult<()> {
        self.slots.get(key_slot)?;
        self.slots.get(value_slot)?;
        let entries = self.map(map_slot)?;
        let (key, value) = entries
            .get(index)
            .cloned()
            .ok_or(SlotError::IndexOutOfBounds {
                index: index as i64,
                count: entries.len(),
            })?;
        self.slots.set(key_slot, key)?;
        self.slots.set(value_slot, value)
    }

    fn set_slot_new_foreign(&mut self, slot: usize, class_slot: usize, data: ForeignRef) -> SlotResult<()> {
        let class = self
            .slots
            .get(class_slot)?
            .as_obj()
            .filter(|r| self.heap.class(*r).is_some_and(|c| c.foreign.is_some()))
            .ok_or(SlotError::NotAClass { slot: class_slot })?;
        self.set_new_object(slot, Object::Foreign(ForeignObj { class, data }))
    }

    fn get_slot_handle(&mut self, slot: usize) -> SlotResult<Handle> {
        self.drain_handles();
        let value = self.slots.get(slot)?.clone();
        let handle = self.handles.export();
        self.handle_roots.insert(handle.id(), value);
        Ok(handle)
    }

    fn set_slot_handle(&mut self, slot: usize, handle: &Handle) -> SlotResult<()> {
        if !handle.belongs_to(&self.handles) {
            return Err(if handle.is_torn_down() {
                SlotError::TornDown(handle.id())
            } else {
                SlotError::ForeignHandle(handle.id())
            });
        }
        let value = self
            .handle_roots
            .get(&handle.id())
            .cloned()
            .ok_or(SlotError::TornDown(handle.id()))?;
        self.slots.set(slot, value)
    }

    fn handle_table(&self) -> &Rc<HandleTable> {
        &self.handles
    }

    fn make_call_handle(&mut self, signature: &str) -> BindingResult<CallHandle> {
        let handle = CallHandle::new(self.call_signatures.len() as u32, signature)?;
        self.call_signatures.push(Rc::from(signature));
        Ok(handle)
    }

    fn call(&mut self, method: &CallHandle) -> InterpretResult {
        if self.disposed {
            self.report_runtime(Trap::new("VM has been disposed."));
            return InterpretResult::RuntimeError;
        }
        self.drain_handles();
        self.maybe_collect();

        let known = self
            .call_signatures
            .get(method.id() as usize)
            .is_some_and(|sig| &**sig == method.signature());
        let needed = method.arity() + 1;
        let setup = if !known {
            Err(Trap::new(format!("invalid call handle for '{}'", method.signature())))
        } else if self.slots.len() < needed {
            Err(Trap::new(format!(
                "call to '{}' needs {} slots, found {}",
                method.signature(),
                needed,
                self.slots.len()
            )))
        } else {
            Ok(())
        };
        if let Err(trap) = setup {
            self.report_runtime(trap);
            return InterpretResult::RuntimeError;
        }

        let staged: Vec<Value> = self.slots.iter().take(needed).cloned().collect();
        let mut staged = staged.into_iter();
        let receiver = staged.next().unwrap_or_default();
        let args: Vec<Value> = staged.collect();

        self.depth += 1;
        let result = self
            .invoke(receiver, method.signature(), args)
            .map_err(|trap| trap.capture(&self.stack));
        self.depth -= 1;

        self.slots.truncate(1);
        match result {
            Ok(value) => {
                let _ = self.slots.set(0, value);
                InterpretResult::Success
            }
            Err(trap) => {
                let _ = self.slots.set(0, Value::Null);
                self.report_runtime(trap);
                InterpretResult::RuntimeError
            }
        }
    }

    fn interpret(&mut self, module: &str, source: &str) -> InterpretResult {
        if self.disposed {
            self.report_runtime(Trap::new("VM has been disposed."));
            return InterpretResult::RuntimeError;
        }
        self.drain_handles();
        self.maybe_collect();

        let lines = match self.compile(module, source) {
            Ok(lines) => lines,
            Err(err) => {
                self.report_compile(&err);
                return InterpretResult::CompileError;
            }
        };

        tracing::debug!(target: "sandbox", "Interpreting module '{}' ({} statements)", module, lines.len());
        self.depth += 1;
        self.stack.push(TraceFrame {
            module: module.to_string(),
            line: 0,
            location: SCRIPT_LOCATION.to_string(),
        });
        let result = self.run(module, lines).map_err(|trap| trap.capture(&self.stack));
        self.stack.pop();
        self.depth -= 1;

        match result {
            Ok(()) => InterpretResult::Success,
            Err(trap) => {
                self.report_runtime(trap);
                InterpretResult::RuntimeError
            }
        }
    }

    fn has_module(&self, module: &str) -> bool {
        self.modules.contains_key(module)
    }

    fn has_variable(&self, module: &str, name: &str) -> bool {
        self.modules
            .get(module)
            .is_some_and(|m| m.vars.contains_key(name))
    }

    fn get_variable(&mut self, module: &str, name: &str, slot: usize) -> SlotResult<()> {
        let value = self
            .modules
            .get(module)
            .and_then(|m| m.vars.get(name))
            .cloned()
            .ok_or_else(|| SlotError::UnknownVariable {
                module: module.to_string(),
                name: name.to_string(),
            })?;
        self.slots.set(slot, value)
    }

    fn abort_fiber(&mut self, slot: usize) -> SlotResult<()> {
        let value = self.slots.get(slot)?.clone();
        self.pending_abort = Some(value);
        Ok(())
    }

    fn call_depth(&self) -> usize {
        self.depth
    }

    fn collect_garbage(&mut self) {
        self.drain_handles();
        let Self {
            heap,
            modules,
            handle_roots,
            slots,
            saved_frames,
            temp_roots,
            pending_abort,
            ..
        } = self;
        let roots = modules
            .values()
            .flat_map(|m| m.vars.values())
            .chain(handle_roots.values())
            .chain(slots.iter())
            .chain(saved_frames.iter().flatten())
            .chain(temp_roots.iter())
            .chain(pending_abort.iter());
        let dead = heap.collect(roots);
        if !dead.is_empty() {
            tracing::debug!(target: "sandbox", "Finalizing {} foreign objects", dead.len());
        }
        self.finalize(dead);
    }
}

impl Drop for SandboxVm {
    fn drop(&mut self) {
        self.dispose();
    }
}
