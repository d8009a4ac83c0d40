//! 脚本方法库
//!
//! 沙盒 VM 没有字节码解释器；脚本类的方法体由宿主以闭包形式提供，
//! 按 (模块, 类, 种类, 签名) 登记。方法体通过 [`ScriptCtx`] 访问接收者、
//! 参数和字段，并可以再次调用 VM 中的其他方法。

use super::heap::{Object, Value};
use super::{SandboxVm, Trap};
use std::collections::HashMap;
use std::rc::Rc;

/// 脚本方法体
pub type ScriptMethodFn = Rc<dyn Fn(&mut ScriptCtx<'_>) -> Result<Value, Trap>>;

/// 方法种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    Instance,
    Static,
    /// 在新实例上运行，返回值被忽略
    Constructor,
}

#[derive(Clone)]
pub struct LibraryMethod {
    pub kind: MethodKind,
    pub signature: String,
    pub body: ScriptMethodFn,
}

/// (模块, 类) → 方法体
#[derive(Clone, Default)]
pub struct ScriptLibrary {
    classes: HashMap<(String, String), Vec<LibraryMethod>>,
}

impl ScriptLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    fn add<F>(&mut self, module: &str, class: &str, kind: MethodKind, signature: &str, body: F) -> &mut Self
    where
        F: Fn(&mut ScriptCtx<'_>) -> Result<Value, Trap> + 'static,
    {
        self.classes
            .entry((module.to_string(), class.to_string()))
            .or_default()
            .push(LibraryMethod {
                kind,
                signature: signature.to_string(),
                body: Rc::new(body),
            });
        self
    }

    pub fn method<F>(&mut self, module: &str, class: &str, signature: &str, body: F) -> &mut Self
    where
        F: Fn(&mut ScriptCtx<'_>) -> Result<Value, Trap> + 'static,
    {
        self.add(module, class, MethodKind::Instance, signature, body)
    }

    pub fn static_method<F>(&mut self, module: &str, class: &str, signature: &str, body: F) -> &mut Self
    where
        F: Fn(&mut ScriptCtx<'_>) -> Result<Value, Trap> + 'static,
    {
        self.add(module, class, MethodKind::Static, signature, body)
    }

    pub fn constructor<F>(&mut self, module: &str, class: &str, signature: &str, body: F) -> &mut Self
    where
        F: Fn(&mut ScriptCtx<'_>) -> Result<Value, Trap> + 'static,
    {
        self.add(module, class, MethodKind::Constructor, signature, body)
    }

    pub fn methods_for(&self, module: &str, class: &str) -> &[LibraryMethod] {
        self.classes
            .get(&(module.to_string(), class.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// 合并另一个库，同键后者生效
    pub fn extend(&mut self, other: &ScriptLibrary) {
        for (key, methods) in &other.classes {
            self.classes
                .entry(key.clone())
                .or_default()
                .extend(methods.iter().cloned());
        }
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }
}

/// 脚本方法的执行上下文
pub struct ScriptCtx<'a> {
    pub(super) vm: &'a mut SandboxVm,
    pub(super) receiver: Value,
    pub(super) args: Vec<Value>,
}

impl<'a> ScriptCtx<'a> {
    pub fn receiver(&self) -> Value {
        self.receiver.clone()
    }

    pub fn arg(&self, index: usize) -> Value {
        self.args.get(index).cloned().unwrap_or_default()
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn num_arg(&self, index: usize, what: &str) -> Result<f64, Trap> {
        self.arg(index)
            .as_num()
            .ok_or_else(|| Trap::new(format!("{} must be a number", what)))
    }

    /// 读取接收者的字段（类接收者读取静态字段），缺失为 null
    pub fn field(&self, name: &str) -> Value {
        let Some(r) = self.receiver.as_obj() else {
            return Value::Null;
        };
        let fields = match self.vm.heap.get(r) {
            Some(Object::Instance(instance)) => &instance.fields,
            Some(Object::Class(class)) => &class.static_fields,
            _ => return Value::Null,
        };
        fields.get(name).cloned().unwrap_or_default()
    }

    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), Trap> {
        let r = self
            .receiver
            .as_obj()
            .ok_or_else(|| Trap::new("receiver has no fields"))?;
        let fields = match self.vm.heap.get_mut(r) {
            Some(Object::Instance(instance)) => &mut instance.fields,
            Some(Object::Class(class)) => &mut class.static_fields,
            _ => return Err(Trap::new("receiver has no fields")),
        };
        fields.insert(name.to_string(), value);
        Ok(())
    }

    /// 调用 VM 中的方法
    pub fn call(&mut self, receiver: Value, signature: &str, args: Vec<Value>) -> Result<Value, Trap> {
        self.vm.invoke(receiver, signature, args)
    }

    /// 新建列表；在当前方法返回前保持可达
    pub fn new_list(&mut self, items: Vec<Value>) -> Value {
        let list = Value::Obj(self.vm.heap.alloc(Object::List(items)));
        self.vm.temp_roots.push(list.clone());
        list
    }

    pub fn list_len(&self, list: &Value) -> usize {
        match list.as_obj().and_then(|r| self.vm.heap.get(r)) {
            Some(Object::List(items)) => items.len(),
            _ => 0,
        }
    }

    pub fn list_push(&mut self, list: &Value, item: Value) -> Result<(), Trap> {
        match list.as_obj().and_then(|r| self.vm.heap.get_mut(r)) {
            Some(Object::List(items)) => {
                items.push(item);
                Ok(())
            }
            _ => Err(Trap::new("expected a list")),
        }
    }

    /// 取出列表首元素
    pub fn list_shift(&mut self, list: &Value) -> Result<Option<Value>, Trap> {
        match list.as_obj().and_then(|r| self.vm.heap.get_mut(r)) {
            Some(Object::List(items)) if items.is_empty() => Ok(None),
            Some(Object::List(items)) => Ok(Some(items.remove(0))),
            _ => Err(Trap::new("expected a list")),
        }
    }

    /// 以 `toString` 协议得到显示文本
    pub fn display(&mut self, value: &Value) -> Result<String, Trap> {
        self.vm.display(value)
    }
}
