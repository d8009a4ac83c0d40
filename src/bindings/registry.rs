//! 外部调用注册表
//!
//! (模块, 类, 是否静态, 签名) → 宿主回调；(模块, 类) → (allocate, finalize)。
//! 启动时一次性填充，之后以 `Rc` 共享给 VM，只读。

use crate::core::error::{BindingError, BindingResult, BridgeResult};
use crate::vm::{signature_arity, ForeignRef, Vm};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// 外部方法回调
///
/// 返回 `Err` 时 VM 以错误消息终止当前 fiber。
pub type ForeignMethodFn = Rc<dyn Fn(&mut dyn Vm) -> BridgeResult<()>>;

/// 外部对象终结回调，由回收器在不确定的时刻调用
pub type FinalizeFn = Rc<dyn Fn(ForeignRef)>;

/// 外部方法键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub module: String,
    pub class: String,
    pub is_static: bool,
    pub signature: String,
}

impl MethodKey {
    pub fn new(module: &str, class: &str, is_static: bool, signature: &str) -> Self {
        Self {
            module: module.to_string(),
            class: class.to_string(),
            is_static,
            signature: signature.to_string(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_static {
            write!(f, "{}:static {}.{}", self.module, self.class, self.signature)
        } else {
            write!(f, "{}:{}.{}", self.module, self.class, self.signature)
        }
    }
}

/// 外部类键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassKey {
    pub module: String,
    pub class: String,
}

impl ClassKey {
    pub fn new(module: &str, class: &str) -> Self {
        Self {
            module: module.to_string(),
            class: class.to_string(),
        }
    }
}

impl fmt::Display for ClassKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.class)
    }
}

/// 外部类的分配/终结回调
///
/// `allocate` 在构造时被调用：槽位 0 为类本身，1.. 为构造参数，
/// 必须通过 `set_slot_new_foreign` 在槽位 0 写入新对象。
/// 只注册 `allocate` 的类是合法的，终结时什么也不做。
#[derive(Clone)]
pub struct ForeignClassMethods {
    pub allocate: ForeignMethodFn,
    pub finalize: Option<FinalizeFn>,
}

impl ForeignClassMethods {
    pub fn new(allocate: ForeignMethodFn, finalize: Option<FinalizeFn>) -> Self {
        Self { allocate, finalize }
    }

    pub fn finalize(&self, data: ForeignRef) {
        if let Some(finalize) = &self.finalize {
            finalize(data);
        }
    }
}

impl fmt::Debug for ForeignClassMethods {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignClassMethods")
            .field("finalize", &self.finalize.is_some())
            .finish()
    }
}

/// 模块声明的外部绑定集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleDecls {
    pub module: String,
    pub classes: Vec<ClassKey>,
    pub methods: Vec<MethodKey>,
}

impl ModuleDecls {
    pub fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.methods.is_empty()
    }
}

/// 外部调用注册表
#[derive(Default)]
pub struct ForeignRegistry {
    methods: HashMap<MethodKey, ForeignMethodFn>,
    classes: HashMap<ClassKey, ForeignClassMethods>,
}

impl ForeignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册外部方法，同键后注册者生效
    pub fn register_method<F>(
        &mut self,
        module: &str,
        class: &str,
        is_static: bool,
        signature: &str,
        method: F,
    ) -> BindingResult<()>
    where
        F: Fn(&mut dyn Vm) -> BridgeResult<()> + 'static,
    {
        signature_arity(signature)?;
        let key = MethodKey::new(module, class, is_static, signature);
        if self.methods.insert(key.clone(), Rc::new(method)).is_some() {
            tracing::warn!(target: "bridge.registry", "Foreign method {} re-registered", key);
        } else {
            tracing::debug!(target: "bridge.registry", "Registered foreign method {}", key);
        }
        Ok(())
    }

    /// 注册外部类
    pub fn register_class<A>(
        &mut self,
        module: &str,
        class: &str,
        allocate: A,
        finalize: Option<FinalizeFn>,
    ) where
        A: Fn(&mut dyn Vm) -> BridgeResult<()> + 'static,
    {
        let key = ClassKey::new(module, class);
        let methods = ForeignClassMethods::new(Rc::new(allocate), finalize);
        if self.classes.insert(key.clone(), methods).is_some() {
            tracing::warn!(target: "bridge.registry", "Foreign class {} re-registered", key);
        } else {
            tracing::debug!(target: "bridge.registry", "Registered foreign class {}", key);
        }
    }

    pub fn resolve_method(
        &self,
        module: &str,
        class: &str,
        is_static: bool,
        signature: &str,
    ) -> Option<ForeignMethodFn> {
        self.methods
            .get(&MethodKey::new(module, class, is_static, signature))
            .cloned()
    }

    pub fn resolve_class(&self, module: &str, class: &str) -> Option<ForeignClassMethods> {
        self.classes.get(&ClassKey::new(module, class)).cloned()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// 校验模块声明的每个外部类/方法都已注册，一次性报告所有缺失项
    pub fn validate(&self, decls: &ModuleDecls) -> BindingResult<()> {
        let mut missing: Vec<String> = decls
            .classes
            .iter()
            .filter(|key| !self.classes.contains_key(key))
            .map(|key| format!("{} (allocator)", key))
            .collect();
        missing.extend(
            decls
                .methods
                .iter()
                .filter(|key| !self.methods.contains_key(key))
                .map(ToString::to_string),
        );

        if missing.is_empty() {
            Ok(())
        } else {
            tracing::error!(
                target: "bridge.registry",
                "Module '{}' has {} unresolved foreign declaration(s)",
                decls.module,
                missing.len()
            );
            Err(BindingError::Unresolved(missing))
        }
    }
}

impl fmt::Debug for ForeignRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForeignRegistry")
            .field("methods", &self.methods.len())
            .field("classes", &self.classes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_last_write_wins() {
        let mut registry = ForeignRegistry::new();
        registry
            .register_method("m", "C", true, "f()", |_| Err(crate::core::BridgeError::abort("first")))
            .unwrap();
        registry.register_method("m", "C", true, "f()", |_| Ok(())).unwrap();
        assert_eq!(registry.method_count(), 1);
        assert!(registry.resolve_method("m", "C", true, "f()").is_some());
        assert!(registry.resolve_method("m", "C", false, "f()").is_none());
    }

    #[test]
    fn test_invalid_signature_rejected() {
        let mut registry = ForeignRegistry::new();
        let result = registry.register_method("m", "C", false, "f(x)", |_| Ok(()));
        assert_eq!(result, Err(BindingError::InvalidSignature("f(x)".to_string())));
    }

    #[test]
    fn test_allocate_only_class_finalize_is_noop() {
        let mut registry = ForeignRegistry::new();
        registry.register_class("m", "Color", |_| Ok(()), None);
        let methods = registry.resolve_class("m", "Color").unwrap();
        assert!(methods.finalize.is_none());
        methods.finalize(ForeignRef(1));

        let calls = Rc::new(Cell::new(0));
        let counter = Rc::clone(&calls);
        let finalize: FinalizeFn = Rc::new(move |_| counter.set(counter.get() + 1));
        registry.register_class("m", "Buffer", |_| Ok(()), Some(finalize));
        registry.resolve_class("m", "Buffer").unwrap().finalize(ForeignRef(2));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_validate_reports_all_missing() {
        let mut registry = ForeignRegistry::new();
        registry.register_method("m", "C", false, "ok()", |_| Ok(())).unwrap();

        let mut decls = ModuleDecls::new("m");
        decls.methods.push(MethodKey::new("m", "C", false, "ok()"));
        decls.methods.push(MethodKey::new("m", "C", true, "gone(_)"));
        decls.classes.push(ClassKey::new("m", "Missing"));

        match registry.validate(&decls) {
            Err(BindingError::Unresolved(missing)) => {
                assert_eq!(
                    missing,
                    vec![
                        "m:Missing (allocator)".to_string(),
                        "m:static C.gone(_)".to_string()
                    ]
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
