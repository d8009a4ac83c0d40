//! 字节数组
//!
//! `Array` 外部类：VM 对象只内嵌 [`ForeignRef`]，字节保存在宿主侧的
//! [`ForeignStore`] 中，对象被回收时由 finalize 一并释放。

use crate::bindings::marshal::{expect_bytes, expect_num, validate_index, validate_length};
use crate::bindings::{ForeignRegistry, ForeignStore};
use crate::core::error::{BindingResult, BridgeError, BridgeResult};
use crate::vm::{ForeignRef, Vm};
use base64::Engine as _;
use std::fmt::Write as _;

const SIZE: &str = "Array size";

/// 字节数组服务
#[derive(Clone, Default)]
pub struct ArrayService {
    store: ForeignStore<Vec<u8>>,
}

impl ArrayService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &ForeignStore<Vec<u8>> {
        &self.store
    }

    /// 以 `class_slot` 中的 `Array` 类创建新对象写入 `slot`
    ///
    /// 创建失败时宿主侧状态随即移除，不会残留。
    pub fn create(&self, vm: &mut dyn Vm, slot: usize, class_slot: usize, bytes: Vec<u8>) -> BridgeResult<ForeignRef> {
        let data = self.store.insert(bytes);
        if let Err(err) = vm.set_slot_new_foreign(slot, class_slot, data) {
            self.store.remove(data);
            return Err(err.into());
        }
        Ok(data)
    }

    /// 读取槽位中数组的字节副本
    pub fn bytes(&self, vm: &dyn Vm, slot: usize) -> BridgeResult<Vec<u8>> {
        self.store.with_slot(vm, slot, |bytes| bytes.clone())
    }

    pub fn register(&self, registry: &mut ForeignRegistry, module: &str) -> BindingResult<()> {
        let arrays = self.clone();
        registry.register_class(
            module,
            "Array",
            move |vm| {
                let size = validate_length(vm, 1, SIZE)?;
                arrays.create(vm, 0, 0, vec![0; size])?;
                Ok(())
            },
            Some(self.store.finalizer()),
        );

        let arrays = self.clone();
        registry.register_method(module, "Array", true, "fromBase64(_)", move |vm| {
            let text = expect_bytes(vm, 1, "args")?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(&text)
                .map_err(|_| BridgeError::abort("invalid base64 string"))?;
            arrays.create(vm, 0, 0, bytes)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "count", move |vm| {
            let count = store.with_slot(vm, 0, |bytes| bytes.len())?;
            vm.set_slot_double(0, count as f64)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "resize(_)", move |vm| {
            let size = validate_length(vm, 1, SIZE)?;
            store.with_slot(vm, 0, |bytes| bytes.resize(size, 0))?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "getByte(_)", move |vm| {
            let count = store.with_slot(vm, 0, |bytes| bytes.len())?;
            let index = validate_index(vm, 1, count, "index")?;
            let byte = store.with_slot(vm, 0, |bytes| bytes[index])?;
            vm.set_slot_double(0, byte as f64)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "setByte(_,_)", move |vm| {
            let count = store.with_slot(vm, 0, |bytes| bytes.len())?;
            let index = validate_index(vm, 1, count, "index")?;
            let value = to_byte(expect_num(vm, 2, "value")?);
            store.with_slot(vm, 0, |bytes| bytes[index] = value)?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "fillBytes(_)", move |vm| {
            let value = to_byte(expect_num(vm, 1, "value")?);
            store.with_slot(vm, 0, |bytes| bytes.fill(value))?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "toBase64", move |vm| {
            let encoded = store.with_slot(vm, 0, |bytes| {
                base64::engine::general_purpose::STANDARD.encode(bytes)
            })?;
            vm.set_slot_string(0, &encoded)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "toString", move |vm| {
            let hex = store.with_slot(vm, 0, |bytes| hex_dump(bytes))?;
            vm.set_slot_string(0, &hex)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "asString", move |vm| {
            let bytes = store.with_slot(vm, 0, |bytes| bytes.clone())?;
            vm.set_slot_bytes(0, &bytes)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Array", false, "setFromString(_)", move |vm| {
            let source = expect_bytes(vm, 1, "arg")?;
            store.with_slot(vm, 0, |bytes| {
                if source.len() > bytes.len() {
                    return Err(BridgeError::abort("string is too large"));
                }
                bytes[..source.len()].copy_from_slice(&source);
                Ok(())
            })??;
            vm.set_slot_null(0)?;
            Ok(())
        })?;
        Ok(())
    }
}

/// 与 C 的 `(uint8_t)` 截断一致：取整后按 256 取模
fn to_byte(value: f64) -> u8 {
    (value as i64) as u8
}

/// 每个字节两位小写十六进制，无分隔符
fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::{read_slot, HostValue};
    use crate::config::VmConfig;
    use crate::vm::sandbox::{SandboxVm, ScriptLibrary};
    use std::rc::Rc;

    const DECLS: &str = "foreign class Array\n\
                         foreign static Array.fromBase64(_)\n\
                         foreign Array.count\n\
                         foreign Array.resize(_)\n\
                         foreign Array.getByte(_)\n\
                         foreign Array.setByte(_,_)\n\
                         foreign Array.fillBytes(_)\n\
                         foreign Array.toBase64\n\
                         foreign Array.toString\n\
                         foreign Array.asString\n\
                         foreign Array.setFromString(_)";

    fn vm(arrays: &ArrayService) -> SandboxVm {
        let mut registry = ForeignRegistry::new();
        arrays.register(&mut registry, "main").unwrap();
        let mut vm = SandboxVm::new(&VmConfig::default(), Rc::new(registry), Rc::new(ScriptLibrary::new()));
        assert!(vm.interpret("main", DECLS).is_success());
        vm
    }

    fn var(vm: &mut SandboxVm, name: &str) -> HostValue {
        vm.ensure_slots(1).unwrap();
        vm.get_variable("main", name, 0).unwrap();
        read_slot(vm, 0).unwrap()
    }

    #[test]
    fn test_bytes_and_encodings() {
        let arrays = ArrayService::new();
        let mut vm = vm(&arrays);
        let source = "var a = Array.new(3)\n\
                      call a.setByte(0, 1)\n\
                      call a.setByte(-1, 255)\n\
                      call a.setByte(1, 258)\n\
                      var hex = a.toString\n\
                      var b64 = a.toBase64\n\
                      var last = a.getByte(2)\n\
                      var copy = Array.fromBase64(b64)\n\
                      var n = copy.count";
        assert!(vm.interpret("main", source).is_success());
        assert_eq!(var(&mut vm, "hex"), HostValue::from("0102ff"));
        assert_eq!(var(&mut vm, "b64"), HostValue::from("AQL/"));
        assert_eq!(var(&mut vm, "last"), HostValue::Num(255.0));
        assert_eq!(var(&mut vm, "n"), HostValue::Num(3.0));
        assert_eq!(arrays.store().len(), 2);
    }

    #[test]
    fn test_resize_fill_and_strings() {
        let arrays = ArrayService::new();
        let mut vm = vm(&arrays);
        let source = "var a = Array.new(2)\n\
                      call a.resize(4)\n\
                      call a.fillBytes(65)\n\
                      call a.setFromString(\"hi\")\n\
                      var text = a.asString";
        assert!(vm.interpret("main", source).is_success());
        assert_eq!(var(&mut vm, "text"), HostValue::from("hiAA"));
    }

    #[test]
    fn test_validation_aborts() {
        let arrays = ArrayService::new();
        let mut vm = vm(&arrays);
        let messages = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = Rc::clone(&messages);
        vm.set_error_fn(Box::new(move |kind, _, _, message| {
            if kind == crate::vm::ErrorKind::Runtime {
                sink.borrow_mut().push(message.to_string());
            }
        }));

        for source in [
            "var bad = Array.new(-1)",
            "var a = Array.new(2)\ncall a.getByte(2)",
            "var b = Array.new(2)\ncall b.setByte(0, \"x\")",
            "var c = Array.new(1)\ncall c.setFromString(\"too long\")",
            "var d = Array.fromBase64(\"***\")",
        ] {
            assert!(!vm.interpret("main", source).is_success());
        }
        assert_eq!(
            *messages.borrow(),
            vec![
                "Array size must be a non-negative integer",
                "index out of bounds",
                "value must be a number",
                "string is too large",
                "invalid base64 string",
            ]
        );
    }

    #[test]
    fn test_collected_arrays_release_native_state() {
        let arrays = ArrayService::new();
        let mut vm = vm(&arrays);
        assert!(vm.interpret("main", "call Array.new(16)").is_success());
        assert_eq!(arrays.store().len(), 1);
        vm.collect_garbage();
        assert!(arrays.store().is_empty());
        assert_eq!(arrays.store().counts(), (1, 1));
    }
}
