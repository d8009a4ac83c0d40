//! 字符串拼接缓冲

use crate::bindings::marshal::{expect_bytes, expect_num};
use crate::bindings::{ForeignRegistry, ForeignStore};
use crate::core::error::{BindingResult, BridgeError};

/// `StringBuilder` 外部类
#[derive(Clone, Default)]
pub struct StringBuilderService {
    store: ForeignStore<Vec<u8>>,
}

impl StringBuilderService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &ForeignStore<Vec<u8>> {
        &self.store
    }

    pub fn register(&self, registry: &mut ForeignRegistry, module: &str) -> BindingResult<()> {
        let store = self.store.clone();
        registry.register_class(
            module,
            "StringBuilder",
            move |vm| {
                let data = store.insert(Vec::new());
                if let Err(err) = vm.set_slot_new_foreign(0, 0, data) {
                    store.remove(data);
                    return Err(err.into());
                }
                Ok(())
            },
            Some(self.store.finalizer()),
        );

        let store = self.store.clone();
        registry.register_method(module, "StringBuilder", false, "addString(_)", move |vm| {
            let text = expect_bytes(vm, 1, "arg")?;
            store.with_slot(vm, 0, |buffer| buffer.extend_from_slice(&text))?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "StringBuilder", false, "addByte(_)", move |vm| {
            let value = expect_num(vm, 1, "byte")?;
            if !(0.0..=255.0).contains(&value) || value.fract() != 0.0 {
                return Err(BridgeError::abort("byte must be an integer in 0..255"));
            }
            store.with_slot(vm, 0, |buffer| buffer.push(value as u8))?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "StringBuilder", false, "clear()", move |vm| {
            store.with_slot(vm, 0, |buffer| buffer.clear())?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "StringBuilder", false, "count", move |vm| {
            let count = store.with_slot(vm, 0, |buffer| buffer.len())?;
            vm.set_slot_double(0, count as f64)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "StringBuilder", false, "toString", move |vm| {
            let bytes = store.with_slot(vm, 0, |buffer| buffer.clone())?;
            vm.set_slot_bytes(0, &bytes)?;
            Ok(())
        })?;
        Ok(())
    }
}
