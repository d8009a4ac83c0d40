//! 颜色
//!
//! `Color` 外部类只注册 allocate：状态是一个打包的 `u32`（小端 r,g,b,a），
//! 没有需要释放的原生资源，finalize 为空操作。

use crate::bindings::marshal::expect_num;
use crate::bindings::{ForeignRegistry, ForeignStore};
use crate::core::error::{BindingResult, BridgeError};
use crate::vm::sandbox::{ScriptCtx, ScriptLibrary, Trap, Value};

/// 新建颜色的默认值：不透明黑色
pub const OPAQUE_BLACK: u32 = 0xff00_0000;

const CHANNELS: [(&str, u32); 4] = [("r", 0), ("g", 8), ("b", 16), ("a", 24)];

fn channel(packed: u32, shift: u32) -> u8 {
    (packed >> shift) as u8
}

fn with_channel(packed: u32, shift: u32, value: u8) -> u32 {
    (packed & !(0xff << shift)) | ((value as u32) << shift)
}

/// `#rrggbb`，alpha 不为 255 时追加 `aa`
pub fn color_to_string(packed: u32) -> String {
    let [r, g, b, a] = packed.to_le_bytes();
    if a == 255 {
        format!("#{:02x}{:02x}{:02x}", r, g, b)
    } else {
        format!("#{:02x}{:02x}{:02x}{:02x}", r, g, b, a)
    }
}

/// 颜色服务
#[derive(Clone, Default)]
pub struct ColorService {
    store: ForeignStore<u32>,
}

impl ColorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self) -> &ForeignStore<u32> {
        &self.store
    }

    pub fn register(&self, registry: &mut ForeignRegistry, module: &str) -> BindingResult<()> {
        let store = self.store.clone();
        registry.register_class(
            module,
            "Color",
            move |vm| {
                let data = store.insert(OPAQUE_BLACK);
                vm.set_slot_new_foreign(0, 0, data)?;
                Ok(())
            },
            None,
        );

        for (name, shift) in CHANNELS {
            let store = self.store.clone();
            registry.register_method(module, "Color", false, name, move |vm| {
                let packed = store.with_slot(vm, 0, |packed| *packed)?;
                vm.set_slot_double(0, channel(packed, shift) as f64 / 255.0)?;
                Ok(())
            })?;

            let store = self.store.clone();
            let setter = format!("{}=(_)", name);
            registry.register_method(module, "Color", false, &setter, move |vm| {
                let value = expect_num(vm, 1, "value")?;
                let byte = (value.clamp(0.0, 1.0) * 255.999) as u8;
                store.with_slot(vm, 0, |packed| *packed = with_channel(*packed, shift, byte))?;
                vm.set_slot_null(0)?;
                Ok(())
            })?;
        }

        let store = self.store.clone();
        registry.register_method(module, "Color", false, "uint32", move |vm| {
            let packed = store.with_slot(vm, 0, |packed| *packed)?;
            vm.set_slot_double(0, packed as f64)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Color", false, "uint32=(_)", move |vm| {
            let value = expect_num(vm, 1, "value")?;
            if value < 0.0 || value > u32::MAX as f64 || value.fract() != 0.0 {
                return Err(BridgeError::abort("value must be an unsigned 32-bit integer"));
            }
            store.with_slot(vm, 0, |packed| *packed = value as u32)?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let store = self.store.clone();
        registry.register_method(module, "Color", false, "toString", move |vm| {
            let packed = store.with_slot(vm, 0, |packed| *packed)?;
            vm.set_slot_string(0, &color_to_string(packed))?;
            Ok(())
        })?;
        Ok(())
    }
}

fn assign_channels(ctx: &mut ScriptCtx<'_>) -> Result<Value, Trap> {
    let receiver = ctx.receiver();
    let args: Vec<Value> = ctx.args().to_vec();
    for ((name, _), value) in CHANNELS.iter().zip(args) {
        ctx.call(receiver.clone(), &format!("{}=(_)", name), vec![value])?;
    }
    Ok(Value::Null)
}

/// `Color.new(r, g, b)` 与 `Color.new(r, g, b, a)` 构造体，经由通道 setter 赋值
pub fn color_library(module: &str) -> ScriptLibrary {
    let mut library = ScriptLibrary::new();
    library
        .constructor(module, "Color", "new(_,_,_)", assign_channels)
        .constructor(module, "Color", "new(_,_,_,_)", assign_channels);
    library
}
