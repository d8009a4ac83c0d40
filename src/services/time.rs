//! 帧计时
//!
//! 宿主每帧以 `Time.update_(frame)` 推进帧号，脚本通过 `Time.frame` 读取。

use crate::vm::sandbox::{ScriptLibrary, Trap, Value};

fn validate_frame(frame: f64) -> Result<f64, Trap> {
    if frame < 0.0 || frame.fract() != 0.0 || !frame.is_finite() {
        return Err(Trap::new("frame must be a non-negative integer"));
    }
    Ok(frame)
}

pub fn time_library(module: &str) -> ScriptLibrary {
    let mut library = ScriptLibrary::new();
    library
        .static_method(module, "Time", "update_(_)", |ctx| {
            let frame = validate_frame(ctx.num_arg(0, "frame")?)?;
            ctx.set_field("frame", Value::Num(frame))?;
            Ok(Value::Null)
        })
        .static_method(module, "Time", "frame", |ctx| match ctx.field("frame") {
            Value::Null => Ok(Value::Num(0.0)),
            frame => Ok(frame),
        });
    library
}
