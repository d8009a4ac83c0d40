//! 定时器
//!
//! `Timer.sleep_(ms, promise)`：在调度器上等待给定毫秒数后以 null 解析。

use crate::bindings::marshal::{expect_num, expect_object, HostValue};
use crate::bindings::ForeignRegistry;
use crate::core::error::{BindingResult, BridgeError};
use crate::scripting::AsyncBridge;
use std::time::Duration;

/// 校验等待时长
fn sleep_duration(ms: f64) -> Result<Duration, BridgeError> {
    if !ms.is_finite() || ms < 0.0 {
        return Err(BridgeError::abort("ms must be a non-negative number"));
    }
    Ok(Duration::from_secs_f64(ms / 1000.0))
}

pub fn register(registry: &mut ForeignRegistry, module: &str, bridge: &AsyncBridge) -> BindingResult<()> {
    let bridge = bridge.clone();
    registry.register_method(module, "Timer", true, "sleep_(_,_)", move |vm| {
        let duration = sleep_duration(expect_num(vm, 1, "ms")?)?;
        expect_object(vm, 2, "promise")?;
        let continuation = vm.get_slot_handle(2)?;
        bridge.spawn(continuation, move |_| async move {
            tokio::time::sleep(duration).await;
            Ok(HostValue::Null)
        })?;
        vm.set_slot_null(0)?;
        Ok(())
    })
}
