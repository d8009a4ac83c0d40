//! 调用句柄表
//!
//! 宿主进入 VM 时用到的全部签名，启动时一次性解析，进程生命周期内复用。

use crate::core::error::BindingResult;
use crate::vm::{CallHandle, InterpretResult, Vm};
use std::rc::Rc;

/// 宿主使用的调用句柄
#[derive(Debug)]
pub struct CallHandles {
    pub call_0: CallHandle,
    pub init_0: CallHandle,
    pub update_0: CallHandle,
    pub update_1: CallHandle,
    pub update_2: CallHandle,
    pub update_3: CallHandle,
    pub resolve_2: CallHandle,
    pub progress_1: CallHandle,
    pub to_string: CallHandle,
    pub state: CallHandle,
    pub value: CallHandle,
    pub progress: CallHandle,
}

impl CallHandles {
    pub fn make(vm: &mut dyn Vm) -> BindingResult<Rc<Self>> {
        Ok(Rc::new(Self {
            call_0: vm.make_call_handle("call()")?,
            init_0: vm.make_call_handle("init_()")?,
            update_0: vm.make_call_handle("update_()")?,
            update_1: vm.make_call_handle("update_(_)")?,
            update_2: vm.make_call_handle("update_(_,_)")?,
            update_3: vm.make_call_handle("update_(_,_,_)")?,
            resolve_2: vm.make_call_handle("resolve_(_,_)")?,
            progress_1: vm.make_call_handle("progress_(_)")?,
            to_string: vm.make_call_handle("toString")?,
            state: vm.make_call_handle("state")?,
            value: vm.make_call_handle("value")?,
            progress: vm.make_call_handle("progress")?,
        }))
    }

    /// 按参数个数选择 `update_` 句柄
    pub fn update(&self, arity: usize) -> Option<&CallHandle> {
        match arity {
            0 => Some(&self.update_0),
            1 => Some(&self.update_1),
            2 => Some(&self.update_2),
            3 => Some(&self.update_3),
            _ => None,
        }
    }

    /// 调用已放好接收者与参数的句柄
    pub fn invoke(&self, vm: &mut dyn Vm, method: &CallHandle) -> InterpretResult {
        tracing::debug!(
            target: "bridge",
            "Calling {} (depth {})",
            method.signature(),
            vm.call_depth()
        );
        let result = vm.call(method);
        if !result.is_success() {
            tracing::debug!(target: "bridge", "Call to {} failed: {:?}", method.signature(), result);
        }
        result
    }
}
