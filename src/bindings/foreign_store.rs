//! 外部对象的宿主侧状态表
//!
//! VM 中的外部对象只内嵌一个 [`ForeignRef`]；真正的原生状态保存在这里，
//! 生命周期跟随 VM 对象：allocate 时插入，finalize 时移除。

use crate::bindings::registry::FinalizeFn;
use crate::core::error::{BridgeError, BridgeResult};
use crate::vm::{ForeignRef, Vm};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FOREIGN_REF: AtomicU64 = AtomicU64::new(1);

fn next_foreign_ref() -> ForeignRef {
    ForeignRef(NEXT_FOREIGN_REF.fetch_add(1, Ordering::Relaxed))
}

struct StoreInner<T> {
    items: HashMap<ForeignRef, T>,
    allocated: u64,
    finalized: u64,
}

/// `ForeignRef` → `T` 的共享表
pub struct ForeignStore<T> {
    inner: Rc<RefCell<StoreInner<T>>>,
}

impl<T> Clone for ForeignStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> Default for ForeignStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ForeignStore<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                items: HashMap::new(),
                allocated: 0,
                finalized: 0,
            })),
        }
    }

    pub fn insert(&self, value: T) -> ForeignRef {
        let data = next_foreign_ref();
        let mut inner = self.inner.borrow_mut();
        inner.items.insert(data, value);
        inner.allocated += 1;
        data
    }

    pub fn remove(&self, data: ForeignRef) -> Option<T> {
        let mut inner = self.inner.borrow_mut();
        let removed = inner.items.remove(&data);
        if removed.is_some() {
            inner.finalized += 1;
        }
        removed
    }

    pub fn contains(&self, data: ForeignRef) -> bool {
        self.inner.borrow().items.contains_key(&data)
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (累计分配数, 累计终结数)
    pub fn counts(&self) -> (u64, u64) {
        let inner = self.inner.borrow();
        (inner.allocated, inner.finalized)
    }

    pub fn with<R>(&self, data: ForeignRef, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner.borrow().items.get(&data).map(f)
    }

    pub fn with_mut<R>(&self, data: ForeignRef, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.inner.borrow_mut().items.get_mut(&data).map(f)
    }

    /// 读取槽位中的外部对象并访问其状态
    ///
    /// 闭包内不得再进入 VM。
    pub fn with_slot<R>(
        &self,
        vm: &dyn Vm,
        slot: usize,
        f: impl FnOnce(&mut T) -> R,
    ) -> BridgeResult<R> {
        let data = vm.get_slot_foreign(slot)?;
        self.with_mut(data, f)
            .ok_or_else(|| BridgeError::General(format!("{} has no native state", data)))
    }
}

impl<T: 'static> ForeignStore<T> {
    /// 生成移除对应条目的终结回调
    pub fn finalizer(&self) -> FinalizeFn {
        let store = self.clone();
        Rc::new(move |data| {
            store.remove(data);
        })
    }
}
