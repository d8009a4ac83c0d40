//! 句柄表
//!
//! 宿主对 VM 对象的长期引用。[`Handle`] 是只能移动的 RAII 令牌：
//! drop 即释放，因此重复释放无法表达，提前返回、`?` 传播和 panic 展开
//! 都会走到释放路径。释放请求先进入队列，由 VM 在下次操作时取走并解除根引用。

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// 句柄编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}", self.0)
    }
}

/// 句柄计数快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    /// 累计导出数
    pub exported: u64,
    /// 累计释放数（含销毁后的释放）
    pub released: u64,
    /// 当前存活数
    pub live: u64,
    /// VM 销毁之后才到达的释放数
    pub released_after_teardown: u64,
}

impl HandleStats {
    /// 导出与释放是否一一对应
    pub fn is_balanced(&self) -> bool {
        self.exported == self.released && self.live == 0
    }
}

#[derive(Debug, Default)]
struct TableState {
    next_id: u64,
    live: HashSet<HandleId>,
    pending_release: Vec<HandleId>,
    stats: HandleStats,
    torn_down: bool,
}

/// 单个 VM 的句柄表
#[derive(Debug, Default)]
pub struct HandleTable {
    state: RefCell<TableState>,
}

impl HandleTable {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// 分配一个新句柄
    ///
    /// 由 VM 实现调用；VM 负责把句柄编号登记为根。
    pub fn export(self: &Rc<Self>) -> Handle {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = HandleId(state.next_id);
        state.live.insert(id);
        state.stats.exported += 1;
        state.stats.live += 1;
        drop(state);

        tracing::trace!(target: "bridge", "Exported {}", id);
        Handle {
            id,
            table: Rc::clone(self),
        }
    }

    fn release(&self, id: HandleId) {
        let mut state = self.state.borrow_mut();
        let was_live = state.live.remove(&id);
        debug_assert!(was_live, "{} released twice", id);
        state.stats.released += 1;
        state.stats.live -= 1;
        if state.torn_down {
            state.stats.released_after_teardown += 1;
        } else {
            state.pending_release.push(id);
        }
    }

    /// 取走待解除根引用的句柄编号
    pub fn drain_released(&self) -> Vec<HandleId> {
        std::mem::take(&mut self.state.borrow_mut().pending_release)
    }

    pub fn is_live(&self, id: HandleId) -> bool {
        self.state.borrow().live.contains(&id)
    }

    /// 标记所属 VM 已销毁
    ///
    /// 之后到达的释放只计数，不再排队。
    pub fn teardown(&self) {
        let mut state = self.state.borrow_mut();
        state.torn_down = true;
        state.pending_release.clear();
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.borrow().torn_down
    }

    pub fn stats(&self) -> HandleStats {
        self.state.borrow().stats
    }
}

/// VM 对象的引用令牌
///
/// 不可克隆；drop 时自动释放。
pub struct Handle {
    id: HandleId,
    table: Rc<HandleTable>,
}

impl Handle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// 显式释放（等同于 drop）
    pub fn release(self) {
        drop(self);
    }

    /// 是否由 `table` 签发
    pub fn belongs_to(&self, table: &Rc<HandleTable>) -> bool {
        Rc::ptr_eq(&self.table, table)
    }

    /// 签发它的 VM 是否已销毁
    pub fn is_torn_down(&self) -> bool {
        self.table.is_torn_down()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.table.release(self.id);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.id.0).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_releases_once() {
        let table = HandleTable::new();
        let first = table.export();
        let second = table.export();
        assert_ne!(first.id(), second.id());
        assert_eq!(table.stats().live, 2);

        first.release();
        drop(second);

        let stats = table.stats();
        assert_eq!(stats.exported, 2);
        assert_eq!(stats.released, 2);
        assert!(stats.is_balanced());
        assert_eq!(table.drain_released().len(), 2);
        assert!(table.drain_released().is_empty());
    }

    #[test]
    fn test_early_return_releases() {
        fn fails_after_export(table: &Rc<HandleTable>) -> Result<(), String> {
            let _handle = table.export();
            Err("invalid args".to_string())
        }

        let table = HandleTable::new();
        assert!(fails_after_export(&table).is_err());
        assert!(table.stats().is_balanced());
    }

    #[test]
    fn test_release_after_teardown_is_counted() {
        let table = HandleTable::new();
        let handle = table.export();
        table.teardown();
        assert!(handle.is_torn_down());

        drop(handle);
        let stats = table.stats();
        assert_eq!(stats.released_after_teardown, 1);
        assert!(stats.is_balanced());
        assert!(table.drain_released().is_empty());
    }

    #[test]
    fn test_belongs_to() {
        let a = HandleTable::new();
        let b = HandleTable::new();
        let handle = a.export();
        assert!(handle.belongs_to(&a));
        assert!(!handle.belongs_to(&b));
    }
}
