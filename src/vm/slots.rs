//! 槽位区
//!
//! 固定最大容量的参数/结果传递区。外部方法调用时整帧换出，返回后换回，
//! 因此嵌套调用不会看到外层帧的内容。

use crate::core::error::{SlotError, SlotResult};

/// 固定最大容量的槽位数组
#[derive(Debug, Clone)]
pub struct SlotArea<V> {
    slots: Vec<V>,
    max: usize,
}

impl<V: Clone + Default> SlotArea<V> {
    /// 创建空槽位区，`max` 为最大容量
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            max,
        }
    }

    /// 当前可寻址的槽位数
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    /// 保证至少 `count` 个槽位，新增槽位为默认值
    pub fn ensure(&mut self, count: usize) -> SlotResult<()> {
        if count > self.max {
            return Err(SlotError::CapacityExceeded {
                requested: count,
                max: self.max,
            });
        }
        if count > self.slots.len() {
            self.slots.resize(count, V::default());
        }
        Ok(())
    }

    pub fn get(&self, slot: usize) -> SlotResult<&V> {
        self.slots.get(slot).ok_or(SlotError::OutOfRange {
            slot,
            count: self.slots.len(),
        })
    }

    pub fn set(&mut self, slot: usize, value: V) -> SlotResult<()> {
        let count = self.slots.len();
        let cell = self
            .slots
            .get_mut(slot)
            .ok_or(SlotError::OutOfRange { slot, count })?;
        *cell = value;
        Ok(())
    }

    pub fn truncate(&mut self, count: usize) {
        self.slots.truncate(count);
    }

    /// 以 `frame` 替换当前内容，返回旧帧
    ///
    /// 超出容量的帧会被拒绝，旧帧保持不变。
    pub fn take(&mut self, frame: Vec<V>) -> SlotResult<Vec<V>> {
        if frame.len() > self.max {
            return Err(SlotError::CapacityExceeded {
                requested: frame.len(),
                max: self.max,
            });
        }
        Ok(std::mem::replace(&mut self.slots, frame))
    }

    /// 恢复 `take` 换出的帧，返回被替换的当前帧
    pub fn restore(&mut self, frame: Vec<V>) -> Vec<V> {
        std::mem::replace(&mut self.slots, frame)
    }

    pub fn iter(&self) -> impl Iterator<Item = &V> {
        self.slots.iter()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}
