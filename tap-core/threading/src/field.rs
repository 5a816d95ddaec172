//! 线程单元局部字段
//!
//! `ThreadField` 为每个线程单元提供一个独立的值槽位，读取时按模式决定是否沿父链查找：
//! - `Flat`: 只读取本单元的槽位
//! - `Cached`: 本单元没有值时向上查找，找到后写回本单元
//! - `Inherited`: 每次都沿父链向上查找，不写回
//!
//! 字段通常声明为 `static`，首次访问时分配全局唯一的槽位索引。

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use crate::unit::ThreadUnit;

static NEXT_FIELD_INDEX: AtomicUsize = AtomicUsize::new(0);

/// 字段查找模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMode {
    Flat,
    Cached,
    Inherited,
}

/// 线程单元局部字段
pub struct ThreadField<T> {
    mode: FieldMode,
    index: OnceLock<usize>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ThreadField<T>
where
    T: Send + Sync + 'static,
{
    pub const fn new(mode: FieldMode) -> Self {
        Self {
            mode,
            index: OnceLock::new(),
            _marker: PhantomData,
        }
    }

    pub fn mode(&self) -> FieldMode {
        self.mode
    }

    pub(crate) fn index(&self) -> usize {
        *self
            .index
            .get_or_init(|| NEXT_FIELD_INDEX.fetch_add(1, Ordering::Relaxed))
    }

    /// 读取字段值
    pub fn get(&self, unit: &ThreadUnit) -> Option<Arc<T>> {
        let index = self.index();
        if let Some(value) = downcast::<T>(unit.local(index)) {
            return Some(value);
        }
        if self.mode == FieldMode::Flat {
            return None;
        }

        let mut current = unit.parent();
        while let Some(ancestor) = current {
            if let Some(raw) = ancestor.local(index) {
                let value = downcast::<T>(Some(raw.clone()))?;
                if self.mode == FieldMode::Cached {
                    unit.set_local(index, Some(raw));
                }
                return Some(value);
            }
            current = ancestor.parent();
        }
        None
    }

    /// 设置本单元的值，不影响祖先
    pub fn set(&self, unit: &ThreadUnit, value: T) {
        unit.set_local(self.index(), Some(Arc::new(value)));
    }

    /// 清除本单元的值
    pub fn clear(&self, unit: &ThreadUnit) {
        unit.set_local(self.index(), None);
    }

    /// 读取当前线程单元上的值
    pub fn get_current(&self) -> Option<Arc<T>> {
        self.get(&ThreadUnit::current())
    }

    /// 设置当前线程单元上的值
    pub fn set_current(&self, value: T) {
        self.set(&ThreadUnit::current(), value)
    }
}

fn downcast<T>(raw: Option<crate::unit::LocalValue>) -> Option<Arc<T>>
where
    T: Send + Sync + 'static,
{
    raw.and_then(|value| value.downcast::<T>().ok())
}
