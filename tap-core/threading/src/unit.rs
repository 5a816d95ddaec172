//! 线程单元
//!
//! 线程单元是线程池的调度单位：每个单元有唯一 ID、可选名称、创建时确定且不再改变的父单元、
//! 从父单元派生的取消令牌，以及一小块可被子单元继承的局部存储。
//!
//! 层级完成计数：每个单元的计数器初始为 1（自身），每创建一个子单元加 1；
//! 自身动作执行完毕或子单元层级完成时减 1，归零即进入 `HierarchyCompleted`，
//! 并沿父链迭代向上传播。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::field::ThreadField;
use crate::pool::{ThreadPool, UnitTask};
use crate::sync::{self, ManualResetEvent};
use crate::{Result, ThreadingError};

/// 单次等待的最长时间
const MAX_WAIT_SLICE: Duration = Duration::from_secs(60 * 60);

const DEFAULT_ABORT_REASON: &str = "线程单元已中止";

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<ThreadUnit>> = const { RefCell::new(None) };
}

pub(crate) type LocalValue = Arc<dyn Any + Send + Sync>;

type CompletionCallback = Box<dyn FnOnce(&ThreadUnit) + Send>;

/// 线程单元 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        Self(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 线程单元状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnitState {
    /// 已入队，等待工作线程
    Queued = 0,
    /// 执行中
    Running = 1,
    /// 自身动作已完成，仍有子单元未完成
    Completed = 2,
    /// 自身及全部后代均已完成（终态）
    HierarchyCompleted = 3,
}

impl UnitState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Queued,
            1 => Self::Running,
            2 => Self::Completed,
            _ => Self::HierarchyCompleted,
        }
    }
}

struct UnitInner {
    id: UnitId,
    name: Option<String>,
    parent: Option<ThreadUnit>,
    /// 是否计入父单元的层级计数
    counted_in_parent: bool,
    pool: ThreadPool,
    state: AtomicU8,
    pending: AtomicUsize,
    token: OnceLock<CancellationToken>,
    abort_reason: Mutex<Option<String>>,
    locals: Mutex<Vec<Option<LocalValue>>>,
    on_hierarchy_completed: Mutex<Vec<CompletionCallback>>,
    completed: ManualResetEvent,
    hierarchy_completed: ManualResetEvent,
}

/// 线程单元句柄
///
/// 克隆开销很小，所有克隆指向同一个单元。
#[derive(Clone)]
pub struct ThreadUnit {
    inner: Arc<UnitInner>,
}

impl ThreadUnit {
    pub(crate) fn create(
        parent: Option<&ThreadUnit>,
        pool: &ThreadPool,
        name: Option<String>,
        state: UnitState,
    ) -> Self {
        let counted_in_parent = parent.map(|p| p.retain_child()).unwrap_or(false);
        if let Some(parent) = parent {
            if !counted_in_parent {
                debug!(
                    "父线程单元 {} 层级已完成，新单元不计入其层级计数",
                    parent.id()
                );
            }
        }

        Self {
            inner: Arc::new(UnitInner {
                id: UnitId::next(),
                name,
                parent: parent.cloned(),
                counted_in_parent,
                pool: pool.clone(),
                state: AtomicU8::new(state as u8),
                pending: AtomicUsize::new(1),
                token: OnceLock::new(),
                abort_reason: Mutex::new(None),
                locals: Mutex::new(Vec::new()),
                on_hierarchy_completed: Mutex::new(Vec::new()),
                completed: ManualResetEvent::new(false),
                hierarchy_completed: ManualResetEvent::new(false),
            }),
        }
    }

    /// 获取当前物理线程关联的线程单元
    ///
    /// 不在线程池中的线程首次调用时，会在全局线程池上创建一个根单元并与该线程绑定。
    pub fn current() -> ThreadUnit {
        if let Some(unit) = Self::try_current() {
            return unit;
        }

        let thread_name = std::thread::current().name().map(str::to_string);
        let root = ThreadPool::global().root_unit(thread_name.as_deref());
        CURRENT.with(|current| *current.borrow_mut() = Some(root.clone()));
        root
    }

    /// 获取当前线程关联的线程单元（不创建）
    pub fn try_current() -> Option<ThreadUnit> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// 将线程单元绑定到当前物理线程，守卫析构时恢复
    pub(crate) fn enter(unit: ThreadUnit) -> CurrentGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(unit));
        CurrentGuard { previous }
    }

    pub fn id(&self) -> UnitId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// 用于日志的显示名称
    pub fn display_name(&self) -> String {
        match &self.inner.name {
            Some(name) => format!("{} ({})", name, self.inner.id),
            None => self.inner.id.to_string(),
        }
    }

    pub fn parent(&self) -> Option<&ThreadUnit> {
        self.inner.parent.as_ref()
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.inner.pool
    }

    pub fn state(&self) -> UnitState {
        UnitState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: UnitState) {
        self.inner.state.store(state as u8, Ordering::Release);
    }

    /// 尚未完成的层级计数（自身 + 未完成的子单元）
    pub fn pending_hierarchy(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// 判断是否为 `ancestor` 的后代（不含自身）
    pub fn is_descendant_of(&self, ancestor: &ThreadUnit) -> bool {
        let mut current = self.parent();
        while let Some(unit) = current {
            if unit == ancestor {
                return true;
            }
            current = unit.parent();
        }
        false
    }

    /// 取消令牌
    ///
    /// 首次访问时从父单元的令牌派生（根单元从线程池根令牌派生）。
    /// 父令牌已取消时派生出的令牌同样处于取消状态。
    pub fn token(&self) -> &CancellationToken {
        self.inner.token.get_or_init(|| match &self.inner.parent {
            Some(parent) => parent.token().child_token(),
            None => self.inner.pool.root_token().child_token(),
        })
    }

    pub fn is_aborted(&self) -> bool {
        self.token().is_cancelled()
    }

    /// 中止原因，取自自身或最近一个被显式中止的祖先
    pub fn abort_reason(&self) -> Option<String> {
        let mut current = Some(self);
        while let Some(unit) = current {
            if let Some(reason) = unit.inner.abort_reason.lock().clone() {
                return Some(reason);
            }
            current = unit.parent();
        }
        None
    }

    /// 中止线程单元及其整个子树
    ///
    /// 其它子树通过令牌轮询/等待感知取消；若调用方所在单元就是目标或其后代，
    /// 额外返回 `OperationCanceled`，使调用栈立即展开。
    pub fn abort(&self, reason: Option<&str>) -> Result<()> {
        let reason = reason.unwrap_or(DEFAULT_ABORT_REASON).to_string();
        {
            let mut slot = self.inner.abort_reason.lock();
            if slot.is_none() {
                *slot = Some(reason.clone());
            }
        }

        debug!("中止线程单元 {}: {}", self.display_name(), reason);
        self.token().cancel();
        sync::notify_abort();

        if let Some(current) = Self::try_current() {
            if current == *self || current.is_descendant_of(self) {
                return Err(ThreadingError::OperationCanceled(reason));
            }
        }
        Ok(())
    }

    /// 已被取消时返回 `OperationCanceled`
    pub fn throw_if_aborted(&self) -> Result<()> {
        if self.is_aborted() {
            let reason = self
                .abort_reason()
                .unwrap_or_else(|| DEFAULT_ABORT_REASON.to_string());
            return Err(ThreadingError::OperationCanceled(reason));
        }
        Ok(())
    }

    /// 可被取消的休眠
    ///
    /// 按不超过一小时的片段等待中止信号，被取消时立即返回 `OperationCanceled`。
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.throw_if_aborted()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let slice = (deadline - now).min(MAX_WAIT_SLICE);
            sync::wait_for_abort(slice, || self.is_aborted());
        }
    }

    /// 在当前线程单元上休眠
    pub fn sleep_current(duration: Duration) -> Result<()> {
        Self::current().sleep(duration)
    }

    /// 以自身为父单元启动子单元
    pub fn start<F>(&self, name: Option<&str>, action: F) -> ThreadUnit
    where
        F: FnOnce(&ThreadUnit) + Send + 'static,
    {
        let mut builder = UnitBuilder::new().parent(self);
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder.spawn(&self.inner.pool, action)
    }

    /// 以自身为父单元启动子单元并返回结果句柄
    pub fn start_async<T, F>(&self, name: Option<&str>, action: F) -> UnitTask<T>
    where
        T: Send + 'static,
        F: FnOnce(&ThreadUnit) -> T + Send + 'static,
    {
        let mut builder = UnitBuilder::new().parent(self);
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder.spawn_async(&self.inner.pool, action)
    }

    /// 注册层级完成回调
    ///
    /// 单元层级已完成时立即在调用线程上执行。
    pub fn on_hierarchy_completed<F>(&self, callback: F)
    where
        F: FnOnce(&ThreadUnit) + Send + 'static,
    {
        let mut callbacks = self.inner.on_hierarchy_completed.lock();
        if self.state() == UnitState::HierarchyCompleted {
            drop(callbacks);
            callback(self);
            return;
        }
        callbacks.push(Box::new(callback));
    }

    /// 等待自身动作完成，`None` 表示无限等待
    pub fn wait_completed(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => self.inner.completed.wait_timeout(timeout),
            None => {
                self.inner.completed.wait();
                true
            }
        }
    }

    /// 等待自身及全部后代完成，`None` 表示无限等待
    pub fn wait_hierarchy_completed(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => self.inner.hierarchy_completed.wait_timeout(timeout),
            None => {
                self.inner.hierarchy_completed.wait();
                true
            }
        }
    }

    pub(crate) fn local(&self, index: usize) -> Option<LocalValue> {
        self.inner.locals.lock().get(index).cloned().flatten()
    }

    pub(crate) fn set_local(&self, index: usize, value: Option<LocalValue>) {
        let mut locals = self.inner.locals.lock();
        if locals.len() <= index {
            locals.resize_with(index + 1, || None);
        }
        locals[index] = value;
    }

    /// 动作执行完毕
    pub(crate) fn finish(&self) {
        self.set_state(UnitState::Completed);
        self.inner.completed.set();
        self.release_hierarchy();
    }

    /// 登记一个子单元；层级已完成（计数为 0）时拒绝
    fn retain_child(&self) -> bool {
        self.inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                if pending == 0 {
                    None
                } else {
                    Some(pending + 1)
                }
            })
            .is_ok()
    }

    /// 递减层级计数并沿父链迭代传播，每个单元只有一个线程能将计数降到 0
    fn release_hierarchy(&self) {
        let mut next = Some(self.clone());
        while let Some(unit) = next.take() {
            let previous = unit
                .inner
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                    pending.checked_sub(1)
                });
            let previous = match previous {
                Ok(previous) => previous,
                Err(_) => panic!("线程单元 {} 的层级计数器出现负值", unit.id()),
            };
            if previous > 1 {
                break;
            }

            unit.set_state(UnitState::HierarchyCompleted);
            unit.inner.hierarchy_completed.set();
            let callbacks = std::mem::take(&mut *unit.inner.on_hierarchy_completed.lock());
            for callback in callbacks {
                callback(&unit);
            }

            if unit.inner.counted_in_parent {
                next = unit.inner.parent.clone();
            }
        }
    }
}

impl PartialEq for ThreadUnit {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ThreadUnit {}

impl fmt::Debug for ThreadUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadUnit")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("parent", &self.inner.parent.as_ref().map(|p| p.id()))
            .finish()
    }
}

/// 当前线程绑定守卫
pub(crate) struct CurrentGuard {
    previous: Option<ThreadUnit>,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// 线程单元构建器
///
/// 在入队前设置名称、父单元以及局部存储覆盖值。
#[derive(Default)]
pub struct UnitBuilder {
    name: Option<String>,
    parent: Option<ThreadUnit>,
    locals: Vec<(usize, LocalValue)>,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 指定父单元，默认为调用线程的当前单元
    pub fn parent(mut self, parent: &ThreadUnit) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// 为新单元覆盖一个局部字段的值
    pub fn with_field<T>(mut self, field: &ThreadField<T>, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.locals.push((field.index(), Arc::new(value)));
        self
    }

    fn build(self, pool: &ThreadPool) -> ThreadUnit {
        let parent = self.parent.unwrap_or_else(ThreadUnit::current);
        let unit = ThreadUnit::create(Some(&parent), pool, self.name, UnitState::Queued);
        for (index, value) in self.locals {
            unit.set_local(index, Some(value));
        }
        unit
    }

    /// 创建线程单元并入队，立即返回
    pub fn spawn<F>(self, pool: &ThreadPool, action: F) -> ThreadUnit
    where
        F: FnOnce(&ThreadUnit) + Send + 'static,
    {
        let unit = self.build(pool);
        pool.enqueue(unit.clone(), Box::new(action));
        unit
    }

    /// 创建线程单元并入队，返回可等待的结果句柄
    pub fn spawn_async<T, F>(self, pool: &ThreadPool, action: F) -> UnitTask<T>
    where
        T: Send + 'static,
        F: FnOnce(&ThreadUnit) -> T + Send + 'static,
    {
        let unit = self.build(pool);
        UnitTask::spawn(pool, unit, action)
    }
}
