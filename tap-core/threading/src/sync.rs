//! 同步原语

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

// 进程级中止纪元，单元与等待者可能分属不同线程池
static ABORT_EPOCH: Mutex<u64> = parking_lot::const_mutex(0);
static ABORT_SIGNAL: Condvar = Condvar::new();

/// 唤醒所有可取消等待
pub(crate) fn notify_abort() {
    let mut epoch = ABORT_EPOCH.lock();
    *epoch = epoch.wrapping_add(1);
    ABORT_SIGNAL.notify_all();
}

/// 等待任意中止信号或超时
///
/// `is_aborted` 在锁内检查，避免错过检查与等待之间到达的通知。
pub(crate) fn wait_for_abort<F>(timeout: Duration, is_aborted: F)
where
    F: Fn() -> bool,
{
    let mut epoch = ABORT_EPOCH.lock();
    if is_aborted() {
        return;
    }
    let observed = *epoch;
    let deadline = Instant::now() + timeout;
    while *epoch == observed {
        if ABORT_SIGNAL.wait_until(&mut epoch, deadline).timed_out() {
            return;
        }
    }
}

/// 手动复位事件
///
/// 一旦置位，所有等待者立即返回，直到显式复位。
#[derive(Debug, Default)]
pub struct ManualResetEvent {
    state: Mutex<bool>,
    condvar: Condvar,
}

impl ManualResetEvent {
    pub fn new(initial: bool) -> Self {
        Self {
            state: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut state = self.state.lock();
        *state = true;
        self.condvar.notify_all();
    }

    pub fn reset(&self) {
        *self.state.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock()
    }

    pub fn wait(&self) {
        let mut state = self.state.lock();
        while !*state {
            self.condvar.wait(&mut state);
        }
    }

    /// 等待置位，超时返回 false
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !*state {
            if self.condvar.wait_until(&mut state, deadline).timed_out() {
                return *state;
            }
        }
        true
    }
}

/// 计数信号量
#[derive(Debug, Default)]
pub struct CountingSemaphore {
    permits: Mutex<usize>,
    condvar: Condvar,
}

impl CountingSemaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            condvar: Condvar::new(),
        }
    }

    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.condvar.notify_one();
    }

    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.condvar.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// 获取一个许可，超时返回 false
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.condvar.wait_until(&mut permits, deadline).timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }

    pub fn available(&self) -> usize {
        *self.permits.lock()
    }
}
