//! 工作队列
//!
//! 每个队列绑定一个接收者，队列中的闭包严格按提交顺序执行，任一时刻至多一个在执行。
//! 消费者是线程池上的一个线程单元，队列为空时退出（长期运行的队列会先驻留 `linger`），
//! 下次入队时重新调度。

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::pool::ThreadPool;
use crate::unit::{ThreadUnit, UnitId};
use crate::{panic_message, Result, ThreadingError};

/// 平滑服务时间的新样本权重
const EWMA_WEIGHT: f64 = 0.2;

type QueueItem = Box<dyn FnOnce() + Send>;

/// 工作队列选项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkQueueOptions {
    /// 清空后消费者继续驻留 `linger` 等待新任务
    #[serde(default)]
    pub long_running: bool,

    /// 统计每项任务的平滑执行时间
    #[serde(default = "default_time_averaging")]
    pub time_averaging: bool,

    /// 长期运行队列的驻留时间
    #[serde(default = "default_linger", with = "duration_millis")]
    pub linger: Duration,
}

impl Default for WorkQueueOptions {
    fn default() -> Self {
        Self {
            long_running: false,
            time_averaging: default_time_averaging(),
            linger: default_linger(),
        }
    }
}

impl WorkQueueOptions {
    pub fn long_running(mut self, linger: Duration) -> Self {
        self.long_running = true;
        self.linger = linger;
        self
    }

    pub fn with_time_averaging(mut self, enabled: bool) -> Self {
        self.time_averaging = enabled;
        self
    }
}

fn default_time_averaging() -> bool {
    true
}

fn default_linger() -> Duration {
    Duration::from_millis(100)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<QueueItem>,
    executing: bool,
    consumer_active: bool,
    consumer: Option<UnitId>,
    disposed: bool,
}

struct QueueShared {
    name: String,
    options: WorkQueueOptions,
    state: Mutex<QueueState>,
    changed: Condvar,
    /// 排队 + 执行中的任务数
    depth: AtomicUsize,
    average_nanos: AtomicU64,
    samples: AtomicU64,
}

impl QueueShared {
    fn depth_of(state: &QueueState) -> usize {
        state.items.len() + usize::from(state.executing)
    }

    fn record_duration(&self, elapsed: Duration) {
        if !self.options.time_averaging {
            return;
        }
        let sample = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        // 同一队列只有一个消费者在写
        let average = if self.samples.fetch_add(1, Ordering::AcqRel) == 0 {
            sample
        } else {
            let previous = self.average_nanos.load(Ordering::Acquire) as f64;
            (previous * (1.0 - EWMA_WEIGHT) + sample as f64 * EWMA_WEIGHT) as u64
        };
        self.average_nanos.store(average, Ordering::Release);
    }
}

/// 工作队列
pub struct WorkQueue {
    shared: Arc<QueueShared>,
    host: ThreadUnit,
}

impl WorkQueue {
    /// 创建工作队列，消费者运行在线程池上一个独立的根单元之下
    pub fn new(name: impl Into<String>, options: WorkQueueOptions, pool: &ThreadPool) -> Self {
        let name = name.into();
        let host = pool.root_unit(Some(&format!("队列 {}", name)));
        debug!("创建工作队列: {}", name);
        Self {
            shared: Arc::new(QueueShared {
                name,
                options,
                state: Mutex::new(QueueState::default()),
                changed: Condvar::new(),
                depth: AtomicUsize::new(0),
                average_nanos: AtomicU64::new(0),
                samples: AtomicU64::new(0),
            }),
            host,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn options(&self) -> &WorkQueueOptions {
        &self.shared.options
    }

    /// 追加任务，不阻塞调用方
    pub fn enqueue_work<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let start_consumer = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return Err(ThreadingError::QueueDisposed(self.shared.name.clone()));
            }
            state.items.push_back(Box::new(work));
            self.shared
                .depth
                .store(QueueShared::depth_of(&state), Ordering::Release);
            self.shared.changed.notify_all();

            let start = !state.consumer_active;
            state.consumer_active = true;
            start
        };

        if start_consumer {
            let shared = Arc::clone(&self.shared);
            self.host
                .start(Some(&self.shared.name), move |unit| consume(&shared, unit));
        }
        Ok(())
    }

    /// 排队中和执行中的任务数
    pub fn queue_size(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    /// 平滑后的单项执行时间
    pub fn average_time_spent(&self) -> Duration {
        Duration::from_nanos(self.shared.average_nanos.load(Ordering::Acquire))
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    /// 阻塞直到队列为空且没有任务在执行
    pub fn wait(&self) {
        self.wait_until_size_at_most(0, None);
    }

    /// 带超时的 [`wait`](WorkQueue::wait)，队列清空返回 true
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.wait_until_size_at_most(0, Some(timeout))
    }

    /// 阻塞直到队列深度不超过 `size`，超时返回 false
    pub fn wait_until_size_at_most(&self, size: usize, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.state.lock();

        if let (Some(current), Some(consumer)) = (ThreadUnit::try_current(), state.consumer) {
            if current.id() == consumer && state.executing {
                warn!(
                    "在工作队列 {} 的消费者内部等待队列，忽略以避免死锁",
                    self.shared.name
                );
                return QueueShared::depth_of(&state) <= size;
            }
        }

        while QueueShared::depth_of(&state) > size {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return QueueShared::depth_of(&state) <= size;
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
        true
    }

    /// 不再接受新任务，已入队的任务继续执行完毕
    pub fn dispose(&self) {
        let mut state = self.shared.state.lock();
        if state.disposed {
            return;
        }
        state.disposed = true;
        self.shared.changed.notify_all();
        debug!(
            "释放工作队列 {} (剩余 {} 项)",
            self.shared.name,
            QueueShared::depth_of(&state)
        );
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .field("queue_size", &self.queue_size())
            .field("average_time_spent", &self.average_time_spent())
            .finish()
    }
}

/// 消费者主循环
fn consume(shared: &QueueShared, unit: &ThreadUnit) {
    shared.state.lock().consumer = Some(unit.id());

    loop {
        let item = {
            let mut state = shared.state.lock();
            loop {
                if let Some(item) = state.items.pop_front() {
                    state.executing = true;
                    break Some(item);
                }
                if shared.options.long_running && !state.disposed {
                    let timed_out = shared
                        .changed
                        .wait_for(&mut state, shared.options.linger)
                        .timed_out();
                    if !timed_out || !state.items.is_empty() {
                        continue;
                    }
                }
                state.consumer_active = false;
                state.consumer = None;
                shared.changed.notify_all();
                break None;
            }
        };

        let Some(item) = item else {
            return;
        };

        let started = Instant::now();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(item)) {
            warn!(
                "工作队列 {} 中的任务执行异常: {}",
                shared.name,
                panic_message(payload.as_ref())
            );
        }
        shared.record_duration(started.elapsed());

        let mut state = shared.state.lock();
        state.executing = false;
        shared
            .depth
            .store(QueueShared::depth_of(&state), Ordering::Release);
        shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PoolConfig;
    use std::sync::atomic::AtomicBool;

    fn test_pool() -> ThreadPool {
        ThreadPool::new(PoolConfig::default().with_idle_floor(2))
    }

    #[test]
    fn test_enqueue_after_dispose_fails() {
        let pool = test_pool();
        let queue = WorkQueue::new("disposed", WorkQueueOptions::default(), &pool);
        queue.dispose();
        queue.dispose();
        assert!(queue.is_disposed());
        assert_eq!(
            queue.enqueue_work(|| {}),
            Err(ThreadingError::QueueDisposed("disposed".to_string()))
        );
        pool.shutdown();
    }

    #[test]
    fn test_wait_on_empty_queue_returns() {
        let pool = test_pool();
        let queue = WorkQueue::new("empty", WorkQueueOptions::default(), &pool);
        assert!(queue.wait_timeout(Duration::from_millis(10)));
        assert_eq!(queue.queue_size(), 0);
        pool.shutdown();
    }

    #[test]
    fn test_panicking_item_does_not_stop_queue() {
        let pool = test_pool();
        let queue = WorkQueue::new("isolation", WorkQueueOptions::default(), &pool);
        let ran = Arc::new(AtomicBool::new(false));

        queue.enqueue_work(|| panic!("listener failed")).unwrap();
        let flag = Arc::clone(&ran);
        queue
            .enqueue_work(move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        assert!(queue.wait_timeout(Duration::from_secs(5)));
        assert!(ran.load(Ordering::SeqCst));
        pool.shutdown();
    }

    #[test]
    fn test_average_time_tracks_service_time() {
        let pool = test_pool();
        let queue = WorkQueue::new("timing", WorkQueueOptions::default(), &pool);
        for _ in 0..3 {
            queue
                .enqueue_work(|| std::thread::sleep(Duration::from_millis(20)))
                .unwrap();
        }
        queue.wait();
        assert!(queue.average_time_spent() >= Duration::from_millis(15));
        pool.shutdown();
    }

    #[test]
    fn test_time_averaging_disabled() {
        let pool = test_pool();
        let options = WorkQueueOptions::default().with_time_averaging(false);
        let queue = WorkQueue::new("untimed", options, &pool);
        queue
            .enqueue_work(|| std::thread::sleep(Duration::from_millis(5)))
            .unwrap();
        queue.wait();
        assert_eq!(queue.average_time_spent(), Duration::ZERO);
        pool.shutdown();
    }

    #[test]
    fn test_wait_inside_consumer_does_not_deadlock() {
        let pool = test_pool();
        let queue = Arc::new(WorkQueue::new("reentrant", WorkQueueOptions::default(), &pool));
        let done = Arc::new(AtomicBool::new(false));

        let inner = Arc::clone(&queue);
        let flag = Arc::clone(&done);
        queue
            .enqueue_work(move || {
                inner.wait();
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        assert!(queue.wait_timeout(Duration::from_secs(5)));
        assert!(done.load(Ordering::SeqCst));
        pool.shutdown();
    }

    #[test]
    fn test_long_running_queue_lingers() {
        let pool = test_pool();
        let options = WorkQueueOptions::default().long_running(Duration::from_millis(200));
        let queue = WorkQueue::new("lingering", options, &pool);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            queue
                .enqueue_work(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert!(queue.wait_timeout(Duration::from_secs(5)));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        queue.dispose();
        pool.shutdown();
    }
}
