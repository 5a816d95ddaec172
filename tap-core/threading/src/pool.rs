//! 弹性线程池
//!
//! 工作线程从共享队列中取出线程单元执行。管理线程定期巡检：
//! 补足空闲线程下限；待处理任务多于空闲线程时扩容，超过软上限后按间隔节流增长。
//! 空闲超时且高于下限的线程自行退出。

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context, Poll};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::unit::{ThreadUnit, UnitBuilder, UnitState};
use crate::{panic_message, Result, ThreadingError};

pub(crate) type Work = Box<dyn FnOnce(&ThreadUnit) + Send>;

static GLOBAL_POOL: OnceLock<ThreadPool> = OnceLock::new();

struct Job {
    unit: ThreadUnit,
    work: Work,
}

/// 工作线程退出原因
enum WorkerExit {
    /// 空闲超时退出，计数已在退出前扣减
    Retired,
    Shutdown,
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    queue: Mutex<VecDeque<Job>>,
    work_available: Condvar,
    workers: AtomicUsize,
    busy: AtomicUsize,
    next_worker_id: AtomicU64,
    shutdown: AtomicBool,
    last_growth: Mutex<Instant>,
    manager_wakeup: Condvar,
    root_token: CancellationToken,
}

impl PoolShared {
    /// 高于空闲下限时扣减线程计数，成功表示当前线程应退出
    fn try_retire(&self) -> bool {
        let floor = self.config.idle_floor;
        self.workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |workers| {
                let busy = self.busy.load(Ordering::Acquire);
                if workers.saturating_sub(busy) > floor {
                    Some(workers - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }
}

/// 线程池句柄
#[derive(Clone)]
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// 创建新的线程池
    pub fn new(config: PoolConfig) -> Self {
        info!(
            "创建线程池: 空闲下限 {}, 软上限 {}",
            config.idle_floor, config.soft_cap
        );

        let floor = config.idle_floor;
        let pool = Self {
            shared: Arc::new(PoolShared {
                config,
                queue: Mutex::new(VecDeque::new()),
                work_available: Condvar::new(),
                workers: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                next_worker_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
                last_growth: Mutex::new(Instant::now()),
                manager_wakeup: Condvar::new(),
                root_token: CancellationToken::new(),
            }),
        };

        for _ in 0..floor {
            pool.spawn_worker();
        }
        pool.spawn_manager();
        pool
    }

    /// 进程级全局线程池
    pub fn global() -> &'static ThreadPool {
        GLOBAL_POOL.get_or_init(|| ThreadPool::new(PoolConfig::default()))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// 创建一个不执行动作的根单元，用作外部线程或子树的锚点
    pub fn root_unit(&self, name: Option<&str>) -> ThreadUnit {
        ThreadUnit::create(None, self, name.map(str::to_string), UnitState::Running)
    }

    /// 在调用线程当前单元之下启动新单元
    pub fn start<F>(&self, name: Option<&str>, action: F) -> ThreadUnit
    where
        F: FnOnce(&ThreadUnit) + Send + 'static,
    {
        let mut builder = UnitBuilder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder.spawn(self, action)
    }

    /// 在调用线程当前单元之下启动新单元并返回结果句柄
    pub fn spawn_async<T, F>(&self, name: Option<&str>, action: F) -> UnitTask<T>
    where
        T: Send + 'static,
        F: FnOnce(&ThreadUnit) -> T + Send + 'static,
    {
        let mut builder = UnitBuilder::new();
        if let Some(name) = name {
            builder = builder.name(name);
        }
        builder.spawn_async(self, action)
    }

    /// 工作线程总数
    pub fn worker_count(&self) -> usize {
        self.shared.workers.load(Ordering::Acquire)
    }

    /// 正在执行任务的工作线程数
    pub fn busy_count(&self) -> usize {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// 空闲工作线程数
    pub fn idle_count(&self) -> usize {
        self.worker_count().saturating_sub(self.busy_count())
    }

    /// 等待执行的任务数
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// 关闭线程池
    ///
    /// 工作线程执行完已入队的任务后退出，管理线程停止巡检。
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("关闭线程池");
        {
            let _queue = self.shared.queue.lock();
            self.shared.work_available.notify_all();
        }
        {
            let _guard = self.shared.last_growth.lock();
            self.shared.manager_wakeup.notify_all();
        }
    }

    pub(crate) fn enqueue(&self, unit: ThreadUnit, work: Work) {
        let pending = {
            let mut queue = self.shared.queue.lock();
            queue.push_back(Job { unit, work });
            queue.len()
        };
        self.shared.work_available.notify_one();

        if self.is_shutdown() {
            warn!("线程池已关闭，为新任务创建临时工作线程");
            self.spawn_worker();
            return;
        }

        if pending > self.idle_count() {
            if self.worker_count() < self.shared.config.soft_cap {
                self.spawn_worker();
            } else {
                let _guard = self.shared.last_growth.lock();
                self.shared.manager_wakeup.notify_one();
            }
        }
    }

    pub(crate) fn root_token(&self) -> &CancellationToken {
        &self.shared.root_token
    }

    fn spawn_worker(&self) -> bool {
        let id = self.shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.shared.config.thread_name_prefix, id);
        self.shared.workers.fetch_add(1, Ordering::AcqRel);

        let shared = Arc::clone(&self.shared);
        let result = thread::Builder::new().name(name.clone()).spawn(move || {
            if let WorkerExit::Shutdown = worker_loop(&shared) {
                shared.workers.fetch_sub(1, Ordering::AcqRel);
            }
        });

        match result {
            Ok(_) => {
                debug!("创建工作线程: {}", name);
                true
            }
            Err(e) => {
                self.shared.workers.fetch_sub(1, Ordering::AcqRel);
                error!("创建工作线程失败: {}", e);
                false
            }
        }
    }

    fn spawn_manager(&self) {
        let weak = Arc::downgrade(&self.shared);
        let name = format!("{}-manager", self.shared.config.thread_name_prefix);
        if let Err(e) = thread::Builder::new()
            .name(name)
            .spawn(move || manager_loop(weak))
        {
            error!("创建线程池管理线程失败: {}", e);
        }
    }

    /// 一次巡检
    fn rebalance(&self) {
        let config = &self.shared.config;

        let idle = self.idle_count();
        if idle < config.idle_floor {
            for _ in idle..config.idle_floor {
                self.spawn_worker();
            }
        }

        let pending = self.pending_count();
        let idle = self.idle_count();
        if pending <= idle {
            return;
        }

        let workers = self.worker_count();
        if workers < config.soft_cap {
            let wanted = (pending - idle).min(config.soft_cap - workers);
            for _ in 0..wanted {
                self.spawn_worker();
            }
            return;
        }

        let mut last_growth = self.shared.last_growth.lock();
        if last_growth.elapsed() >= config.growth_interval() {
            *last_growth = Instant::now();
            drop(last_growth);
            warn!(
                "线程池已达软上限 {}，继续增长 (当前 {} 个线程, {} 个待处理任务)",
                config.soft_cap, workers, pending
            );
            self.spawn_worker();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.worker_count())
            .field("busy", &self.busy_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn manager_loop(weak: Weak<PoolShared>) {
    loop {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        let interval = shared.config.manager_interval();
        let pool = ThreadPool { shared };
        pool.rebalance();

        let mut guard = pool.shared.last_growth.lock();
        if pool.shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        pool.shared.manager_wakeup.wait_for(&mut guard, interval);
    }
    debug!("线程池管理线程退出");
}

fn worker_loop(shared: &PoolShared) -> WorkerExit {
    let idle_timeout = shared.config.idle_timeout();
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.pop_front() {
                    shared.busy.fetch_add(1, Ordering::AcqRel);
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    break None;
                }
                let timed_out = shared
                    .work_available
                    .wait_for(&mut queue, idle_timeout)
                    .timed_out();
                if timed_out && queue.is_empty() && shared.try_retire() {
                    debug!("工作线程空闲超时退出");
                    return WorkerExit::Retired;
                }
            }
        };

        let Some(job) = job else {
            return WorkerExit::Shutdown;
        };
        run_job(job);
        shared.busy.fetch_sub(1, Ordering::AcqRel);
    }
}

fn run_job(job: Job) {
    let Job { unit, work } = job;
    unit.set_state(UnitState::Running);
    {
        let _current = ThreadUnit::enter(unit.clone());
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| work(&unit))) {
            error!(
                "线程单元 {} 执行异常: {}",
                unit.display_name(),
                panic_message(payload.as_ref())
            );
        }
    }
    unit.finish();
}

/// 线程单元结果句柄
///
/// 既可在同步代码中 [`join`](UnitTask::join)，也可在异步代码中直接 `.await`。
pub struct UnitTask<T> {
    unit: ThreadUnit,
    receiver: oneshot::Receiver<std::result::Result<T, String>>,
}

impl<T: Send + 'static> UnitTask<T> {
    pub(crate) fn spawn<F>(pool: &ThreadPool, unit: ThreadUnit, action: F) -> Self
    where
        F: FnOnce(&ThreadUnit) -> T + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let work: Work = Box::new(move |unit: &ThreadUnit| {
            let result = catch_unwind(AssertUnwindSafe(|| action(unit)))
                .map_err(|payload| panic_message(payload.as_ref()));
            if let Err(message) = &result {
                error!("线程单元 {} 执行异常: {}", unit.display_name(), message);
            }
            // 接收端可能已被丢弃
            let _ = sender.send(result);
        });
        pool.enqueue(unit.clone(), work);
        Self { unit, receiver }
    }
}

impl<T> UnitTask<T> {
    pub fn unit(&self) -> &ThreadUnit {
        &self.unit
    }

    /// 阻塞等待结果，不可在异步运行时内调用
    pub fn join(self) -> Result<T> {
        match self.receiver.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ThreadingError::Panicked(message)),
            Err(_) => Err(ThreadingError::ResultDropped),
        }
    }
}

impl<T> Future for UnitTask<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll(cx).map(|result| match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(ThreadingError::Panicked(message)),
            Err(_) => Err(ThreadingError::ResultDropped),
        })
    }
}
