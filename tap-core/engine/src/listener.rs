//! 结果监听器
//!
//! 每个监听器绑定一个独立的工作队列，所有回调都只在该队列上串行执行。
//! 任一回调返回错误或 panic 后，监听器被关闭并移出活动集合，后续事件不再投递。

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tap_threading::{panic_message, ThreadPool, WorkQueue, WorkQueueOptions};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::log::LogView;
use crate::plan_run::PlanRunInfo;
use crate::results::ResultTable;
use crate::step_run::StepRunInfo;

/// 结果监听器
pub trait ResultListener: Send + Sync {
    /// 用于诊断的名称
    fn name(&self) -> &str;

    fn on_test_plan_run_start(&self, _run: &PlanRunInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_plan_run_completed(&self, _run: &PlanRunInfo, _log: &LogView) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_step_run_start(&self, _step_run: &StepRunInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_test_step_run_completed(&self, _step_run: &StepRunInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_result_published(&self, _step_run_id: Uuid, _table: &ResultTable) -> anyhow::Result<()> {
        Ok(())
    }

    /// 关闭监听器
    fn close(&self) {}

    /// 按具体类型筛选监听器
    fn as_any(&self) -> &dyn Any;
}

/// 监听器与其工作队列
pub(crate) struct ListenerSlot {
    listener: Arc<dyn ResultListener>,
    queue: WorkQueue,
    faulted: AtomicBool,
}

impl ListenerSlot {
    pub(crate) fn new(
        listener: Arc<dyn ResultListener>,
        options: WorkQueueOptions,
        pool: &ThreadPool,
    ) -> Arc<Self> {
        let queue = WorkQueue::new(listener.name(), options, pool);
        Arc::new(Self {
            listener,
            queue,
            faulted: AtomicBool::new(false),
        })
    }

    pub(crate) fn name(&self) -> &str {
        self.listener.name()
    }

    pub(crate) fn listener(&self) -> &Arc<dyn ResultListener> {
        &self.listener
    }

    pub(crate) fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.faulted.load(Ordering::Acquire)
    }

    /// 在监听器队列上执行回调，返回是否已入队
    pub(crate) fn dispatch<F>(self: &Arc<Self>, event: &'static str, callback: F) -> bool
    where
        F: FnOnce(&dyn ResultListener) -> anyhow::Result<()> + Send + 'static,
    {
        if !self.is_active() {
            return false;
        }

        let slot = Arc::clone(self);
        let result = self.queue.enqueue_work(move || {
            if !slot.is_active() {
                return;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(slot.listener.as_ref())))
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("{}", panic_message(payload.as_ref())))
                });
            if let Err(e) = outcome {
                slot.fault(event, &e);
            }
        });

        match result {
            Ok(()) => true,
            Err(e) => {
                debug!("结果监听器 {} 的队列已关闭，丢弃 {}: {}", self.name(), event, e);
                false
            }
        }
    }

    /// 关闭故障监听器并移出活动集合，只执行一次
    fn fault(&self, event: &str, error: &anyhow::Error) {
        if self.faulted.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            "结果监听器 {} 在 {} 中出错，已关闭并移出活动集合: {:#}",
            self.name(),
            event,
            error
        );
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.listener.close())) {
            warn!(
                "关闭结果监听器 {} 时出错: {}",
                self.name(),
                panic_message(payload.as_ref())
            );
        }
    }
}

/// 通过 tracing 记录所有生命周期事件的监听器
#[derive(Debug, Clone)]
pub struct LogListener {
    name: String,
}

impl LogListener {
    pub fn new() -> Self {
        Self {
            name: "log".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Default for LogListener {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultListener for LogListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_test_plan_run_start(&self, run: &PlanRunInfo) -> anyhow::Result<()> {
        info!("[{}] 测试计划开始: {} ({})", self.name, run.plan_name, run.id);
        Ok(())
    }

    fn on_test_plan_run_completed(&self, run: &PlanRunInfo, log: &LogView) -> anyhow::Result<()> {
        info!(
            "[{}] 测试计划完成: {} 判定 {} 耗时 {:?}ms ({} 条日志)",
            self.name,
            run.plan_name,
            run.verdict,
            run.duration_ms,
            log.len()
        );
        Ok(())
    }

    fn on_test_step_run_start(&self, step_run: &StepRunInfo) -> anyhow::Result<()> {
        info!("[{}] 步骤开始: {}", self.name, step_run.step_name);
        Ok(())
    }

    fn on_test_step_run_completed(&self, step_run: &StepRunInfo) -> anyhow::Result<()> {
        info!(
            "[{}] 步骤完成: {} 判定 {} 耗时 {:?}ms",
            self.name, step_run.step_name, step_run.verdict, step_run.duration_ms
        );
        Ok(())
    }

    fn on_result_published(&self, step_run_id: Uuid, table: &ResultTable) -> anyhow::Result<()> {
        debug!(
            "[{}] 结果发布: {} ({} 行, 步骤运行 {})",
            self.name,
            table.name,
            table.row_count(),
            step_run_id
        );
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
