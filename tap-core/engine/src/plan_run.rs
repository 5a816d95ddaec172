//! 测试计划运行
//!
//! 计划运行持有判定、参数、步骤运行记录，以及每个结果监听器各自的工作队列。
//! 生命周期事件投递到所有活动监听器的队列而不是直接调用，
//! 慢监听器通过节流反压生产者，不会拖慢其它监听器。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tap_threading::{CountingSemaphore, ThreadPool, ThreadUnit};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::listener::{ListenerSlot, ResultListener};
use crate::log::{LogView, RunLog};
use crate::plan::TestPlan;
use crate::resource::ResourceManager;
use crate::results::ResultTable;
use crate::serializer::PlanSerializer;
use crate::step_run::{StepRun, StepRunInfo};
use crate::verdict::{Verdict, VerdictCell};

/// 计划运行快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRunInfo {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub start_time: DateTime<Utc>,
    pub verdict: Verdict,
    /// 耗时（毫秒），运行结束前为 None
    pub duration_ms: Option<u64>,
    pub parameters: BTreeMap<String, String>,
}

/// 步骤运行的判定上报目标
#[derive(Clone)]
pub(crate) enum ParentTarget {
    Plan(Arc<PlanRun>),
    Step(Arc<StepRun>),
}

impl ParentTarget {
    pub(crate) fn id(&self) -> Uuid {
        match self {
            Self::Plan(run) => run.id(),
            Self::Step(step_run) => step_run.id(),
        }
    }

    pub(crate) fn upgrade_verdict(&self, verdict: Verdict) {
        match self {
            Self::Plan(run) => {
                run.upgrade_verdict(verdict);
            }
            Self::Step(step_run) => {
                step_run.upgrade_verdict(verdict);
            }
        }
    }
}

/// 测试计划运行
pub struct PlanRun {
    id: Uuid,
    plan_id: Uuid,
    plan_name: String,
    start_time: DateTime<Utc>,
    started_at: Instant,
    verdict: VerdictCell,
    config: EngineConfig,
    listeners: Vec<Arc<ListenerSlot>>,
    resource_manager: Arc<dyn ResourceManager>,
    parameters: Mutex<BTreeMap<String, String>>,
    step_runs: Mutex<Vec<Arc<StepRun>>>,
    serialized_plan: Option<Vec<u8>>,
    duration: Mutex<Option<Duration>>,
    log: RunLog,
}

impl PlanRun {
    pub(crate) fn new(
        plan: &TestPlan,
        listeners: &[Arc<dyn ResultListener>],
        resource_manager: Arc<dyn ResourceManager>,
        serializer: Option<&dyn PlanSerializer>,
        config: EngineConfig,
        pool: &ThreadPool,
    ) -> Self {
        let log = RunLog::new();

        let serialized_plan = serializer.and_then(|serializer| {
            let mut buffer = Vec::new();
            match serializer.serialize(plan, &mut buffer) {
                Ok(()) => Some(buffer),
                Err(e) => {
                    log.warn(format!("测试计划快照序列化失败: {}", e));
                    None
                }
            }
        });

        let listeners = listeners
            .iter()
            .map(|listener| {
                ListenerSlot::new(Arc::clone(listener), config.work_queue.clone(), pool)
            })
            .collect();

        let mut parameters = BTreeMap::new();
        parameters.insert("plan_name".to_string(), plan.name.clone());

        Self {
            id: Uuid::new_v4(),
            plan_id: plan.id,
            plan_name: plan.name.clone(),
            start_time: Utc::now(),
            started_at: Instant::now(),
            verdict: VerdictCell::new(),
            config,
            listeners,
            resource_manager,
            parameters: Mutex::new(parameters),
            step_runs: Mutex::new(Vec::new()),
            serialized_plan,
            duration: Mutex::new(None),
            log,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resource_manager(&self) -> &Arc<dyn ResourceManager> {
        &self.resource_manager
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict.get()
    }

    /// 升级计划判定，只升不降
    pub fn upgrade_verdict(&self, verdict: Verdict) -> bool {
        self.verdict.upgrade(verdict)
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// 测试计划快照
    pub fn serialized_plan(&self) -> Option<&[u8]> {
        self.serialized_plan.as_deref()
    }

    pub fn set_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.lock().insert(key.into(), value.into());
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        self.parameters.lock().get(key).cloned()
    }

    pub fn parameters(&self) -> BTreeMap<String, String> {
        self.parameters.lock().clone()
    }

    pub(crate) fn register_step_run(&self, step_run: Arc<StepRun>) {
        self.step_runs.lock().push(step_run);
    }

    /// 所有步骤运行快照，按创建顺序
    pub fn step_runs(&self) -> Vec<StepRunInfo> {
        self.step_runs.lock().iter().map(|r| r.info()).collect()
    }

    /// 仍处于活动集合中的监听器名称
    pub fn active_listeners(&self) -> Vec<String> {
        self.listeners
            .iter()
            .filter(|slot| slot.is_active())
            .map(|slot| slot.name().to_string())
            .collect()
    }

    pub fn duration(&self) -> Option<Duration> {
        *self.duration.lock()
    }

    pub fn info(&self) -> PlanRunInfo {
        PlanRunInfo {
            id: self.id,
            plan_id: self.plan_id,
            plan_name: self.plan_name.clone(),
            start_time: self.start_time,
            verdict: self.verdict(),
            duration_ms: self.duration().map(|d| d.as_millis() as u64),
            parameters: self.parameters(),
        }
    }

    pub(crate) fn on_plan_started(&self) {
        let info = self.info();
        for slot in &self.listeners {
            let info = info.clone();
            slot.dispatch("OnTestPlanRunStart", move |listener| {
                listener.on_test_plan_run_start(&info)
            });
        }
    }

    pub(crate) fn on_step_started(&self, step_run: &StepRun) {
        let info = step_run.info();
        for slot in &self.listeners {
            let info = info.clone();
            slot.dispatch("OnTestStepRunStart", move |listener| {
                listener.on_test_step_run_start(&info)
            });
        }
    }

    pub(crate) fn on_step_completed(&self, step_run: &StepRun) {
        let info = step_run.info();
        for slot in &self.listeners {
            let info = info.clone();
            slot.dispatch("OnTestStepRunCompleted", move |listener| {
                listener.on_test_step_run_completed(&info)
            });
        }
    }

    /// 发布结果表，发布前先执行节流
    ///
    /// 节流等待期间调用方单元被取消时返回 `OperationCanceled`，结果不再投递。
    pub fn publish_result(
        &self,
        step_run_id: Uuid,
        table: ResultTable,
    ) -> tap_threading::Result<()> {
        self.throttle_result_propagation()?;
        let table = Arc::new(table);
        for slot in &self.listeners {
            let table = Arc::clone(&table);
            slot.dispatch("OnResultPublished", move |listener| {
                listener.on_result_published(step_run_id, &table)
            });
        }
        Ok(())
    }

    /// 将回调分发到所有类型为 `T` 的活动监听器的队列
    ///
    /// `blocking` 为 true 时等待全部分发出去的回调执行完毕。
    /// 回调返回错误按监听器故障处理。
    pub fn schedule_in_result_processing_thread<T, F>(&self, callback: F, blocking: bool)
    where
        T: ResultListener + 'static,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let semaphore = Arc::new(CountingSemaphore::new(0));
        let mut dispatched = 0usize;

        for slot in &self.listeners {
            if slot.listener().as_any().downcast_ref::<T>().is_none() {
                continue;
            }

            let callback = Arc::clone(&callback);
            let release = ReleaseOnDrop(Arc::clone(&semaphore));
            let queued = slot.dispatch("ScheduleInResultProcessingThread", move |listener| {
                let _release = release;
                match listener.as_any().downcast_ref::<T>() {
                    Some(listener) => callback(listener),
                    None => Ok(()),
                }
            });
            if queued {
                dispatched += 1;
            }
        }

        if blocking {
            for _ in 0..dispatched {
                semaphore.acquire();
            }
        }
    }

    /// 结果传播节流
    ///
    /// 任一队列的预计清空时间 (深度 × 平均耗时) 超过上限时，阻塞调用线程直到该队列深度不超过 1。
    /// 等待期间调用线程所在单元被取消则立即返回 `OperationCanceled`，队列照常继续清空。
    pub fn throttle_result_propagation(&self) -> tap_threading::Result<()> {
        let limit = self.config.result_latency_limit();
        let poll = self.config.throttle_poll();
        let warning = self.config.throttle_warning();
        let caller = ThreadUnit::try_current();

        for slot in &self.listeners {
            if !slot.is_active() {
                continue;
            }
            let queue = slot.queue();
            let depth = u32::try_from(queue.queue_size()).unwrap_or(u32::MAX);
            let estimate = queue
                .average_time_spent()
                .checked_mul(depth)
                .unwrap_or(Duration::MAX);
            if estimate <= limit {
                continue;
            }

            let started = Instant::now();
            let mut outcome = Ok(());
            while slot.is_active() && !queue.wait_until_size_at_most(1, Some(poll)) {
                if let Some(unit) = caller.as_ref() {
                    if let Err(canceled) = unit.throw_if_aborted() {
                        outcome = Err(canceled);
                        break;
                    }
                }
            }

            let waited = started.elapsed();
            if waited > warning {
                self.log.warn(format!(
                    "结果监听器 {} 处理缓慢，结果传播已等待 {:?} (预计积压 {:?})",
                    slot.name(),
                    waited,
                    estimate
                ));
            }
            outcome?;
        }
        Ok(())
    }

    /// 等待所有监听器队列清空
    pub fn wait_for_results(&self) {
        for slot in &self.listeners {
            slot.queue().wait();
        }
    }

    /// 计划收尾
    ///
    /// 通知所有仍在活动集合中的监听器，释放并等待全部队列清空，
    /// 等待期间按间隔记录警告。计划已被取消时最终判定升级为 Aborted。
    pub(crate) fn add_test_plan_completed(&self, unit: &ThreadUnit) {
        if unit.is_aborted() {
            self.upgrade_verdict(Verdict::Aborted);
        }
        *self.duration.lock() = Some(self.started_at.elapsed());

        self.log.info(format!(
            "测试计划 {} 完成，判定 {}",
            self.plan_name,
            self.verdict()
        ));

        let info = self.info();
        let view = self.log.view();
        for slot in &self.listeners {
            let info = info.clone();
            let view = view.clone();
            slot.dispatch("OnTestPlanRunCompleted", move |listener| {
                listener.on_test_plan_run_completed(&info, &view)
            });
        }

        for slot in &self.listeners {
            slot.queue().dispose();
        }

        let warning = self.config.teardown_warning();
        for slot in &self.listeners {
            let started = Instant::now();
            while !slot.queue().wait_timeout(warning) {
                self.log.warn(format!(
                    "等待结果监听器 {} 处理完成，已等待 {:?} (剩余 {} 项)",
                    slot.name(),
                    started.elapsed(),
                    slot.queue().queue_size()
                ));
            }
        }

        if unit.is_aborted() {
            self.upgrade_verdict(Verdict::Aborted);
        }
    }
}

impl std::fmt::Debug for PlanRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanRun")
            .field("id", &self.id)
            .field("plan_name", &self.plan_name)
            .field("verdict", &self.verdict())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

struct ReleaseOnDrop(Arc<CountingSemaphore>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// 计划运行报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRunReport {
    pub run: PlanRunInfo,
    pub steps: Vec<StepRunInfo>,
    pub log: LogView,
}

impl PlanRunReport {
    pub(crate) fn from_run(run: &PlanRun) -> Self {
        Self {
            run: run.info(),
            steps: run.step_runs(),
            log: run.log.view(),
        }
    }

    pub fn verdict(&self) -> Verdict {
        self.run.verdict
    }

    /// 判定低于 Fail 视为通过
    pub fn passed(&self) -> bool {
        !self.run.verdict.is_failure()
    }

    /// 指定判定的步骤运行数
    pub fn count(&self, verdict: Verdict) -> usize {
        self.steps.iter().filter(|s| s.verdict == verdict).count()
    }

    /// 导出为 JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// 导出为 YAML
    pub fn to_yaml(&self) -> serde_yaml::Result<String> {
        serde_yaml::to_string(self)
    }
}
