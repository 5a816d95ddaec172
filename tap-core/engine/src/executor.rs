//! 测试计划执行器
//!
//! 计划在一个独立的线程单元上执行：打开资源 → 依次执行步骤树 → 等待延后处理 →
//! 关闭资源 → 收尾。步骤的中断、重试、取消都在这里按中断条件处理。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tap_threading::{panic_message, ThreadPool, ThreadUnit, UnitBuilder, UnitState, UnitTask};
use tracing::info;
use uuid::Uuid;

use crate::break_condition::{evaluate, BreakCondition, BreakDecision};
use crate::config::EngineConfig;
use crate::context::{DeferredContext, DeferredWork, StepContext};
use crate::error::StepFault;
use crate::listener::ResultListener;
use crate::plan::{StepNode, TestPlan};
use crate::plan_run::{ParentTarget, PlanRun, PlanRunReport};
use crate::resource::{ParallelResourceManager, Resource, ResourceManager};
use crate::serializer::{JsonPlanSerializer, PlanSerializer};
use crate::step_run::StepRun;
use crate::verdict::Verdict;
use crate::{EngineError, Result};

/// 测试计划执行器
///
/// 释放时关闭自己创建的线程池，外部传入的线程池保持不变。
pub struct TestPlanExecutor {
    config: EngineConfig,
    pool: ThreadPool,
    owns_pool: bool,
    listeners: Vec<Arc<dyn ResultListener>>,
    serializer: Option<Arc<dyn PlanSerializer>>,
    resource_manager: Option<Arc<dyn ResourceManager>>,
}

impl TestPlanExecutor {
    /// 创建新的执行器，按配置创建专用线程池
    pub fn new(config: EngineConfig) -> Self {
        let pool = ThreadPool::new(config.pool.clone());
        Self {
            config,
            pool,
            owns_pool: true,
            listeners: Vec::new(),
            serializer: Some(Arc::new(JsonPlanSerializer::new())),
            resource_manager: None,
        }
    }

    /// 使用外部线程池，替换掉的专用线程池被关闭
    pub fn with_pool(mut self, pool: ThreadPool) -> Self {
        if self.owns_pool {
            self.pool.shutdown();
        }
        self.pool = pool;
        self.owns_pool = false;
        self
    }

    /// 添加结果监听器
    pub fn with_listener(mut self, listener: Arc<dyn ResultListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// 设置测试计划快照序列化器
    pub fn with_serializer(mut self, serializer: Arc<dyn PlanSerializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// 不生成测试计划快照
    pub fn without_serializer(mut self) -> Self {
        self.serializer = None;
        self
    }

    /// 设置资源管理器，默认每次运行新建一个并行资源管理器
    pub fn with_resource_manager(mut self, manager: Arc<dyn ResourceManager>) -> Self {
        self.resource_manager = Some(manager);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &ThreadPool {
        &self.pool
    }

    /// 启动测试计划，立即返回运行句柄
    pub fn start(&self, plan: Arc<TestPlan>) -> PlanRunHandle {
        let manager = self.resource_manager.clone().unwrap_or_else(|| {
            Arc::new(ParallelResourceManager::new(self.config.resource_poll()))
                as Arc<dyn ResourceManager>
        });
        let run = Arc::new(PlanRun::new(
            &plan,
            &self.listeners,
            manager,
            self.serializer.as_deref(),
            self.config.clone(),
            &self.pool,
        ));
        info!("启动测试计划运行: {} ({})", plan.name, run.id());

        let parent = ThreadUnit::try_current()
            .unwrap_or_else(|| self.pool.root_unit(Some(&plan.name)));
        let task_run = Arc::clone(&run);
        let task = UnitBuilder::new()
            .name(format!("测试计划 {}", plan.name))
            .parent(&parent)
            .spawn_async(&self.pool, move |unit| execute_plan(&task_run, &plan, unit));

        PlanRunHandle { run, task }
    }

    /// 执行测试计划并等待完成
    pub fn execute(&self, plan: Arc<TestPlan>) -> Result<PlanRunReport> {
        self.start(plan).join()
    }

    /// 关闭执行器的线程池
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl Drop for TestPlanExecutor {
    fn drop(&mut self) {
        // 仍在运行的计划由线程池的临时工作线程继续完成
        if self.owns_pool {
            self.pool.shutdown();
        }
    }
}

/// 测试计划运行句柄
pub struct PlanRunHandle {
    run: Arc<PlanRun>,
    task: UnitTask<()>,
}

impl PlanRunHandle {
    pub fn run(&self) -> &Arc<PlanRun> {
        &self.run
    }

    pub fn id(&self) -> Uuid {
        self.run.id()
    }

    /// 计划所在的线程单元
    pub fn unit(&self) -> &ThreadUnit {
        self.task.unit()
    }

    pub fn is_completed(&self) -> bool {
        self.task.unit().state() >= UnitState::Completed
    }

    /// 中止测试计划
    pub fn abort(&self, reason: Option<&str>) -> Result<()> {
        self.run.log().warn(format!(
            "请求中止测试计划 {}: {}",
            self.run.plan_name(),
            reason.unwrap_or("未提供原因")
        ));
        self.task.unit().abort(reason)?;
        Ok(())
    }

    /// 阻塞等待运行结束，不可在异步运行时内调用
    pub fn join(self) -> Result<PlanRunReport> {
        self.task.join()?;
        Ok(PlanRunReport::from_run(&self.run))
    }

    /// 异步等待运行结束
    pub async fn wait(self) -> Result<PlanRunReport> {
        self.task.await?;
        Ok(PlanRunReport::from_run(&self.run))
    }
}

fn execute_plan(run: &Arc<PlanRun>, plan: &TestPlan, unit: &ThreadUnit) {
    run.log().info(format!(
        "开始执行测试计划: {} ({} 个步骤)",
        plan.name,
        plan.step_count()
    ));
    run.on_plan_started();

    let ready = open_resources(run, plan, unit);

    if ready {
        let inherited = plan
            .break_conditions
            .unwrap_or(run.config().break_conditions);
        let parent = ParentTarget::Plan(Arc::clone(run));
        match run_steps(run, unit, &plan.steps, &parent, inherited) {
            Ok(StepsOutcome::Completed) => {}
            Ok(StepsOutcome::Break { step, verdict }) => {
                run.log().info(format!(
                    "测试计划因步骤 {} (判定 {}) 提前结束",
                    step, verdict
                ));
            }
            Ok(StepsOutcome::Aborted) => {
                run.log().warn("测试计划已中止");
                run.upgrade_verdict(Verdict::Aborted);
            }
            Err(e) => {
                run.log().error(format!("测试计划执行出错: {}", e));
                run.upgrade_verdict(Verdict::Error);
            }
        }
    }

    run.resource_manager().close_all();
    run.add_test_plan_completed(unit);
}

/// 打开计划使用的资源，并把资源元数据写入计划参数
fn open_resources(run: &Arc<PlanRun>, plan: &TestPlan, unit: &ThreadUnit) -> bool {
    let resources = plan.resources();
    if resources.is_empty() {
        return true;
    }

    let harvest = Arc::clone(run);
    run.resource_manager().open(
        unit,
        &resources,
        Arc::new(move |resource: &dyn Resource| {
            for (key, value) in resource.metadata() {
                harvest.set_parameter(key, value);
            }
            harvest.log().debug(format!("资源 {} 已打开", resource.name()));
        }),
    );

    match run
        .resource_manager()
        .wait_until_resources_opened(unit.token(), &resources)
    {
        Ok(()) => true,
        Err(EngineError::Aborted(reason)) => {
            run.log().warn(format!("等待资源时测试计划被中止: {}", reason));
            run.upgrade_verdict(Verdict::Aborted);
            false
        }
        Err(e) => {
            run.log().error(format!("资源打开失败，跳过所有步骤: {}", e));
            run.upgrade_verdict(Verdict::Error);
            false
        }
    }
}

/// 一组同级步骤的执行结果
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepsOutcome {
    Completed,
    Break { step: String, verdict: Verdict },
    Aborted,
}

enum StepOutcome {
    Completed,
    /// 延后处理中，附带已解析的中断条件
    Deferred(Arc<StepRun>, BreakCondition),
    Break { step: String, verdict: Verdict },
    Aborted,
}

/// 依次执行同级步骤
///
/// 延后处理的步骤不阻塞后续同级步骤，全部同级步骤结束后再等待它们完成并求值中断条件。
pub(crate) fn run_steps(
    run: &Arc<PlanRun>,
    unit: &ThreadUnit,
    steps: &[StepNode],
    parent: &ParentTarget,
    inherited: BreakCondition,
) -> Result<StepsOutcome> {
    let mut outcome = StepsOutcome::Completed;
    let mut deferred = Vec::new();

    for node in steps {
        if !node.enabled {
            run.log().debug(format!("跳过已禁用步骤: {}", node.name));
            continue;
        }
        if unit.is_aborted() {
            outcome = StepsOutcome::Aborted;
            break;
        }

        match run_step(run, unit, node, parent, inherited)? {
            StepOutcome::Completed => {}
            StepOutcome::Deferred(step_run, conditions) => deferred.push((step_run, conditions)),
            StepOutcome::Break { step, verdict } => {
                outcome = StepsOutcome::Break { step, verdict };
                break;
            }
            StepOutcome::Aborted => {
                outcome = StepsOutcome::Aborted;
                break;
            }
        }
    }

    for (step_run, conditions) in deferred {
        step_run.wait_for_completion(None);
        if outcome != StepsOutcome::Completed {
            continue;
        }

        let verdict = step_run.verdict();
        if verdict == Verdict::Aborted {
            outcome = StepsOutcome::Aborted;
        } else if evaluate(verdict, conditions, false) == BreakDecision::Break {
            run.log().info(format!(
                "延后处理的步骤 {} 判定 {} 触发中断条件 {}",
                step_run.step_name(),
                verdict,
                conditions
            ));
            outcome = StepsOutcome::Break {
                step: step_run.step_name().to_string(),
                verdict,
            };
        }
    }

    Ok(outcome)
}

fn run_step(
    run: &Arc<PlanRun>,
    unit: &ThreadUnit,
    node: &StepNode,
    parent: &ParentTarget,
    inherited: BreakCondition,
) -> Result<StepOutcome> {
    let conditions = node.break_conditions.resolve(inherited);
    let mut attempt = 0;

    loop {
        if let Err(canceled) = run.throttle_result_propagation() {
            run.log().debug(format!("步骤 {} 启动前节流被取消: {}", node.name, canceled));
            return Ok(StepOutcome::Aborted);
        }

        let step_run = Arc::new(StepRun::new(node, parent.id(), conditions, attempt));
        run.register_step_run(Arc::clone(&step_run));
        step_run.start()?;
        run.on_step_started(&step_run);
        run.log().debug(format!("开始执行步骤: {} (第 {} 次)", node.name, attempt + 1));

        let (result, deferred) = {
            let mut ctx = StepContext::new(run, unit, node, &step_run);
            let result = catch_unwind(AssertUnwindSafe(|| node.step.run(&mut ctx)))
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!(
                        "步骤执行异常: {}",
                        panic_message(payload.as_ref())
                    ))
                });
            (result, ctx.take_deferred())
        };

        let mut aborted = apply_fault(run, &step_run, result);
        if unit.is_aborted() {
            step_run.upgrade_verdict(Verdict::Aborted);
            aborted = true;
        }
        if step_run.verdict() == Verdict::Aborted {
            aborted = true;
        }

        if !deferred.is_empty() && !aborted {
            start_deferred(run, unit, &step_run, parent.clone(), deferred);
            return Ok(StepOutcome::Deferred(step_run, conditions));
        }

        let verdict = step_run.verdict();
        let matched = !aborted && conditions.matches(verdict);
        let retry = matched && attempt < node.max_retries;
        if matched && !retry && node.max_retries > 0 {
            step_run.set_out_of_retries();
        }
        finish_step_run(run, &step_run);

        if retry {
            attempt += 1;
            run.log().info(format!(
                "步骤 {} 判定 {}，重试 ({}/{})",
                node.name, verdict, attempt, node.max_retries
            ));
            continue;
        }

        parent.upgrade_verdict(verdict);
        if aborted {
            return Ok(StepOutcome::Aborted);
        }

        return Ok(
            match evaluate(verdict, conditions, step_run.out_of_retries()) {
                BreakDecision::Break => {
                    run.log().info(format!(
                        "步骤 {} 判定 {} 触发中断条件 {}",
                        node.name, verdict, conditions
                    ));
                    StepOutcome::Break {
                        step: node.name.clone(),
                        verdict,
                    }
                }
                BreakDecision::Continue => StepOutcome::Completed,
            },
        );
    }
}

/// 按失败分类更新步骤判定，返回是否被取消
fn apply_fault(run: &PlanRun, step_run: &StepRun, result: anyhow::Result<()>) -> bool {
    let Err(error) = result else {
        return false;
    };

    match StepFault::classify(error) {
        StepFault::ChildBreak => false,
        StepFault::Aborted(reason) => {
            step_run.upgrade_verdict(Verdict::Aborted);
            run.log()
                .info(format!("步骤 {} 已中止: {}", step_run.step_name(), reason));
            true
        }
        StepFault::Error(e) => {
            step_run.upgrade_verdict(Verdict::Error);
            step_run.set_error(format!("{:#}", e));
            run.log()
                .error(format!("步骤 {} 执行失败: {:#}", step_run.step_name(), e));
            false
        }
    }
}

fn finish_step_run(run: &PlanRun, step_run: &StepRun) {
    step_run.complete(None);
    run.on_step_completed(step_run);
    run.log().debug(format!(
        "步骤 {} 完成，判定 {}",
        step_run.step_name(),
        step_run.verdict()
    ));
}

/// 在子线程单元上执行延后工作，完成后结束步骤运行并向父目标上报判定
fn start_deferred(
    run: &Arc<PlanRun>,
    unit: &ThreadUnit,
    step_run: &Arc<StepRun>,
    parent: ParentTarget,
    work: Vec<DeferredWork>,
) {
    step_run.mark_deferred();
    let name = format!("延后处理 {}", step_run.step_name());
    let run = Arc::clone(run);
    let step_run = Arc::clone(step_run);

    unit.start(Some(&name), move |child| {
        let ctx = DeferredContext::new(Arc::clone(&run), Arc::clone(&step_run), child.clone());
        for item in work {
            let result = catch_unwind(AssertUnwindSafe(|| item(&ctx))).unwrap_or_else(|payload| {
                Err(anyhow::anyhow!(
                    "延后处理异常: {}",
                    panic_message(payload.as_ref())
                ))
            });
            if apply_fault(&run, &step_run, result) {
                break;
            }
        }
        if child.is_aborted() {
            step_run.upgrade_verdict(Verdict::Aborted);
        }

        finish_step_run(&run, &step_run);
        parent.upgrade_verdict(step_run.verdict());
    });
}
