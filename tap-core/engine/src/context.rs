//! 步骤执行上下文

use std::sync::Arc;
use std::time::Duration;
use tap_threading::ThreadUnit;

use crate::executor::{run_steps, StepsOutcome};
use crate::plan::StepNode;
use crate::plan_run::{ParentTarget, PlanRun};
use crate::results::ResultTable;
use crate::step_run::StepRun;
use crate::verdict::Verdict;
use crate::EngineError;

/// 延后处理的工作，在步骤 `run` 返回后于子线程单元上执行
pub type DeferredWork = Box<dyn FnOnce(&DeferredContext) -> anyhow::Result<()> + Send>;

/// 步骤执行上下文
pub struct StepContext<'a> {
    run: &'a Arc<PlanRun>,
    unit: &'a ThreadUnit,
    node: &'a StepNode,
    step_run: &'a Arc<StepRun>,
    deferred: Vec<DeferredWork>,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        run: &'a Arc<PlanRun>,
        unit: &'a ThreadUnit,
        node: &'a StepNode,
        step_run: &'a Arc<StepRun>,
    ) -> Self {
        Self {
            run,
            unit,
            node,
            step_run,
            deferred: Vec::new(),
        }
    }

    pub fn plan_run(&self) -> &Arc<PlanRun> {
        self.run
    }

    pub fn step_run(&self) -> &Arc<StepRun> {
        self.step_run
    }

    pub fn unit(&self) -> &ThreadUnit {
        self.unit
    }

    pub fn step_name(&self) -> &str {
        &self.node.name
    }

    pub fn verdict(&self) -> Verdict {
        self.step_run.verdict()
    }

    /// 升级当前步骤判定
    pub fn upgrade_verdict(&self, verdict: Verdict) -> bool {
        self.step_run.upgrade_verdict(verdict)
    }

    /// 发布结果表
    ///
    /// 节流等待中被取消时返回 `OperationCanceled`。
    pub fn publish(&self, table: ResultTable) -> anyhow::Result<()> {
        self.run.publish_result(self.step_run.id(), table)?;
        Ok(())
    }

    /// 执行子步骤
    ///
    /// 子步骤的判定上报给当前步骤运行。子步骤触发中断时返回 `StepBreak`，
    /// 计划被取消时返回 `Aborted`；当前步骤是否继续中断由它自己的中断条件决定。
    pub fn run_child_steps(&mut self) -> anyhow::Result<()> {
        let parent = ParentTarget::Step(Arc::clone(self.step_run));
        let outcome = run_steps(
            self.run,
            self.unit,
            &self.node.children,
            &parent,
            self.step_run.break_conditions(),
        )?;

        match outcome {
            StepsOutcome::Completed => Ok(()),
            StepsOutcome::Break { step, verdict } => {
                Err(EngineError::StepBreak { step, verdict }.into())
            }
            StepsOutcome::Aborted => {
                let reason = self
                    .unit
                    .abort_reason()
                    .unwrap_or_else(|| "子步骤已中止".to_string());
                Err(EngineError::Aborted(reason).into())
            }
        }
    }

    /// 登记延后处理的工作
    ///
    /// 存在延后工作时，`run` 返回后同级步骤立即开始，本步骤运行在延后工作完成后才结束。
    pub fn defer<F>(&mut self, work: F)
    where
        F: FnOnce(&DeferredContext) -> anyhow::Result<()> + Send + 'static,
    {
        self.deferred.push(Box::new(work));
    }

    pub(crate) fn take_deferred(&mut self) -> Vec<DeferredWork> {
        std::mem::take(&mut self.deferred)
    }

    /// 可被计划中止打断的休眠
    pub fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        self.unit.sleep(duration)?;
        Ok(())
    }

    pub fn throw_if_aborted(&self) -> anyhow::Result<()> {
        self.unit.throw_if_aborted()?;
        Ok(())
    }

    pub fn set_parameter(&self, key: impl Into<String>, value: impl Into<String>) {
        self.run.set_parameter(key, value);
    }

    pub fn parameter(&self, key: &str) -> Option<String> {
        self.run.parameter(key)
    }
}

/// 延后工作的执行上下文
pub struct DeferredContext {
    run: Arc<PlanRun>,
    step_run: Arc<StepRun>,
    unit: ThreadUnit,
}

impl DeferredContext {
    pub(crate) fn new(run: Arc<PlanRun>, step_run: Arc<StepRun>, unit: ThreadUnit) -> Self {
        Self {
            run,
            step_run,
            unit,
        }
    }

    pub fn plan_run(&self) -> &Arc<PlanRun> {
        &self.run
    }

    pub fn step_run(&self) -> &Arc<StepRun> {
        &self.step_run
    }

    pub fn unit(&self) -> &ThreadUnit {
        &self.unit
    }

    pub fn upgrade_verdict(&self, verdict: Verdict) -> bool {
        self.step_run.upgrade_verdict(verdict)
    }

    pub fn publish(&self, table: ResultTable) -> anyhow::Result<()> {
        self.run.publish_result(self.step_run.id(), table)?;
        Ok(())
    }

    pub fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        self.unit.sleep(duration)?;
        Ok(())
    }

    pub fn throw_if_aborted(&self) -> anyhow::Result<()> {
        self.unit.throw_if_aborted()?;
        Ok(())
    }
}
