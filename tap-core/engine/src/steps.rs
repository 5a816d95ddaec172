//! 内置测试步骤

use std::time::Duration;

use crate::context::StepContext;
use crate::plan::TestStep;
use crate::results::ResultTable;
use crate::verdict::Verdict;

/// 可被中止打断的延时
#[derive(Debug, Clone)]
pub struct DelayStep {
    pub duration: Duration,
}

impl DelayStep {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

impl TestStep for DelayStep {
    fn type_name(&self) -> &str {
        "delay"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        ctx.sleep(self.duration)
    }
}

/// 依次执行子步骤
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceStep;

impl TestStep for SequenceStep {
    fn type_name(&self) -> &str {
        "sequence"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        ctx.run_child_steps()
    }
}

/// 直接设置判定
#[derive(Debug, Clone, Copy)]
pub struct SetVerdictStep {
    pub verdict: Verdict,
}

impl SetVerdictStep {
    pub fn new(verdict: Verdict) -> Self {
        Self { verdict }
    }
}

impl TestStep for SetVerdictStep {
    fn type_name(&self) -> &str {
        "verdict"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        ctx.upgrade_verdict(self.verdict);
        Ok(())
    }
}

/// 发布结果表
///
/// `deferred` 为 true 时在延后处理中发布，同级步骤不等待发布完成。
#[derive(Debug, Clone)]
pub struct PublishResultsStep {
    pub table: ResultTable,
    pub deferred: bool,
}

impl PublishResultsStep {
    pub fn new(table: ResultTable) -> Self {
        Self {
            table,
            deferred: false,
        }
    }

    pub fn deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

impl TestStep for PublishResultsStep {
    fn type_name(&self) -> &str {
        "publish"
    }

    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        if self.deferred {
            let table = self.table.clone();
            ctx.defer(move |deferred| {
                deferred.publish(table)?;
                deferred.upgrade_verdict(Verdict::Pass);
                Ok(())
            });
        } else {
            ctx.publish(self.table.clone())?;
            ctx.upgrade_verdict(Verdict::Pass);
        }
        Ok(())
    }
}

/// 总是返回错误
#[derive(Debug, Clone)]
pub struct FailStep {
    pub message: String,
}

impl FailStep {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl TestStep for FailStep {
    fn type_name(&self) -> &str {
        "fail"
    }

    fn run(&self, _ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
        anyhow::bail!("{}", self.message)
    }
}
