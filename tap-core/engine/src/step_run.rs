//! 步骤运行
//!
//! 每次执行步骤前创建一条步骤运行记录，通过父 ID 指向测试计划运行或上级步骤运行。
//! 记录以扁平列表保存在计划运行中，不构成对象图。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tap_threading::ManualResetEvent;
use uuid::Uuid;

use crate::break_condition::BreakCondition;
use crate::plan::StepNode;
use crate::verdict::{Verdict, VerdictCell};
use crate::{EngineError, Result};

/// 步骤运行快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRunInfo {
    pub id: Uuid,
    /// 父运行 ID (计划运行或上级步骤运行)
    pub parent: Uuid,
    pub step_id: Uuid,
    pub step_name: String,
    pub type_name: String,
    pub verdict: Verdict,
    pub start_time: Option<DateTime<Utc>>,
    /// 耗时（毫秒），未完成时为 None
    pub duration_ms: Option<u64>,
    /// 已解析的中断条件
    pub break_conditions: BreakCondition,
    /// 第几次尝试，从 0 开始
    pub attempt: u32,
    pub out_of_retries: bool,
    pub was_deferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
struct StepRunState {
    start_time: Option<DateTime<Utc>>,
    started_at: Option<Instant>,
    duration: Option<Duration>,
    out_of_retries: bool,
    was_deferred: bool,
    error: Option<String>,
}

/// 步骤运行
#[derive(Debug)]
pub struct StepRun {
    id: Uuid,
    parent: Uuid,
    step_id: Uuid,
    step_name: String,
    type_name: String,
    attempt: u32,
    break_conditions: BreakCondition,
    verdict: VerdictCell,
    started: AtomicBool,
    state: Mutex<StepRunState>,
    completed: ManualResetEvent,
}

impl StepRun {
    pub(crate) fn new(
        node: &StepNode,
        parent: Uuid,
        break_conditions: BreakCondition,
        attempt: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent,
            step_id: node.id,
            step_name: node.name.clone(),
            type_name: node.step.type_name().to_string(),
            attempt,
            break_conditions,
            verdict: VerdictCell::new(),
            started: AtomicBool::new(false),
            state: Mutex::new(StepRunState::default()),
            completed: ManualResetEvent::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent(&self) -> Uuid {
        self.parent
    }

    pub fn step_id(&self) -> Uuid {
        self.step_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn break_conditions(&self) -> BreakCondition {
        self.break_conditions
    }

    pub fn verdict(&self) -> Verdict {
        self.verdict.get()
    }

    /// 升级判定，只升不降
    pub fn upgrade_verdict(&self, verdict: Verdict) -> bool {
        self.verdict.upgrade(verdict)
    }

    /// 开始运行，只能调用一次且判定必须仍为 NotSet
    pub fn start(&self) -> Result<()> {
        if self.verdict() != Verdict::NotSet || self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::StepAlreadyStarted(self.id));
        }
        let mut state = self.state.lock();
        state.start_time = Some(Utc::now());
        state.started_at = Some(Instant::now());
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 完成运行，记录耗时并升级判定
    pub(crate) fn complete(&self, verdict: Option<Verdict>) {
        if let Some(verdict) = verdict {
            self.upgrade_verdict(verdict);
        }
        {
            let mut state = self.state.lock();
            state.duration = Some(
                state
                    .started_at
                    .map(|started| started.elapsed())
                    .unwrap_or_default(),
            );
        }
        self.completed.set();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_set()
    }

    /// 等待运行完成，`None` 表示无限等待，超时返回 false
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => self.completed.wait_timeout(timeout),
            None => {
                self.completed.wait();
                true
            }
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.state.lock().duration
    }

    pub fn out_of_retries(&self) -> bool {
        self.state.lock().out_of_retries
    }

    pub(crate) fn set_out_of_retries(&self) {
        self.state.lock().out_of_retries = true;
    }

    pub fn was_deferred(&self) -> bool {
        self.state.lock().was_deferred
    }

    pub(crate) fn mark_deferred(&self) {
        self.state.lock().was_deferred = true;
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().error.clone()
    }

    pub(crate) fn set_error(&self, error: String) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    /// 当前状态快照
    pub fn info(&self) -> StepRunInfo {
        let state = self.state.lock();
        StepRunInfo {
            id: self.id,
            parent: self.parent,
            step_id: self.step_id,
            step_name: self.step_name.clone(),
            type_name: self.type_name.clone(),
            verdict: self.verdict(),
            start_time: state.start_time,
            duration_ms: state.duration.map(|d| d.as_millis() as u64),
            break_conditions: self.break_conditions,
            attempt: self.attempt,
            out_of_retries: state.out_of_retries,
            was_deferred: state.was_deferred,
            error: state.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::SetVerdictStep;

    fn step_run() -> StepRun {
        let node = StepNode::new("verdict", SetVerdictStep::new(Verdict::Pass));
        StepRun::new(&node, Uuid::new_v4(), BreakCondition::BREAK_ON_FAIL, 0)
    }

    #[test]
    fn test_start_twice_fails() {
        let run = step_run();
        assert!(run.start().is_ok());
        assert!(matches!(run.start(), Err(EngineError::StepAlreadyStarted(id)) if id == run.id()));
    }

    #[test]
    fn test_start_after_verdict_fails() {
        let run = step_run();
        run.upgrade_verdict(Verdict::Fail);
        assert!(run.start().is_err());
    }

    #[test]
    fn test_complete_records_duration() {
        let run = step_run();
        run.start().unwrap();
        assert!(!run.wait_for_completion(Some(Duration::from_millis(10))));

        run.complete(Some(Verdict::Pass));
        assert!(run.wait_for_completion(Some(Duration::from_millis(10))));

        let info = run.info();
        assert_eq!(info.verdict, Verdict::Pass);
        assert!(info.duration_ms.is_some());
        assert!(info.start_time.is_some());
        assert_eq!(info.type_name, "verdict");
    }
}
