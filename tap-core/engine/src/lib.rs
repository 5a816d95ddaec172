//! TAP 执行引擎
//!
//! 运行由测试步骤组成的测试计划树：
//! - 判定 (Verdict) 只升不降，步骤判定逐级上报给父步骤与计划
//! - 中断条件 (BreakCondition) 支持继承与重试
//! - 每个结果监听器绑定独立的工作队列，慢监听器通过节流反压生产者
//! - 资源在计划开始前并行打开，计划结束后逆序关闭

pub mod break_condition;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod listener;
pub mod log;
pub mod plan;
pub mod plan_run;
pub mod resource;
pub mod results;
pub mod serializer;
pub mod step_run;
pub mod steps;
pub mod verdict;

pub use break_condition::{evaluate, BreakCondition, BreakDecision, BreakFlag};
pub use config::EngineConfig;
pub use context::{DeferredContext, DeferredWork, StepContext};
pub use error::{EngineError, Result};
pub use executor::{PlanRunHandle, TestPlanExecutor};
pub use listener::{LogListener, ResultListener};
pub use log::{LogEntry, LogLevel, LogView, RunLog};
pub use plan::{StepNode, TestPlan, TestStep};
pub use plan_run::{PlanRun, PlanRunInfo, PlanRunReport};
pub use resource::{ParallelResourceManager, Resource, ResourceManager, ResourceOpenedCallback};
pub use results::{ResultColumn, ResultTable};
pub use serializer::{JsonPlanSerializer, PlanSerializer, PlanSnapshot, StepSnapshot};
pub use step_run::{StepRun, StepRunInfo};
pub use steps::{DelayStep, FailStep, PublishResultsStep, SequenceStep, SetVerdictStep};
pub use verdict::{Verdict, VerdictCell};
