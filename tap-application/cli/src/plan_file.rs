//! 测试计划文件
//!
//! 支持 YAML 与 JSON 两种格式，步骤只能使用内置步骤类型:
//!
//! ```yaml
//! name: smoke
//! break_conditions: [break_on_fail]
//! steps:
//!   - name: 预热
//!     type: delay
//!     ms: 200
//!   - name: 电源测试
//!     type: sequence
//!     retries: 1
//!     children:
//!       - name: 读取功率
//!         type: publish
//!         table: power
//!         columns:
//!           - name: watts
//!             values: [1.5, 1.7]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use tap_engine::{
    BreakCondition, DelayStep, FailStep, PublishResultsStep, ResultColumn, ResultTable,
    SequenceStep, SetVerdictStep, StepNode, TestPlan, Verdict,
};

/// 测试计划文件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFile {
    /// 计划名称
    pub name: String,

    /// 计划级中断条件，未设置时使用引擎配置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_conditions: Option<BreakCondition>,

    /// 根步骤
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

/// 步骤定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub name: String,

    #[serde(flatten)]
    pub kind: StepKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// 未设置时继承父级
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_conditions: Option<BreakCondition>,

    #[serde(default)]
    pub retries: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepDef>,
}

/// 内置步骤类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// 延时（毫秒）
    Delay { ms: u64 },

    /// 依次执行子步骤
    Sequence,

    /// 直接设置判定
    Verdict { verdict: Verdict },

    /// 发布结果表
    Publish {
        table: String,
        #[serde(default)]
        columns: Vec<ResultColumn>,
        #[serde(default)]
        deferred: bool,
    },

    /// 返回错误
    Fail {
        #[serde(default = "default_fail_message")]
        message: String,
    },
}

// 默认值函数
fn default_enabled() -> bool {
    true
}

fn default_fail_message() -> String {
    "步骤执行失败".to_string()
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Delay { .. } => "delay",
            Self::Sequence => "sequence",
            Self::Verdict { .. } => "verdict",
            Self::Publish { .. } => "publish",
            Self::Fail { .. } => "fail",
        }
    }
}

impl PlanFile {
    /// 按扩展名加载计划文件
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("读取计划文件失败: {:?}", path))?;

        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content)
                .with_context(|| format!("解析 YAML 计划失败: {:?}", path)),
            Some("json") => Self::from_json_str(&content)
                .with_context(|| format!("解析 JSON 计划失败: {:?}", path)),
            _ => anyhow::bail!("不支持的计划文件格式，仅支持 .yaml/.yml 或 .json"),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// 转换为可执行的测试计划
    pub fn into_test_plan(self) -> Result<TestPlan> {
        if self.name.trim().is_empty() {
            anyhow::bail!("计划名称不能为空");
        }

        let mut plan = TestPlan::new(self.name);
        if let Some(conditions) = self.break_conditions {
            plan = plan.with_break_conditions(conditions);
        }
        for step in self.steps {
            plan = plan.with_step(build_node(step)?);
        }
        Ok(plan)
    }
}

fn build_node(def: StepDef) -> Result<StepNode> {
    if !def.children.is_empty() && def.kind != StepKind::Sequence {
        anyhow::bail!(
            "步骤 {} 的类型为 {}，只有 sequence 步骤可以包含子步骤",
            def.name,
            def.kind.type_name()
        );
    }

    let mut node = match def.kind {
        StepKind::Delay { ms } => StepNode::new(def.name, DelayStep::new(Duration::from_millis(ms))),
        StepKind::Sequence => StepNode::new(def.name, SequenceStep),
        StepKind::Verdict { verdict } => StepNode::new(def.name, SetVerdictStep::new(verdict)),
        StepKind::Publish {
            table,
            columns,
            deferred,
        } => {
            let mut result = ResultTable::new(table);
            result.columns = columns;
            let step = PublishResultsStep::new(result);
            StepNode::new(def.name, if deferred { step.deferred() } else { step })
        }
        StepKind::Fail { message } => StepNode::new(def.name, FailStep::new(message)),
    };

    node = node.with_enabled(def.enabled).with_retries(def.retries);
    if let Some(conditions) = def.break_conditions {
        node = node.with_break_conditions(conditions);
    }
    for child in def.children {
        node = node.with_child(build_node(child)?);
    }
    Ok(node)
}
