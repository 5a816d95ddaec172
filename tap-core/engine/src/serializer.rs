//! 测试计划快照序列化

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use uuid::Uuid;

use crate::break_condition::BreakCondition;
use crate::plan::{StepNode, TestPlan};
use crate::Result;

/// 测试计划序列化器
pub trait PlanSerializer: Send + Sync {
    fn serialize(&self, plan: &TestPlan, writer: &mut dyn Write) -> Result<()>;

    fn deserialize(&self, reader: &mut dyn Read) -> Result<PlanSnapshot>;
}

/// 测试计划快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub break_conditions: Option<BreakCondition>,
    pub steps: Vec<StepSnapshot>,
}

/// 步骤快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    pub id: Uuid,
    pub name: String,
    pub type_name: String,
    pub enabled: bool,
    pub break_conditions: BreakCondition,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StepSnapshot>,
}

impl From<&StepNode> for StepSnapshot {
    fn from(node: &StepNode) -> Self {
        Self {
            id: node.id,
            name: node.name.clone(),
            type_name: node.step.type_name().to_string(),
            enabled: node.enabled,
            break_conditions: node.break_conditions,
            max_retries: node.max_retries,
            children: node.children.iter().map(StepSnapshot::from).collect(),
        }
    }
}

impl From<&TestPlan> for PlanSnapshot {
    fn from(plan: &TestPlan) -> Self {
        Self {
            id: plan.id,
            name: plan.name.clone(),
            break_conditions: plan.break_conditions,
            steps: plan.steps.iter().map(StepSnapshot::from).collect(),
        }
    }
}

/// JSON 序列化器
#[derive(Debug, Clone, Default)]
pub struct JsonPlanSerializer {
    pretty: bool,
}

impl JsonPlanSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pretty(mut self) -> Self {
        self.pretty = true;
        self
    }
}

impl PlanSerializer for JsonPlanSerializer {
    fn serialize(&self, plan: &TestPlan, writer: &mut dyn Write) -> Result<()> {
        let snapshot = PlanSnapshot::from(plan);
        if self.pretty {
            serde_json::to_writer_pretty(writer, &snapshot)?;
        } else {
            serde_json::to_writer(writer, &snapshot)?;
        }
        Ok(())
    }

    fn deserialize(&self, reader: &mut dyn Read) -> Result<PlanSnapshot> {
        Ok(serde_json::from_reader(reader)?)
    }
}
