//! 测试计划模型

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::break_condition::BreakCondition;
use crate::context::StepContext;
use crate::resource::Resource;

/// 测试步骤
pub trait TestStep: Send + Sync {
    /// 步骤类型名称
    fn type_name(&self) -> &str;

    /// 执行步骤
    fn run(&self, ctx: &mut StepContext<'_>) -> anyhow::Result<()>;

    /// 步骤使用的资源，计划开始前统一打开
    fn resources(&self) -> Vec<Arc<dyn Resource>> {
        Vec::new()
    }
}

/// 计划树中的步骤节点
#[derive(Clone)]
pub struct StepNode {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub break_conditions: BreakCondition,
    /// 命中中断条件后的最大重试次数
    pub max_retries: u32,
    pub step: Arc<dyn TestStep>,
    pub children: Vec<StepNode>,
}

impl StepNode {
    /// 创建新的步骤节点，默认继承中断条件
    pub fn new(name: impl Into<String>, step: impl TestStep + 'static) -> Self {
        Self::from_arc(name, Arc::new(step))
    }

    pub fn from_arc(name: impl Into<String>, step: Arc<dyn TestStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            enabled: true,
            break_conditions: BreakCondition::INHERIT,
            max_retries: 0,
            step,
            children: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: StepNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = StepNode>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn with_break_conditions(mut self, conditions: BreakCondition) -> Self {
        self.break_conditions = conditions;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// 子树中的节点数（含自身）
    pub fn step_count(&self) -> usize {
        1 + self.children.iter().map(StepNode::step_count).sum::<usize>()
    }
}

impl fmt::Debug for StepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.step.type_name())
            .field("enabled", &self.enabled)
            .field("break_conditions", &self.break_conditions)
            .field("max_retries", &self.max_retries)
            .field("children", &self.children)
            .finish()
    }
}

/// 测试计划
#[derive(Debug, Clone)]
pub struct TestPlan {
    pub id: Uuid,
    pub name: String,
    /// 计划级中断条件，未设置时使用引擎配置
    pub break_conditions: Option<BreakCondition>,
    pub steps: Vec<StepNode>,
}

impl TestPlan {
    /// 创建新的测试计划
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            break_conditions: None,
            steps: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: StepNode) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_break_conditions(mut self, conditions: BreakCondition) -> Self {
        self.break_conditions = Some(conditions);
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.iter().map(StepNode::step_count).sum()
    }

    /// 按 ID 查找步骤
    pub fn find_step(&self, id: Uuid) -> Option<&StepNode> {
        let mut stack: Vec<&StepNode> = self.steps.iter().collect();
        while let Some(node) = stack.pop() {
            if node.id == id {
                return Some(node);
            }
            stack.extend(node.children.iter());
        }
        None
    }

    /// 已启用步骤使用的资源，按名称去重并保持首次出现的顺序
    pub fn resources(&self) -> Vec<Arc<dyn Resource>> {
        let mut seen = HashSet::new();
        let mut resources = Vec::new();
        collect_resources(&self.steps, &mut seen, &mut resources);
        resources
    }
}

fn collect_resources(
    nodes: &[StepNode],
    seen: &mut HashSet<String>,
    resources: &mut Vec<Arc<dyn Resource>>,
) {
    for node in nodes.iter().filter(|n| n.enabled) {
        for resource in node.step.resources() {
            if seen.insert(resource.name().to_string()) {
                resources.push(resource);
            }
        }
        collect_resources(&node.children, seen, resources);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{DelayStep, SequenceStep};
    use std::time::Duration;

    #[test]
    fn test_plan_structure() {
        let child = StepNode::new("delay", DelayStep::new(Duration::from_millis(1)));
        let child_id = child.id;
        let plan = TestPlan::new("structure")
            .with_step(StepNode::new("sequence", SequenceStep).with_child(child))
            .with_step(StepNode::new("disabled", SequenceStep).with_enabled(false));

        assert_eq!(plan.step_count(), 3);
        assert_eq!(plan.find_step(child_id).map(|n| n.name.as_str()), Some("delay"));
        assert!(plan.find_step(Uuid::new_v4()).is_none());
        assert_eq!(plan.steps[0].break_conditions, BreakCondition::INHERIT);
    }
}
