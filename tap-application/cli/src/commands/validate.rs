//! Validate 命令处理

use anyhow::Result;
use colored::Colorize;
use std::path::Path;

use tap_engine::{BreakCondition, StepNode, TestStep};

use crate::plan_file::PlanFile;

pub fn handle(file: &str) -> Result<()> {
    let plan = PlanFile::load(Path::new(file))?.into_test_plan()?;

    println!("{} 计划有效: {}", "✓".green().bold(), plan.name.cyan().bold());
    match plan.break_conditions {
        Some(conditions) => println!("中断条件: {}", conditions.to_string().yellow()),
        None => println!("中断条件: {}", "引擎默认".bright_black()),
    }
    println!("步骤数: {}", plan.step_count().to_string().yellow());
    println!();

    for node in &plan.steps {
        print_node(node, 0);
    }
    Ok(())
}

fn print_node(node: &StepNode, depth: usize) {
    let mut line = format!(
        "{}- {} [{}]",
        "  ".repeat(depth),
        node.name,
        node.step.type_name().cyan()
    );
    if node.break_conditions != BreakCondition::INHERIT {
        line.push_str(&format!(" 中断条件: {}", node.break_conditions));
    }
    if node.max_retries > 0 {
        line.push_str(&format!(" 重试: {}", node.max_retries));
    }
    if !node.enabled {
        line.push_str(&" (已禁用)".bright_black().to_string());
    }
    println!("{}", line);

    for child in &node.children {
        print_node(child, depth + 1);
    }
}
