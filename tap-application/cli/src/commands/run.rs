//! Run 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use tap_engine::{EngineConfig, LogListener, PlanRunReport, TestPlanExecutor};

use super::output::{export_report, step_depths, verdict_icon, verdict_label};
use crate::plan_file::PlanFile;

pub async fn handle(
    file: &str,
    config: Option<&str>,
    report_path: Option<&str>,
    abort_after: Option<u64>,
) -> Result<()> {
    let config = match config {
        Some(path) => {
            let config = EngineConfig::load_from_file(Path::new(path))?;
            config.validate()?;
            config
        }
        None => EngineConfig::load()?,
    };

    let plan = PlanFile::load(Path::new(file))?.into_test_plan()?;
    println!(
        "{} 计划加载成功: {} ({} 个步骤)",
        "✓".green().bold(),
        plan.name.cyan(),
        plan.step_count().to_string().yellow()
    );

    let executor = TestPlanExecutor::new(config).with_listener(Arc::new(LogListener::new()));
    let handle = executor.start(Arc::new(plan));
    let unit = handle.unit().clone();

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message("执行中...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let wait = handle.wait();
    tokio::pin!(wait);
    let report = match abort_after {
        Some(ms) => {
            tokio::select! {
                report = &mut wait => report?,
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    warn!("运行超过 {} ms，中止测试计划", ms);
                    unit.abort(Some("运行超时"))?;
                    wait.await?
                }
            }
        }
        None => wait.await?,
    };

    spinner.finish_and_clear();
    executor.shutdown();

    print_report(&report);

    if let Some(path) = report_path {
        export_report(&report, Path::new(path))
            .with_context(|| format!("导出报告失败: {}", path))?;
        println!("报告已导出: {}", path.cyan());
    }

    if !report.passed() {
        anyhow::bail!("测试计划未通过 (判定: {})", report.verdict());
    }
    Ok(())
}

fn print_report(report: &PlanRunReport) {
    println!("\n{}", "=".repeat(60));
    println!("{}", "运行报告".bold());
    println!("{}", "=".repeat(60));
    println!();

    println!("计划名称: {}", report.run.plan_name.cyan().bold());
    println!("运行 ID:  {}", report.run.id.to_string().bright_black());
    if let Some(ms) = report.run.duration_ms {
        println!("执行时间: {} ms", ms.to_string().yellow());
    }
    println!("判定:     {}", verdict_label(report.verdict()));
    println!();

    if !report.steps.is_empty() {
        println!("步骤详情:");
        println!();

        for (step, depth) in report.steps.iter().zip(step_depths(report)) {
            let indent = "  ".repeat(depth);
            let mut line = format!(
                "{}{} {} [{}]",
                indent,
                verdict_icon(step.verdict).bold(),
                step.step_name,
                verdict_label(step.verdict)
            );
            if step.attempt > 0 {
                line.push_str(&format!(" 第 {} 次重试", step.attempt).yellow().to_string());
            }
            if step.was_deferred {
                line.push_str(&" 延后处理".bright_black().to_string());
            }
            if let Some(ms) = step.duration_ms {
                line.push_str(&format!(" {} ms", ms).bright_black().to_string());
            }
            println!("{}", line);

            if let Some(error) = &step.error {
                println!("{}   错误: {}", indent, error.red());
            }
        }
        println!();
    }

    if !report.run.parameters.is_empty() {
        println!("计划参数:");
        for (key, value) in &report.run.parameters {
            println!("  {}: {}", key, value.bright_black());
        }
        println!();
    }

    println!("{}", "=".repeat(60));
    let status = if report.passed() {
        format!("{} 测试计划通过", "✓".green().bold())
    } else {
        format!("{} 测试计划未通过", "✗".red().bold())
    };
    println!("{}", status);
    println!("{}", "=".repeat(60));
}
