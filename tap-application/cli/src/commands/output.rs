//! CLI 输出格式化
//!
//! 判定着色、步骤树缩进与报告导出

use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use std::collections::HashMap;
use std::path::Path;

use tap_engine::{PlanRunReport, Verdict};

/// 带颜色的判定文本
pub fn verdict_label(verdict: Verdict) -> ColoredString {
    let text = verdict.as_str();
    match verdict {
        Verdict::NotSet => text.bright_black(),
        Verdict::Inconclusive => text.yellow(),
        Verdict::Pass => text.green(),
        Verdict::Fail => text.red(),
        Verdict::Error => text.red().bold(),
        Verdict::Aborted => text.magenta().bold(),
    }
}

/// 判定图标
pub fn verdict_icon(verdict: Verdict) -> ColoredString {
    match verdict {
        Verdict::Pass => "✓".green(),
        Verdict::Inconclusive => "?".yellow(),
        Verdict::NotSet => "·".bright_black(),
        Verdict::Aborted => "⊘".magenta(),
        Verdict::Fail | Verdict::Error => "✗".red(),
    }
}

/// 每个步骤运行在步骤树中的深度，与 `report.steps` 一一对应
pub fn step_depths(report: &PlanRunReport) -> Vec<usize> {
    let mut depths = HashMap::new();
    report
        .steps
        .iter()
        .map(|step| {
            let depth = if step.parent == report.run.id {
                0
            } else {
                depths.get(&step.parent).map(|d| d + 1).unwrap_or(0)
            };
            depths.insert(step.id, depth);
            depth
        })
        .collect()
}

/// 导出报告，按扩展名选择格式
pub fn export_report(report: &PlanRunReport, path: &Path) -> Result<()> {
    let content = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => report.to_json().context("序列化 JSON 报告失败")?,
        Some("yaml") | Some("yml") => report.to_yaml().context("序列化 YAML 报告失败")?,
        _ => anyhow::bail!("不支持的报告格式，仅支持 .json/.yaml/.yml"),
    };

    std::fs::write(path, content).with_context(|| format!("写入报告失败: {:?}", path))?;
    Ok(())
}
