//! Config 命令处理

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::Path;

use tap_engine::EngineConfig;

use crate::ConfigAction;

pub fn handle(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { config, format } => show_config(config.as_deref(), &format),
        ConfigAction::Init { path, force } => init_config(&path, force),
    }
}

fn show_config(path: Option<&str>, format: &str) -> Result<()> {
    let config = match path {
        Some(path) => EngineConfig::load_from_file(Path::new(path))?,
        None => EngineConfig::load()?,
    };

    let content = match format {
        "toml" => toml::to_string_pretty(&config).context("序列化 TOML 失败")?,
        "yaml" => serde_yaml::to_string(&config).context("序列化 YAML 失败")?,
        "json" => serde_json::to_string_pretty(&config).context("序列化 JSON 失败")?,
        other => anyhow::bail!("不支持的输出格式: {} (可选 toml/yaml/json)", other),
    };
    println!("{}", content);
    Ok(())
}

fn init_config(path: &str, force: bool) -> Result<()> {
    let path = Path::new(path);
    if path.exists() && !force {
        anyhow::bail!("配置文件已存在: {:?}，使用 --force 覆盖", path);
    }

    EngineConfig::default().save_to_file(path)?;
    println!("{} 默认配置已写入: {:?}", "✓".green().bold(), path);
    Ok(())
}
