//! TAP CLI 应用

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod plan_file;

#[derive(Parser)]
#[command(name = "tap")]
#[command(about = "TAP - 测试计划执行引擎", long_about = None)]
#[command(version)]
struct Cli {
    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 运行测试计划
    Run {
        /// 计划文件路径 (.yaml/.yml/.json)
        file: String,

        /// 引擎配置文件路径，默认按搜索顺序加载
        #[arg(short, long)]
        config: Option<String>,

        /// 导出运行报告 (.json/.yaml/.yml)
        #[arg(short, long)]
        report: Option<String>,

        /// 超过指定毫秒数后中止运行
        #[arg(long)]
        abort_after: Option<u64>,
    },

    /// 检查计划文件并打印步骤树
    Validate {
        /// 计划文件路径
        file: String,
    },

    /// 引擎配置管理
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// 显示生效的引擎配置
    Show {
        /// 配置文件路径
        #[arg(short, long)]
        config: Option<String>,

        /// 输出格式 (toml/yaml/json)
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// 写入默认配置文件
    Init {
        /// 输出路径
        #[arg(default_value = "tap.toml")]
        path: String,

        /// 覆盖已存在的文件
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志，RUST_LOG 优先于 --log-level
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!("TAP CLI 启动");

    match cli.command {
        Commands::Run {
            file,
            config,
            report,
            abort_after,
        } => commands::run::handle(&file, config.as_deref(), report.as_deref(), abort_after).await?,
        Commands::Validate { file } => commands::validate::handle(&file)?,
        Commands::Config { action } => commands::config::handle(action)?,
    }

    Ok(())
}
