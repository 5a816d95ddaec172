//! 引擎配置
//!
//! 加载顺序: `TAP_ENGINE_CONFIG` 指定的文件 → 当前目录 `tap.toml`/`tap.yaml`/`tap.json`
//! → `~/.config/tap/engine.toml`，随后应用环境变量覆盖。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tap_threading::{PoolConfig, WorkQueueOptions};

use crate::break_condition::BreakCondition;

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 结果传播延迟上限（秒），队列预计清空时间超过该值时阻塞生产者
    #[serde(default = "default_result_latency_limit")]
    pub result_latency_limit: f64,

    /// 节流等待超过该时长（毫秒）时记录警告
    #[serde(default = "default_throttle_warning_ms")]
    pub throttle_warning_ms: u64,

    /// 节流轮询间隔（毫秒）
    #[serde(default = "default_throttle_poll_ms")]
    pub throttle_poll_ms: u64,

    /// 收尾阶段等待结果队列时，每隔该时长（秒）记录一次警告
    #[serde(default = "default_teardown_warning_secs")]
    pub teardown_warning_secs: u64,

    /// 等待资源打开的轮询间隔（毫秒）
    #[serde(default = "default_resource_poll_ms")]
    pub resource_poll_ms: u64,

    /// 测试计划未指定时使用的默认中断条件
    #[serde(default = "default_break_conditions")]
    pub break_conditions: BreakCondition,

    /// 线程池配置
    #[serde(default)]
    pub pool: PoolConfig,

    /// 结果监听器工作队列选项
    #[serde(default)]
    pub work_queue: WorkQueueOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            result_latency_limit: default_result_latency_limit(),
            throttle_warning_ms: default_throttle_warning_ms(),
            throttle_poll_ms: default_throttle_poll_ms(),
            teardown_warning_secs: default_teardown_warning_secs(),
            resource_poll_ms: default_resource_poll_ms(),
            break_conditions: default_break_conditions(),
            pool: PoolConfig::default(),
            work_queue: WorkQueueOptions::default(),
        }
    }
}

// 默认值函数
fn default_result_latency_limit() -> f64 {
    3.0
}

fn default_throttle_warning_ms() -> u64 {
    100
}

fn default_throttle_poll_ms() -> u64 {
    20
}

fn default_teardown_warning_secs() -> u64 {
    5
}

fn default_resource_poll_ms() -> u64 {
    50
}

fn default_break_conditions() -> BreakCondition {
    BreakCondition::BREAK_ON_ERROR
}

impl EngineConfig {
    pub fn result_latency_limit(&self) -> Duration {
        Duration::try_from_secs_f64(self.result_latency_limit.max(0.0)).unwrap_or(Duration::MAX)
    }

    pub fn throttle_warning(&self) -> Duration {
        Duration::from_millis(self.throttle_warning_ms)
    }

    pub fn throttle_poll(&self) -> Duration {
        Duration::from_millis(self.throttle_poll_ms.max(1))
    }

    pub fn teardown_warning(&self) -> Duration {
        Duration::from_secs(self.teardown_warning_secs.max(1))
    }

    pub fn resource_poll(&self) -> Duration {
        Duration::from_millis(self.resource_poll_ms.max(1))
    }

    /// 设置结果传播延迟上限
    pub fn with_result_latency_limit(mut self, limit: Duration) -> Self {
        self.result_latency_limit = limit.as_secs_f64();
        self
    }

    /// 设置默认中断条件
    pub fn with_break_conditions(mut self, conditions: BreakCondition) -> Self {
        self.break_conditions = conditions;
        self
    }

    /// 设置线程池配置
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// 从多个源加载配置 (优先级: 环境变量 > 配置文件 > 默认值)
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                tracing::debug!("加载引擎配置: {:?}", path);
                Self::load_from_file(&path)?
            }
            None => {
                tracing::debug!("未找到引擎配置文件，使用默认值");
                Self::default()
            }
        };

        config.apply_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// 从指定文件加载配置，按扩展名选择格式
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config = match extension(path) {
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("解析 TOML 配置失败: {:?}", path))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("解析 YAML 配置失败: {:?}", path))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("解析 JSON 配置失败: {:?}", path))?,
            _ => anyhow::bail!("不支持的配置文件格式: {:?}", path),
        };

        Ok(config)
    }

    /// 查找配置文件 (按优先级搜索)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(path) = env::var("TAP_ENGINE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("TAP_ENGINE_CONFIG 指向的文件不存在: {:?}", path);
        }

        let local = [
            PathBuf::from("./tap.toml"),
            PathBuf::from("./tap.yaml"),
            PathBuf::from("./tap.json"),
        ];
        if let Some(path) = local.iter().find(|p| p.exists()) {
            return Some(path.clone());
        }

        if let Some(home) = dirs::home_dir() {
            let user_paths = [
                home.join(".config/tap/engine.toml"),
                home.join(".config/tap/engine.yaml"),
            ];
            if let Some(path) = user_paths.iter().find(|p| p.exists()) {
                return Some(path.clone());
            }
        }

        None
    }

    /// 从环境变量覆盖配置
    fn apply_env_vars(&mut self) -> Result<()> {
        if let Ok(limit) = env::var("TAP_RESULT_LATENCY_LIMIT") {
            self.result_latency_limit = limit
                .parse()
                .context("无效的 TAP_RESULT_LATENCY_LIMIT")?;
        }
        if let Ok(floor) = env::var("TAP_IDLE_FLOOR") {
            self.pool.idle_floor = floor.parse().context("无效的 TAP_IDLE_FLOOR")?;
        }
        if let Ok(cap) = env::var("TAP_SOFT_CAP") {
            self.pool.soft_cap = cap.parse().context("无效的 TAP_SOFT_CAP")?;
        }
        if let Ok(secs) = env::var("TAP_TEARDOWN_WARNING") {
            self.teardown_warning_secs = secs.parse().context("无效的 TAP_TEARDOWN_WARNING")?;
        }
        Ok(())
    }

    /// 验证配置
    pub fn validate(&self) -> Result<()> {
        if !self.result_latency_limit.is_finite() || self.result_latency_limit <= 0.0 {
            anyhow::bail!(
                "result_latency_limit 必须为有限正数: {}",
                self.result_latency_limit
            );
        }
        if self.pool.soft_cap == 0 {
            anyhow::bail!("pool.soft_cap 不能为 0");
        }
        if self.pool.soft_cap < self.pool.idle_floor {
            anyhow::bail!(
                "pool.soft_cap ({}) 不能小于 pool.idle_floor ({})",
                self.pool.soft_cap,
                self.pool.idle_floor
            );
        }
        Ok(())
    }

    /// 保存配置到文件
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("创建目录失败: {:?}", parent))?;
            }
        }

        let content = match extension(path) {
            Some("toml") => toml::to_string_pretty(self).context("序列化 TOML 失败")?,
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(self).context("序列化 YAML 失败")?
            }
            Some("json") => serde_json::to_string_pretty(self).context("序列化 JSON 失败")?,
            _ => anyhow::bail!("不支持的配置文件格式: {:?}", path),
        };

        fs::write(path, content).with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|s| s.to_str())
}
