//! 线程池配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 线程池配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 空闲线程下限，由管理线程补足
    #[serde(default = "default_idle_floor")]
    pub idle_floor: usize,

    /// 软上限，超过后按 `growth_interval_ms` 节流增长
    #[serde(default = "default_soft_cap")]
    pub soft_cap: usize,

    /// 空闲超时（毫秒），超时且高于空闲下限的线程自行退出
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// 管理线程巡检间隔（毫秒）
    #[serde(default = "default_manager_interval_ms")]
    pub manager_interval_ms: u64,

    /// 超过软上限后两次扩容之间的最小间隔（毫秒）
    #[serde(default = "default_growth_interval_ms")]
    pub growth_interval_ms: u64,

    /// 工作线程名称前缀
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_floor: default_idle_floor(),
            soft_cap: default_soft_cap(),
            idle_timeout_ms: default_idle_timeout_ms(),
            manager_interval_ms: default_manager_interval_ms(),
            growth_interval_ms: default_growth_interval_ms(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn manager_interval(&self) -> Duration {
        Duration::from_millis(self.manager_interval_ms.max(1))
    }

    pub fn growth_interval(&self) -> Duration {
        Duration::from_millis(self.growth_interval_ms)
    }

    /// 设置空闲线程下限
    pub fn with_idle_floor(mut self, idle_floor: usize) -> Self {
        self.idle_floor = idle_floor;
        self
    }

    /// 设置软上限
    pub fn with_soft_cap(mut self, soft_cap: usize) -> Self {
        self.soft_cap = soft_cap;
        self
    }

    /// 设置空闲超时
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

// 默认值函数
fn default_idle_floor() -> usize {
    4
}

fn default_soft_cap() -> usize {
    64
}

fn default_idle_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_manager_interval_ms() -> u64 {
    100
}

fn default_growth_interval_ms() -> u64 {
    100
}

fn default_thread_name_prefix() -> String {
    "tap-worker".to_string()
}
