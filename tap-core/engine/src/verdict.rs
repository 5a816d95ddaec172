//! 判定

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::EngineError;

/// 测试判定，按声明顺序全序
///
/// `NotSet < Inconclusive < Pass < Fail < Error < Aborted`
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Verdict {
    #[default]
    NotSet = 0,
    Inconclusive = 1,
    Pass = 2,
    Fail = 3,
    Error = 4,
    Aborted = 5,
}

impl Verdict {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotSet,
            1 => Self::Inconclusive,
            2 => Self::Pass,
            3 => Self::Fail,
            4 => Self::Error,
            _ => Self::Aborted,
        }
    }

    /// 是否为失败类判定 (Fail 及以上)
    pub fn is_failure(self) -> bool {
        self >= Verdict::Fail
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSet => "not_set",
            Self::Inconclusive => "inconclusive",
            Self::Pass => "pass",
            Self::Fail => "fail",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotSet => "NotSet",
            Self::Inconclusive => "Inconclusive",
            Self::Pass => "Pass",
            Self::Fail => "Fail",
            Self::Error => "Error",
            Self::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

impl FromStr for Verdict {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "not_set" | "notset" => Ok(Self::NotSet),
            "inconclusive" => Ok(Self::Inconclusive),
            "pass" => Ok(Self::Pass),
            "fail" => Ok(Self::Fail),
            "error" => Ok(Self::Error),
            "aborted" => Ok(Self::Aborted),
            other => Err(EngineError::ConfigError(format!("未知判定: {}", other))),
        }
    }
}

/// 只升不降的判定单元
///
/// 升级走双重检查：先无锁读取快速排除，再在锁内复核并写入。
#[derive(Debug, Default)]
pub struct VerdictCell {
    value: AtomicU8,
    lock: Mutex<()>,
}

impl VerdictCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Verdict {
        Verdict::from_u8(self.value.load(Ordering::Acquire))
    }

    /// 升级判定，实际发生变化时返回 true
    pub fn upgrade(&self, verdict: Verdict) -> bool {
        if verdict <= self.get() {
            return false;
        }
        let _guard = self.lock.lock();
        if verdict <= self.get() {
            return false;
        }
        self.value.store(verdict as u8, Ordering::Release);
        true
    }
}
