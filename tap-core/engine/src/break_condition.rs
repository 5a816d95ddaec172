//! 中断条件
//!
//! 每个步骤的中断条件决定某个判定是否停止后续同级步骤。
//! 带 `Inherit` 位时取父步骤运行（或测试计划）已解析的条件。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::verdict::Verdict;

/// 中断条件位集合
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<BreakFlag>", into = "Vec<BreakFlag>")]
pub struct BreakCondition(u8);

impl BreakCondition {
    pub const NONE: Self = Self(0);
    pub const INHERIT: Self = Self(1);
    pub const BREAK_ON_ERROR: Self = Self(2);
    pub const BREAK_ON_FAIL: Self = Self(4);
    pub const BREAK_ON_INCONCLUSIVE: Self = Self(8);
    pub const BREAK_ON_PASS: Self = Self(16);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// 解析继承：带 `Inherit` 位时返回 `inherited`，否则原样返回
    pub fn resolve(self, inherited: BreakCondition) -> BreakCondition {
        if self.contains(Self::INHERIT) {
            inherited.without(Self::INHERIT)
        } else {
            self
        }
    }

    /// 判定是否命中条件
    pub fn matches(self, verdict: Verdict) -> bool {
        let flag = match verdict {
            Verdict::Error => Self::BREAK_ON_ERROR,
            Verdict::Fail => Self::BREAK_ON_FAIL,
            Verdict::Inconclusive => Self::BREAK_ON_INCONCLUSIVE,
            Verdict::Pass => Self::BREAK_ON_PASS,
            Verdict::NotSet | Verdict::Aborted => return false,
        };
        self.contains(flag)
    }

    pub fn flags(self) -> Vec<BreakFlag> {
        BreakFlag::ALL
            .iter()
            .copied()
            .filter(|flag| self.contains(flag.condition()))
            .collect()
    }
}

impl BitOr for BreakCondition {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BreakCondition {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for BreakCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BreakCondition({})", self)
    }
}

impl fmt::Display for BreakCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.flags().iter().map(|flag| flag.as_str()).collect();
        f.write_str(&names.join("|"))
    }
}

/// 单个中断条件标志，配置文件中的表示形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakFlag {
    Inherit,
    BreakOnError,
    BreakOnFail,
    BreakOnInconclusive,
    BreakOnPass,
}

impl BreakFlag {
    const ALL: [BreakFlag; 5] = [
        BreakFlag::Inherit,
        BreakFlag::BreakOnError,
        BreakFlag::BreakOnFail,
        BreakFlag::BreakOnInconclusive,
        BreakFlag::BreakOnPass,
    ];

    pub fn condition(self) -> BreakCondition {
        match self {
            Self::Inherit => BreakCondition::INHERIT,
            Self::BreakOnError => BreakCondition::BREAK_ON_ERROR,
            Self::BreakOnFail => BreakCondition::BREAK_ON_FAIL,
            Self::BreakOnInconclusive => BreakCondition::BREAK_ON_INCONCLUSIVE,
            Self::BreakOnPass => BreakCondition::BREAK_ON_PASS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inherit => "inherit",
            Self::BreakOnError => "break_on_error",
            Self::BreakOnFail => "break_on_fail",
            Self::BreakOnInconclusive => "break_on_inconclusive",
            Self::BreakOnPass => "break_on_pass",
        }
    }
}

impl From<Vec<BreakFlag>> for BreakCondition {
    fn from(flags: Vec<BreakFlag>) -> Self {
        flags
            .into_iter()
            .fold(BreakCondition::NONE, |acc, flag| acc | flag.condition())
    }
}

impl From<BreakCondition> for Vec<BreakFlag> {
    fn from(condition: BreakCondition) -> Self {
        condition.flags()
    }
}

/// 中断判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakDecision {
    Continue,
    Break,
}

/// 中断条件求值
///
/// 重试耗尽或条件命中判定时中断。
pub fn evaluate(verdict: Verdict, conditions: BreakCondition, out_of_retries: bool) -> BreakDecision {
    if out_of_retries || conditions.matches(verdict) {
        BreakDecision::Break
    } else {
        BreakDecision::Continue
    }
}
