//! 运行日志
//!
//! 计划运行期间的引擎日志同时写入 tracing 和内存缓冲，
//! 运行结束时以只读视图交给结果监听器并写入报告。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// 日志条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:<5} {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.message
        )
    }
}

/// 计划运行日志
#[derive(Debug, Default)]
pub struct RunLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{}", message);
        self.push(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.push(LogLevel::Error, message);
    }

    fn push(&self, level: LogLevel, message: String) {
        self.entries.lock().push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    /// 当前内容的只读快照
    pub fn view(&self) -> LogView {
        LogView {
            entries: self.entries.lock().clone(),
        }
    }
}

/// 运行日志只读视图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogView {
    entries: Vec<LogEntry>,
}

impl LogView {
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, text: &str) -> bool {
        self.entries.iter().any(|e| e.message.contains(text))
    }

    pub fn at_level(&self, level: LogLevel) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(move |e| e.level >= level)
    }
}
