//! CLI 命令处理模块

pub mod config;
pub mod output; // 判定着色与报告导出
pub mod run;
pub mod validate;
