//! 引擎错误

use tap_threading::ThreadingError;
use thiserror::Error;
use uuid::Uuid;

use crate::verdict::Verdict;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("步骤 {step} 触发中断条件 (判定: {verdict})")]
    StepBreak { step: String, verdict: Verdict },

    #[error("测试计划已中止: {0}")]
    Aborted(String),

    #[error("步骤运行 {0} 重复启动")]
    StepAlreadyStarted(Uuid),

    #[error("资源 {name} 打开失败: {message}")]
    ResourceFailed { name: String, message: String },

    #[error("结果监听器 {0} 故障")]
    ListenerFault(String),

    #[error("序列化错误: {0}")]
    SerdeError(String),

    #[error("配置错误: {0}")]
    ConfigError(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("线程层错误: {0}")]
    Threading(#[from] ThreadingError),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::SerdeError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// 步骤失败的分类
#[derive(Debug)]
pub(crate) enum StepFault {
    /// 子步骤触发中断，判定已由子步骤上报
    ChildBreak,
    /// 取消
    Aborted(String),
    /// 其它错误
    Error(anyhow::Error),
}

impl StepFault {
    pub(crate) fn classify(error: anyhow::Error) -> Self {
        if let Some(engine) = error.downcast_ref::<EngineError>() {
            match engine {
                EngineError::StepBreak { .. } => return Self::ChildBreak,
                EngineError::Aborted(reason) => return Self::Aborted(reason.clone()),
                EngineError::Threading(ThreadingError::OperationCanceled(reason)) => {
                    return Self::Aborted(reason.clone())
                }
                _ => {}
            }
        }
        if let Some(ThreadingError::OperationCanceled(reason)) =
            error.downcast_ref::<ThreadingError>()
        {
            return Self::Aborted(reason.clone());
        }
        Self::Error(error)
    }
}
