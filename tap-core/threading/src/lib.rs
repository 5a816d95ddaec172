//! TAP 线程层
//!
//! 为测试计划执行引擎提供并发基础设施:
//! - 线程单元 (ThreadUnit): 带父子关系、层级取消令牌和局部存储的调度单元
//! - 线程池 (ThreadPool): 维持空闲线程下限、按负载弹性扩缩的工作线程池
//! - 工作队列 (WorkQueue): 绑定单个接收者、严格 FIFO 的串行派发队列

pub mod config;
pub mod field;
pub mod pool;
pub mod sync;
pub mod unit;
pub mod work_queue;

pub use config::PoolConfig;
pub use field::{FieldMode, ThreadField};
pub use pool::{ThreadPool, UnitTask};
pub use sync::{CountingSemaphore, ManualResetEvent};
pub use unit::{ThreadUnit, UnitBuilder, UnitId, UnitState};
pub use work_queue::{WorkQueue, WorkQueueOptions};

pub use tokio_util::sync::CancellationToken;

use thiserror::Error;

/// 线程层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThreadingError {
    #[error("操作已取消: {0}")]
    OperationCanceled(String),

    #[error("工作队列 {0} 已释放")]
    QueueDisposed(String),

    #[error("线程单元执行异常: {0}")]
    Panicked(String),

    #[error("线程单元结果通道已关闭")]
    ResultDropped,
}

impl ThreadingError {
    /// 是否为取消错误
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::OperationCanceled(_))
    }
}

pub type Result<T> = std::result::Result<T, ThreadingError>;

/// 从 panic 载荷中提取可读信息
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知 panic".to_string()
    }
}
