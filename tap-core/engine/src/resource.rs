//! 资源管理
//!
//! 资源（仪器、被测设备等）在计划开始前统一打开、结束后统一关闭。
//! `ParallelResourceManager` 为每个资源启动一个线程单元并行打开。

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tap_threading::{panic_message, CancellationToken, ThreadUnit};
use tracing::{debug, info, warn};

use crate::{EngineError, Result};

/// 可打开/关闭的外部资源
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self) -> anyhow::Result<()>;

    fn close(&self) -> anyhow::Result<()>;

    /// 打开后采集的元数据，写入计划运行参数
    fn metadata(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// 资源打开通知
pub type ResourceOpenedCallback = Arc<dyn Fn(&dyn Resource) + Send + Sync>;

/// 资源管理器
pub trait ResourceManager: Send + Sync {
    /// 异步打开资源，立即返回；每个资源打开后调用 `on_opened`
    fn open(
        &self,
        parent: &ThreadUnit,
        resources: &[Arc<dyn Resource>],
        on_opened: ResourceOpenedCallback,
    );

    /// 阻塞直到给定资源全部打开，取消或打开失败时返回错误
    fn wait_until_resources_opened(
        &self,
        token: &CancellationToken,
        resources: &[Arc<dyn Resource>],
    ) -> Result<()>;

    /// 关闭所有已打开的资源
    fn close_all(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ResourceState {
    Opening,
    Opened,
    Failed(String),
}

#[derive(Default)]
struct Registry {
    states: HashMap<String, ResourceState>,
    resources: HashMap<String, Arc<dyn Resource>>,
    /// 打开成功的顺序
    opened_order: Vec<String>,
}

struct ManagerShared {
    registry: Mutex<Registry>,
    changed: Condvar,
}

/// 并行资源管理器
pub struct ParallelResourceManager {
    shared: Arc<ManagerShared>,
    poll_interval: Duration,
}

impl ParallelResourceManager {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                registry: Mutex::new(Registry::default()),
                changed: Condvar::new(),
            }),
            poll_interval,
        }
    }

    /// 已打开的资源名称，按打开顺序
    pub fn opened(&self) -> Vec<String> {
        self.shared.registry.lock().opened_order.clone()
    }
}

impl Default for ParallelResourceManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl ResourceManager for ParallelResourceManager {
    fn open(
        &self,
        parent: &ThreadUnit,
        resources: &[Arc<dyn Resource>],
        on_opened: ResourceOpenedCallback,
    ) {
        for resource in resources {
            let name = resource.name().to_string();
            {
                let mut registry = self.shared.registry.lock();
                if registry.states.contains_key(&name) {
                    continue;
                }
                registry.states.insert(name.clone(), ResourceState::Opening);
                registry
                    .resources
                    .insert(name.clone(), Arc::clone(resource));
            }

            debug!("打开资源: {}", name);
            let shared = Arc::clone(&self.shared);
            let resource = Arc::clone(resource);
            let on_opened = Arc::clone(&on_opened);
            parent.start(Some(&format!("打开资源 {}", name)), move |_| {
                let outcome = catch_unwind(AssertUnwindSafe(|| resource.open()))
                    .unwrap_or_else(|payload| {
                        Err(anyhow::anyhow!("{}", panic_message(payload.as_ref())))
                    });

                let state = match outcome {
                    Ok(()) => {
                        // 先发出通知再标记为已打开
                        on_opened(resource.as_ref());
                        info!("资源已打开: {}", name);
                        ResourceState::Opened
                    }
                    Err(e) => {
                        warn!("资源 {} 打开失败: {:#}", name, e);
                        ResourceState::Failed(format!("{:#}", e))
                    }
                };

                let mut registry = shared.registry.lock();
                if state == ResourceState::Opened {
                    registry.opened_order.push(name.clone());
                }
                registry.states.insert(name, state);
                shared.changed.notify_all();
            });
        }
    }

    fn wait_until_resources_opened(
        &self,
        token: &CancellationToken,
        resources: &[Arc<dyn Resource>],
    ) -> Result<()> {
        let mut registry = self.shared.registry.lock();
        loop {
            let mut pending = false;
            for resource in resources {
                match registry.states.get(resource.name()) {
                    Some(ResourceState::Opened) => {}
                    Some(ResourceState::Failed(message)) => {
                        return Err(EngineError::ResourceFailed {
                            name: resource.name().to_string(),
                            message: message.clone(),
                        });
                    }
                    Some(ResourceState::Opening) | None => pending = true,
                }
            }
            if !pending {
                return Ok(());
            }
            if token.is_cancelled() {
                return Err(EngineError::Aborted("等待资源打开时被取消".to_string()));
            }
            self.shared
                .changed
                .wait_for(&mut registry, self.poll_interval);
        }
    }

    fn close_all(&self) {
        let to_close: Vec<(String, Arc<dyn Resource>)> = {
            let mut registry = self.shared.registry.lock();
            let order = std::mem::take(&mut registry.opened_order);
            let closing: Vec<_> = order
                .into_iter()
                .rev()
                .filter_map(|name| {
                    registry
                        .resources
                        .get(&name)
                        .cloned()
                        .map(|resource| (name, resource))
                })
                .collect();
            registry.states.clear();
            registry.resources.clear();
            closing
        };

        for (name, resource) in to_close {
            let outcome = catch_unwind(AssertUnwindSafe(|| resource.close()))
                .unwrap_or_else(|payload| {
                    Err(anyhow::anyhow!("{}", panic_message(payload.as_ref())))
                });
            match outcome {
                Ok(()) => debug!("资源已关闭: {}", name),
                Err(e) => warn!("关闭资源 {} 失败: {:#}", name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tap_threading::{PoolConfig, ThreadPool};

    struct FakeResource {
        name: String,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Resource for FakeResource {
        fn name(&self) -> &str {
            &self.name
        }

        fn open(&self) -> anyhow::Result<()> {
            std::thread::sleep(Duration::from_millis(5));
            if self.fail {
                anyhow::bail!("连接被拒绝");
            }
            self.log.lock().push(format!("open {}", self.name));
            Ok(())
        }

        fn close(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("close {}", self.name));
            Ok(())
        }

        fn metadata(&self) -> Vec<(String, String)> {
            vec![(format!("{}.serial", self.name), "SN-1".to_string())]
        }
    }

    fn resource(name: &str, fail: bool, log: &Arc<Mutex<Vec<String>>>) -> Arc<dyn Resource> {
        Arc::new(FakeResource {
            name: name.to_string(),
            fail,
            log: Arc::clone(log),
        })
    }

    #[test]
    fn test_open_and_close_in_reverse_order() {
        let pool = ThreadPool::new(PoolConfig::default().with_idle_floor(2));
        let root = pool.root_unit(None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ParallelResourceManager::new(Duration::from_millis(10));
        let resources = vec![resource("dut", false, &log), resource("scope", false, &log)];
        let notified = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&notified);
        manager.open(
            &root,
            &resources,
            Arc::new(move |r: &dyn Resource| {
                assert_eq!(r.metadata().len(), 1);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        manager
            .wait_until_resources_opened(root.token(), &resources)
            .unwrap();
        assert_eq!(notified.load(Ordering::SeqCst), 2);

        let opened = manager.opened();
        manager.close_all();
        let closes: Vec<String> = log
            .lock()
            .iter()
            .filter(|l| l.starts_with("close"))
            .cloned()
            .collect();
        let expected: Vec<String> = opened.iter().rev().map(|n| format!("close {}", n)).collect();
        assert_eq!(closes, expected);
        pool.shutdown();
    }

    #[test]
    fn test_failed_resource_reported() {
        let pool = ThreadPool::new(PoolConfig::default().with_idle_floor(1));
        let root = pool.root_unit(None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = ParallelResourceManager::new(Duration::from_millis(10));
        let resources = vec![resource("psu", true, &log)];

        manager.open(&root, &resources, Arc::new(|_: &dyn Resource| {}));
        let result = manager.wait_until_resources_opened(root.token(), &resources);
        assert!(matches!(result, Err(EngineError::ResourceFailed { name, .. }) if name == "psu"));
        pool.shutdown();
    }

    #[test]
    fn test_wait_honours_cancellation() {
        let manager = ParallelResourceManager::new(Duration::from_millis(5));
        let log = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        token.cancel();
        let result =
            manager.wait_until_resources_opened(&token, &[resource("never", false, &log)]);
        assert!(matches!(result, Err(EngineError::Aborted(_))));
    }
}
