//! 服务定位器
//!
//! 把服务标识（类型 + 可选名称）映射到共享实例。[`ServiceProvider::lock`] 返回的
//! [`ServiceRegistration`] 守卫在持有期间独占注册通道，用于原子地完成多步注册。
//! 事件/定时器核心本身以 [`ASYNC_TASK_SERVICE`] 名称注册为一个服务。

use crate::core::async_task::AsyncTask;
use crate::{FoundryError, Result};
use dashmap::DashMap;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// 异步任务服务的注册名
pub const ASYNC_TASK_SERVICE: &str = "i_async_task";

/// 服务键，用于唯一标识服务
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    /// 类型ID
    pub type_id: TypeId,
    /// 类型名称，仅用于诊断
    pub type_name: &'static str,
    /// 可选的名称标识
    pub name: Option<String>,
}

impl ServiceKey {
    /// 创建基于类型的服务键
    pub fn of_type<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            name: None,
        }
    }

    /// 创建命名服务键
    pub fn named<T: 'static>(name: impl Into<String>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            name: Some(name.into()),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.type_name),
            None => write!(f, "{}", self.type_name),
        }
    }
}

type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// 服务注册表
#[derive(Default)]
pub struct ServiceProvider {
    services: DashMap<ServiceKey, ServiceInstance>,
    // 可重入：持有守卫的线程仍可调用 `register` 等便捷方法
    registration: ReentrantMutex<()>,
}

impl ServiceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 独占注册通道，守卫释放前其他线程的注册者等待；同一线程可重入
    pub fn lock(&self) -> ServiceRegistration<'_> {
        ServiceRegistration {
            provider: self,
            _guard: self.registration.lock(),
        }
    }

    /// 按类型注册服务
    pub fn register<T: Send + Sync + 'static>(&self, service: Arc<T>) -> Result<()> {
        self.lock().register(service)
    }

    /// 按名称注册服务
    pub fn register_named<T: Send + Sync + 'static>(&self, name: &str, service: Arc<T>) -> Result<()> {
        self.lock().register_named(name, service)
    }

    /// 注销服务，返回是否存在
    pub fn unregister(&self, key: &ServiceKey) -> bool {
        self.lock().unregister(key)
    }

    /// 按类型获取服务
    pub fn service<T: Send + Sync + 'static>(&self) -> Result<Arc<T>> {
        self.get(ServiceKey::of_type::<T>())
    }

    /// 按名称获取服务
    pub fn service_named<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        self.get(ServiceKey::named::<T>(name))
    }

    pub fn has_service(&self, key: &ServiceKey) -> bool {
        self.services.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// 注册异步任务服务
    pub fn register_async_task(&self, task: Arc<AsyncTask>) -> Result<()> {
        self.register_named(ASYNC_TASK_SERVICE, task)
    }

    /// 获取异步任务服务
    pub fn async_task(&self) -> Result<Arc<AsyncTask>> {
        self.service_named(ASYNC_TASK_SERVICE)
    }

    fn get<T: Send + Sync + 'static>(&self, key: ServiceKey) -> Result<Arc<T>> {
        let instance = self
            .services
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| FoundryError::ServiceNotFound {
                key: key.to_string(),
            })?;
        instance
            .downcast::<T>()
            .map_err(|_| FoundryError::internal(&format!("Service type mismatch: {}", key)))
    }

    fn insert(&self, key: ServiceKey, instance: ServiceInstance) -> Result<()> {
        if self.services.contains_key(&key) {
            return Err(FoundryError::ServiceAlreadyRegistered {
                key: key.to_string(),
            });
        }
        debug!(service = %key, "Service registered");
        self.services.insert(key, instance);
        Ok(())
    }
}

impl fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("services", &self.services.len())
            .finish()
    }
}

/// 注册守卫：持有期间独占注册通道
pub struct ServiceRegistration<'a> {
    provider: &'a ServiceProvider,
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl ServiceRegistration<'_> {
    pub fn register<T: Send + Sync + 'static>(&self, service: Arc<T>) -> Result<()> {
        self.provider.insert(ServiceKey::of_type::<T>(), service)
    }

    pub fn register_named<T: Send + Sync + 'static>(&self, name: &str, service: Arc<T>) -> Result<()> {
        self.provider.insert(ServiceKey::named::<T>(name), service)
    }

    pub fn unregister(&self, key: &ServiceKey) -> bool {
        let removed = self.provider.services.remove(key).is_some();
        if removed {
            debug!(service = %key, "Service unregistered");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clock {
        hz: u32,
    }

    #[test]
    fn test_register_and_resolve() {
        let provider = ServiceProvider::new();
        provider.register(Arc::new(Clock { hz: 60 })).unwrap();

        let clock = provider.service::<Clock>().unwrap();
        assert_eq!(clock.hz, 60);
        assert!(provider.has_service(&ServiceKey::of_type::<Clock>()));
    }

    #[test]
    fn test_missing_service_fails() {
        let provider = ServiceProvider::new();
        let result = provider.service::<Clock>();
        assert!(matches!(result, Err(FoundryError::ServiceNotFound { .. })));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let provider = ServiceProvider::new();
        provider.register_named("a", Arc::new(Clock { hz: 1 })).unwrap();
        provider.register_named("b", Arc::new(Clock { hz: 2 })).unwrap();
        let result = provider.register_named("a", Arc::new(Clock { hz: 3 }));
        assert!(matches!(result, Err(FoundryError::ServiceAlreadyRegistered { .. })));
        assert_eq!(provider.service_named::<Clock>("b").unwrap().hz, 2);
    }

    #[test]
    fn test_multi_step_registration_under_lock() {
        let provider = ServiceProvider::new();
        {
            let registration = provider.lock();
            registration.register(Arc::new(Clock { hz: 30 })).unwrap();
            registration.register_named("fast", Arc::new(Clock { hz: 120 })).unwrap();
        }
        assert_eq!(provider.len(), 2);
        assert!(provider.unregister(&ServiceKey::named::<Clock>("fast")));
        assert!(!provider.unregister(&ServiceKey::named::<Clock>("fast")));
    }

    #[test]
    fn test_register_while_holding_guard_on_same_thread() {
        let provider = Arc::new(ServiceProvider::new());
        let registration = provider.lock();
        registration.register(Arc::new(Clock { hz: 30 })).unwrap();
        provider.register_named("fast", Arc::new(Clock { hz: 120 })).unwrap();

        let other = Arc::clone(&provider);
        let waiting = std::thread::spawn(move || {
            other.register_named("slow", Arc::new(Clock { hz: 10 })).unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(provider.len(), 2);

        drop(registration);
        waiting.join().unwrap();
        assert_eq!(provider.len(), 3);
    }

    #[test]
    fn test_async_task_is_registered_by_name() {
        let provider = ServiceProvider::new();
        let task = AsyncTask::new("main");
        provider.register_async_task(Arc::clone(&task)).unwrap();

        let found = provider.async_task().unwrap();
        assert!(Arc::ptr_eq(&found, &task));
        assert!(provider.has_service(&ServiceKey::named::<AsyncTask>(ASYNC_TASK_SERVICE)));
    }
}
