//! 插件系统核心特征定义
//!
//! 插件在进程内注册（不做动态库加载），加载时拿到服务定位器以注册或获取服务。

use crate::plugins::service_provider::ServiceProvider;
use crate::Result;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 插件ID
pub type PluginId = Uuid;

/// 插件状态枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginState {
    /// 已注册，未加载
    Registered,
    /// 加载中
    Loading,
    /// 已加载
    Loaded,
    /// 卸载中
    Unloading,
    /// 加载失败
    Error,
}

/// 核心插件特征 - 所有插件必须实现
pub trait Plugin: Send {
    /// 插件元数据
    fn metadata(&self) -> &PluginMetadata;

    /// 加载插件
    fn load(&mut self, services: &ServiceProvider) -> Result<()>;

    /// 卸载插件
    fn unload(&mut self) -> Result<()>;

    /// 是否已加载
    fn loaded(&self) -> bool;
}

/// 插件元数据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// 插件ID
    pub id: PluginId,
    /// 插件名称
    pub name: String,
    /// 插件版本
    pub version: Version,
    /// 插件描述
    pub description: String,
    /// 插件作者
    pub author: String,
    /// 依赖的插件
    pub dependencies: Vec<PluginDependency>,
    /// 最小框架版本要求
    pub min_framework_version: Version,
    /// 插件标签
    pub tags: Vec<String>,
}

impl PluginMetadata {
    /// 以新生成的ID创建元数据
    pub fn new(name: &str, version: Version) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            version,
            description: String::new(),
            author: String::new(),
            dependencies: Vec::new(),
            min_framework_version: Version::new(0, 1, 0),
            tags: Vec::new(),
        }
    }

    /// 添加依赖
    pub fn with_dependency(mut self, dependency: PluginDependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// 当前框架版本是否满足要求
    pub fn supports_framework(&self, framework: &Version) -> bool {
        *framework >= self.min_framework_version
    }
}

/// 插件依赖
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDependency {
    /// 依赖插件ID
    pub plugin_id: PluginId,
    /// 版本要求
    pub version_req: VersionReq,
    /// 是否为可选依赖
    pub optional: bool,
}

impl PluginDependency {
    pub fn required(plugin_id: PluginId, version_req: VersionReq) -> Self {
        Self {
            plugin_id,
            version_req,
            optional: false,
        }
    }

    pub fn optional(plugin_id: PluginId, version_req: VersionReq) -> Self {
        Self {
            plugin_id,
            version_req,
            optional: true,
        }
    }
}
