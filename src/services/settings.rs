//! 设置系统
//!
//! 设置项以点分路径为键、JSON 值存储。修改先暂存为脏值并触发 `setting_changing`，
//! `apply_changes` 提交后触发 `setting_changed`；删除触发 `setting_deleted`。
//! 事件在修改调用内按订阅顺序同步派发，订阅者位于其他线程时推迟到该线程。

use crate::core::event::Event;
use crate::{FoundryError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// 设置值
pub type SettingValue = JsonValue;

/// 设置键（点分路径，如 `video.resolution`）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SettingKey(String);

impl SettingKey {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SettingKey {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// 设置变更
#[derive(Debug, Clone, PartialEq)]
pub struct SettingChange {
    pub key: SettingKey,
    pub old_value: SettingValue,
    pub new_value: SettingValue,
}

struct SettingEntry {
    value: SettingValue,
    default: SettingValue,
    dirty: Option<SettingValue>,
}

/// 设置注册表
pub struct Settings {
    entries: Mutex<BTreeMap<SettingKey, SettingEntry>>,
    setting_changing: Event<SettingChange>,
    setting_changed: Event<SettingChange>,
    setting_deleted: Event<SettingKey>,
}

impl Settings {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            setting_changing: Event::new(),
            setting_changed: Event::new(),
            setting_deleted: Event::new(),
        }
    }

    /// 暂存修改时触发
    pub fn setting_changing(&self) -> &Event<SettingChange> {
        &self.setting_changing
    }

    /// 提交修改后触发
    pub fn setting_changed(&self) -> &Event<SettingChange> {
        &self.setting_changed
    }

    /// 删除设置后触发
    pub fn setting_deleted(&self) -> &Event<SettingKey> {
        &self.setting_deleted
    }

    /// 注册设置项及其默认值
    pub fn register<T: Serialize>(&self, key: impl Into<SettingKey>, default: T) -> Result<()> {
        let key = key.into();
        let default = serde_json::to_value(default)?;
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(FoundryError::SettingAlreadyRegistered { key: key.to_string() });
        }
        debug!(setting = %key, "Setting registered");
        entries.insert(
            key,
            SettingEntry {
                value: default.clone(),
                default,
                dirty: None,
            },
        );
        Ok(())
    }

    /// 读取已提交的值
    pub fn value<T: DeserializeOwned>(&self, key: impl Into<SettingKey>) -> Result<T> {
        let key = key.into();
        let raw = self.raw_value(&key)?;
        serde_json::from_value(raw).map_err(|_| FoundryError::SettingTypeMismatch {
            key: key.to_string(),
            expected: std::any::type_name::<T>().to_string(),
        })
    }

    /// 读取已提交的原始值
    pub fn raw_value(&self, key: &SettingKey) -> Result<SettingValue> {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.value.clone())
            .ok_or_else(|| FoundryError::SettingNotFound { key: key.to_string() })
    }

    /// 读取默认值
    pub fn default_value(&self, key: &SettingKey) -> Result<SettingValue> {
        self.entries
            .lock()
            .get(key)
            .map(|entry| entry.default.clone())
            .ok_or_else(|| FoundryError::SettingNotFound { key: key.to_string() })
    }

    /// 暂存修改并触发 `setting_changing`，返回是否产生了修改；值类型必须与当前值一致
    pub fn change_value<T: Serialize>(&self, key: impl Into<SettingKey>, value: T) -> Result<bool> {
        let key = key.into();
        let new_value = serde_json::to_value(value)?;
        let change = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&key)
                .ok_or_else(|| FoundryError::SettingNotFound { key: key.to_string() })?;
            if !same_kind(&entry.value, &new_value) {
                return Err(FoundryError::SettingTypeMismatch {
                    key: key.to_string(),
                    expected: kind_name(&entry.value).to_string(),
                });
            }
            let pending = entry.dirty.as_ref().unwrap_or(&entry.value);
            if *pending == new_value {
                return Ok(false);
            }
            entry.dirty = if new_value == entry.value {
                None
            } else {
                Some(new_value.clone())
            };
            SettingChange {
                key,
                old_value: entry.value.clone(),
                new_value,
            }
        };
        self.setting_changing.trigger(change);
        Ok(true)
    }

    /// 恢复默认值（暂存）
    pub fn reset_to_default(&self, key: impl Into<SettingKey>) -> Result<bool> {
        let key = key.into();
        let default = self.default_value(&key)?;
        self.change_value(key, default)
    }

    /// 提交所有暂存修改，按键顺序触发 `setting_changed`，返回提交数量
    pub fn apply_changes(&self) -> usize {
        let changes: Vec<SettingChange> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter_map(|(key, entry)| {
                    let new_value = entry.dirty.take()?;
                    let old_value = std::mem::replace(&mut entry.value, new_value.clone());
                    Some(SettingChange {
                        key: key.clone(),
                        old_value,
                        new_value,
                    })
                })
                .collect()
        };
        let applied = changes.len();
        for change in changes {
            self.setting_changed.trigger(change);
        }
        if applied > 0 {
            debug!(applied, "Setting changes applied");
        }
        applied
    }

    /// 丢弃所有暂存修改，返回丢弃数量
    pub fn discard_changes(&self) -> usize {
        let mut entries = self.entries.lock();
        entries
            .values_mut()
            .filter_map(|entry| entry.dirty.take())
            .count()
    }

    /// 删除设置项并触发 `setting_deleted`
    pub fn delete(&self, key: impl Into<SettingKey>) -> Result<()> {
        let key = key.into();
        if self.entries.lock().remove(&key).is_none() {
            return Err(FoundryError::SettingNotFound { key: key.to_string() });
        }
        debug!(setting = %key, "Setting deleted");
        self.setting_deleted.trigger(key);
        Ok(())
    }

    pub fn keys(&self) -> Vec<SettingKey> {
        self.entries.lock().keys().cloned().collect()
    }

    /// 是否存在未提交的修改
    pub fn dirty(&self) -> bool {
        self.entries.lock().values().any(|entry| entry.dirty.is_some())
    }

    pub fn is_dirty(&self, key: &SettingKey) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.dirty.is_some())
    }

    /// 导出已提交的值为 TOML（键为点分路径）
    pub fn export_toml(&self) -> Result<String> {
        let snapshot: BTreeMap<String, SettingValue> = self
            .entries
            .lock()
            .iter()
            .map(|(key, entry)| (key.to_string(), entry.value.clone()))
            .collect();
        Ok(toml::to_string(&snapshot)?)
    }

    /// 从 TOML 导入为暂存修改，未注册的键被跳过；返回暂存数量
    pub fn import_toml(&self, content: &str) -> Result<usize> {
        let values: BTreeMap<String, SettingValue> = toml::from_str(content)?;
        let mut staged = 0;
        for (path, value) in values {
            let key = SettingKey::new(path);
            match self.change_value(key.clone(), value) {
                Ok(true) => staged += 1,
                Ok(false) => {}
                Err(FoundryError::SettingNotFound { .. }) => {
                    warn!(setting = %key, "Skipping unknown setting on import");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(staged)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("entries", &self.entries.lock().len())
            .field("dirty", &self.dirty())
            .finish()
    }
}

fn same_kind(a: &JsonValue, b: &JsonValue) -> bool {
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn kind_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings() -> Settings {
        let settings = Settings::new();
        settings.register("video.width", 1280).unwrap();
        settings.register("video.fullscreen", false).unwrap();
        settings.register("audio.device", "default").unwrap();
        settings
    }

    #[test]
    fn test_register_and_read() {
        let settings = settings();
        assert_eq!(settings.value::<u32>("video.width").unwrap(), 1280);
        assert!(matches!(
            settings.register("video.width", 1),
            Err(FoundryError::SettingAlreadyRegistered { .. })
        ));
        assert!(matches!(
            settings.value::<u32>("missing"),
            Err(FoundryError::SettingNotFound { .. })
        ));
        assert!(matches!(
            settings.value::<String>("video.width"),
            Err(FoundryError::SettingTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_change_is_staged_until_applied() {
        let settings = settings();
        let changing = Arc::new(Mutex::new(Vec::new()));
        let changed = Arc::new(Mutex::new(Vec::new()));
        let changing_clone = Arc::clone(&changing);
        let changed_clone = Arc::clone(&changed);
        let _a = settings
            .setting_changing()
            .subscribe(move |change: &SettingChange| changing_clone.lock().push(change.clone()));
        let _b = settings
            .setting_changed()
            .subscribe(move |change: &SettingChange| changed_clone.lock().push(change.clone()));

        settings.change_value("video.width", 1920).unwrap();
        assert_eq!(changing.lock().len(), 1);
        assert!(changed.lock().is_empty());
        assert_eq!(settings.value::<u32>("video.width").unwrap(), 1280);
        assert!(settings.is_dirty(&SettingKey::from("video.width")));

        assert_eq!(settings.apply_changes(), 1);
        assert_eq!(settings.value::<u32>("video.width").unwrap(), 1920);
        let applied = changed.lock();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].old_value, JsonValue::from(1280));
        assert_eq!(applied[0].new_value, JsonValue::from(1920));
        assert!(!settings.dirty());
    }

    #[test]
    fn test_discard_and_type_check() {
        let settings = settings();
        settings.change_value("video.fullscreen", true).unwrap();
        assert!(matches!(
            settings.change_value("video.fullscreen", "yes"),
            Err(FoundryError::SettingTypeMismatch { .. })
        ));
        assert_eq!(settings.discard_changes(), 1);
        assert_eq!(settings.apply_changes(), 0);
        assert!(!settings.value::<bool>("video.fullscreen").unwrap());
    }

    #[test]
    fn test_delete_fires_event() {
        let settings = settings();
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let deleted_clone = Arc::clone(&deleted);
        let _sub = settings
            .setting_deleted()
            .subscribe(move |key: &SettingKey| deleted_clone.lock().push(key.clone()));

        settings.delete("audio.device").unwrap();
        assert_eq!(*deleted.lock(), vec![SettingKey::from("audio.device")]);
        assert!(settings.delete("audio.device").is_err());
        assert_eq!(settings.keys().len(), 2);
    }

    #[test]
    fn test_toml_export_import() {
        let source = settings();
        source.change_value("audio.device", "usb").unwrap();
        source.apply_changes();
        let exported = source.export_toml().unwrap();

        let target = settings();
        let staged = target.import_toml(&exported).unwrap();
        assert_eq!(staged, 1);
        target.apply_changes();
        assert_eq!(target.value::<String>("audio.device").unwrap(), "usb");
    }

    #[test]
    fn test_reset_to_default() {
        let settings = settings();
        settings.change_value("video.width", 800).unwrap();
        settings.apply_changes();
        settings.reset_to_default("video.width").unwrap();
        settings.apply_changes();
        assert_eq!(settings.value::<u32>("video.width").unwrap(), 1280);
    }
}
