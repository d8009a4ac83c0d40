//! 键值存储
//!
//! 脚本侧的 `Storage` 静态类。键在宿主侧加上配置的前缀保存，
//! 配置了持久化路径时每次修改后整体写回 JSON 文件。

use crate::bindings::marshal::expect_string;
use crate::bindings::ForeignRegistry;
use crate::config::StorageConfig;
use crate::core::error::{BindingResult, BridgeError, BridgeResult};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

struct StorageState {
    prefix: String,
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

/// 存储服务
#[derive(Clone)]
pub struct StorageService {
    state: Rc<RefCell<StorageState>>,
}

impl StorageService {
    pub fn new(config: &StorageConfig) -> BridgeResult<Self> {
        let entries = match &config.path {
            Some(path) if path.exists() => {
                let content = fs::read_to_string(path)?;
                let entries: BTreeMap<String, String> = serde_json::from_str(&content)
                    .map_err(|e| BridgeError::General(format!("invalid storage file {:?}: {}", path, e)))?;
                tracing::info!(target: "bridge", "Loaded {} storage entries from {:?}", entries.len(), path);
                entries
            }
            _ => BTreeMap::new(),
        };

        Ok(Self {
            state: Rc::new(RefCell::new(StorageState {
                prefix: config.key_prefix.clone(),
                path: config.path.clone(),
                entries,
            })),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.state.borrow().prefix, key)
    }

    pub fn contains(&self, key: &str) -> bool {
        let key = self.full_key(key);
        self.state.borrow().entries.contains_key(&key)
    }

    pub fn load(&self, key: &str) -> Option<String> {
        let key = self.full_key(key);
        self.state.borrow().entries.get(&key).cloned()
    }

    pub fn save(&self, key: &str, value: &str) -> BridgeResult<()> {
        let key = self.full_key(key);
        self.state.borrow_mut().entries.insert(key, value.to_string());
        self.persist()
    }

    pub fn delete(&self, key: &str) -> BridgeResult<bool> {
        let key = self.full_key(key);
        let removed = self.state.borrow_mut().entries.remove(&key).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.state.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn persist(&self) -> BridgeResult<()> {
        let state = self.state.borrow();
        let Some(path) = &state.path else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(&state.entries)
            .map_err(|e| BridgeError::General(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn register(&self, registry: &mut ForeignRegistry, module: &str) -> BindingResult<()> {
        let storage = self.clone();
        registry.register_method(module, "Storage", true, "contains(_)", move |vm| {
            let key = expect_string(vm, 1, "key")?;
            vm.set_slot_bool(0, storage.contains(&key))?;
            Ok(())
        })?;

        let storage = self.clone();
        registry.register_method(module, "Storage", true, "load_(_)", move |vm| {
            let key = expect_string(vm, 1, "key")?;
            match storage.load(&key) {
                Some(value) => vm.set_slot_string(0, &value)?,
                None => vm.set_slot_null(0)?,
            }
            Ok(())
        })?;

        let storage = self.clone();
        registry.register_method(module, "Storage", true, "save_(_,_)", move |vm| {
            let key = expect_string(vm, 1, "key")?;
            let value = expect_string(vm, 2, "value")?;
            storage.save(&key, &value)?;
            vm.set_slot_null(0)?;
            Ok(())
        })?;

        let storage = self.clone();
        registry.register_method(module, "Storage", true, "delete(_)", move |vm| {
            let key = expect_string(vm, 1, "key")?;
            let removed = storage.delete(&key)?;
            vm.set_slot_bool(0, removed)?;
            Ok(())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_keys_in_memory() {
        let storage = StorageService::new(&StorageConfig::default()).unwrap();
        assert!(!storage.contains("score"));
        storage.save("score", "10").unwrap();
        assert_eq!(storage.load("score"), Some("10".to_string()));
        assert_eq!(storage.state.borrow().entries.keys().next().unwrap(), "sock_score");
        assert!(storage.delete("score").unwrap());
        assert!(!storage.delete("score").unwrap());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_persisted_to_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            key_prefix: "test_".to_string(),
            path: Some(dir.path().join("save").join("storage.json")),
        };

        let storage = StorageService::new(&config).unwrap();
        storage.save("level", "3").unwrap();
        drop(storage);

        let reloaded = StorageService::new(&config).unwrap();
        assert_eq!(reloaded.load("level"), Some("3".to_string()));
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.json");
        fs::write(&path, "not json").unwrap();
        let config = StorageConfig {
            path: Some(path),
            ..Default::default()
        };
        assert!(matches!(StorageService::new(&config), Err(BridgeError::General(_))));
    }
}
