//! 持久化键值存储
//!
//! 脚本经 `host.persistent` 保存的数据。每个条目有稳定的 `entry_id`，
//! 一个字符串值和 7 个整数槽；整个存储以 JSON 保存。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// 条目的整数槽个数
pub const PERSISTENT_INTS: usize = 7;

/// 持久化错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    #[error("Persistent store I/O error: {0}")]
    Io(String),
    #[error("Persistent store format error: {0}")]
    Json(String),
}

/// 一个条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentEntry {
    pub entry_id: i64,
    pub key: String,
    pub value: String,
    pub ints: [i32; PERSISTENT_INTS],
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    next_id: i64,
    entries: Vec<PersistentEntry>,
}

/// 按键排序的条目集合
#[derive(Debug, Clone, Default)]
pub struct PersistentStore {
    entries: BTreeMap<String, PersistentEntry>,
    next_id: i64,
    dirty: bool,
}

impl PersistentStore {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 1,
            dirty: false,
        }
    }

    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        let content = fs::read_to_string(path)
            .map_err(|e| PersistenceError::Io(format!("{}: {}", path.display(), e)))?;
        let file: StoreFile = serde_json::from_str(&content)
            .map_err(|e| PersistenceError::Json(format!("{}: {}", path.display(), e)))?;
        let max_id = file.entries.iter().map(|e| e.entry_id).max().unwrap_or(0);
        let entries = file
            .entries
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect();
        tracing::debug!(target: "script", "Loaded persistent store from {}", path.display());
        Ok(Self {
            entries,
            next_id: file.next_id.max(max_id + 1),
            dirty: false,
        })
    }

    pub fn save(&mut self, path: &Path) -> Result<(), PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| PersistenceError::Io(e.to_string()))?;
            }
        }
        let file = StoreFile {
            next_id: self.next_id,
            entries: self.entries.values().cloned().collect(),
        };
        let content =
            serde_json::to_string_pretty(&file).map_err(|e| PersistenceError::Json(e.to_string()))?;
        fs::write(path, content)
            .map_err(|e| PersistenceError::Io(format!("{}: {}", path.display(), e)))?;
        self.dirty = false;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PersistentEntry> {
        self.entries.get(key)
    }

    /// 键以 `prefix` 开头的全部条目；`None` 返回全部
    pub fn get_all(&self, prefix: Option<&str>) -> Vec<&PersistentEntry> {
        match prefix {
            None => self.entries.values().collect(),
            Some(prefix) => self
                .entries
                .range(prefix.to_string()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(_, entry)| entry)
                .collect(),
        }
    }

    /// 写入条目；已有条目保留原来的 `entry_id`
    ///
    /// `ints` 中未给出的槽保持原值（新条目为 -1）。
    pub fn save_entry(&mut self, key: &str, value: &str, ints: &[Option<i32>]) -> &PersistentEntry {
        self.dirty = true;
        let next_id = &mut self.next_id;
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            let entry_id = *next_id;
            *next_id += 1;
            PersistentEntry {
                entry_id,
                key: key.to_string(),
                value: String::new(),
                ints: [-1; PERSISTENT_INTS],
            }
        });
        entry.value = value.to_string();
        for (slot, new) in entry.ints.iter_mut().zip(ints) {
            if let Some(new) = new {
                *slot = *new;
            }
        }
        entry
    }

    pub fn delete(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        self.dirty |= removed;
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 上次保存后是否有修改
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}
