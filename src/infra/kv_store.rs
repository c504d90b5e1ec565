//! 本地键值存储抽象
//!
//! 限流快照、尝试记录等咨询性数据都落在这里。所有实现都是同步但可失败的，
//! 调用方在边界处捕获错误并按缓存未命中处理。多个客户端并发写同一个键时
//! 采用最后写入者胜出，不加锁。

use crate::error::{LinkError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 键值存储接口
pub trait KeyValueStore: Send + Sync {
    /// 读取键，不存在返回 `Ok(None)`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// 写入键
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// 删除键（不存在时不报错）
    fn remove(&self, key: &str) -> Result<()>;

    /// 列出指定前缀的所有键
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// 共享存储句柄
pub type SharedStore = Arc<dyn KeyValueStore>;

/// 内存存储
///
/// 可选字节配额，超出时返回 [`LinkError::QuotaExceeded`]，行为与浏览器存储满时一致。
pub struct MemoryStore {
    entries: DashMap<String, String>,
    /// 字节配额（key + value 长度之和），None 表示不限
    quota_bytes: Option<usize>,
    used_bytes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            quota_bytes: None,
            used_bytes: AtomicUsize::new(0),
        }
    }

    /// 创建带字节配额的内存存储
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let new_size = key.len() + value.len();
        let old_size = self
            .entries
            .get(key)
            .map(|v| key.len() + v.value().len())
            .unwrap_or(0);

        if let Some(quota) = self.quota_bytes {
            let projected = self.used_bytes.load(Ordering::Relaxed) - old_size + new_size;
            if projected > quota {
                return Err(LinkError::QuotaExceeded(format!(
                    "writing {} needs {} bytes, quota is {}",
                    key, projected, quota
                )));
            }
        }

        self.entries.insert(key.to_string(), value.to_string());
        self.used_bytes.fetch_sub(old_size, Ordering::Relaxed);
        self.used_bytes.fetch_add(new_size, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if let Some((k, v)) = self.entries.remove(key) {
            self.used_bytes.fetch_sub(k.len() + v.len(), Ordering::Relaxed);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// JSON 文件存储
///
/// 整个存储保存为一个 JSON 对象，每次写入先写临时文件再 rename。
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// 打开（或创建）文件存储。文件内容损坏时从空存储开始。
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<BTreeMap<String, String>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("⚠️ 存储文件已损坏，重新初始化: path={:?}, error={}", path, e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!("Opened file store at: {:?} ({} keys)", path, entries.len());

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let content = serde_json::to_string_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Sled 嵌入式数据库存储
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!("Opened Sled database at: {:?}", path.as_ref());
        Ok(Self { db })
    }

    /// 临时数据库（进程退出后删除）
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match self.db.get(key)? {
            Some(value) => {
                let text = String::from_utf8(value.to_vec())
                    .map_err(|e| LinkError::Storage(format!("non-utf8 value for {}: {}", key, e)))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.db.insert(key, value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.db.remove(key)?.is_some() {
            debug!("Removed key {} from Sled", key);
        }
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }
}
