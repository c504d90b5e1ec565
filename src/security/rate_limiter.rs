/// 滑动窗口限流器
///
/// 核心特性：
/// 1. 按 (action, identifier) 维度记录尝试时间戳
/// 2. 只统计窗口内（`t > now - window`）的尝试，达到 `max_attempts` 即限流
/// 3. 内存缓存 + 可选的本地键值存储镜像，重启后限流状态不丢失
/// 4. 每次记录尝试有一定概率清扫全部过期记录，控制内存占用
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::infra::clock::{system_clock, SharedClock};
use crate::infra::kv_store::SharedStore;

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// 默认窗口：15 分钟
pub const DEFAULT_TIME_WINDOW_MS: u64 = 15 * 60 * 1000;
/// 默认清扫概率
pub const DEFAULT_SWEEP_PROBABILITY: f64 = 0.1;

/// 持久化尝试记录的键前缀
const ATTEMPTS_KEY_PREFIX: &str = "rate_limit_attempts_";

/// 限流配置
///
/// 反序列化时同时接受 `timeWindowMs`、`time_window_ms` 和旧字段名 `windowMs`，
/// 统一归一到 `time_window_ms`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// 窗口内允许的最大尝试次数
    #[serde(alias = "max_attempts")]
    pub max_attempts: u32,
    /// 窗口长度（毫秒）
    #[serde(alias = "windowMs", alias = "time_window_ms")]
    pub time_window_ms: u64,
}

impl RateLimitConfig {
    pub const fn new(max_attempts: u32, time_window_ms: u64) -> Self {
        Self {
            max_attempts,
            time_window_ms,
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.time_window_ms).unwrap_or(i64::MAX)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_TIME_WINDOW_MS)
    }
}

/// 单个 (action, identifier) 的尝试记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub key: String,
    pub identifier: Option<String>,
    /// 单调不减的尝试时间戳（毫秒）
    pub timestamps: Vec<i64>,
    /// 记录过的最大窗口，清扫时以此判断过期
    #[serde(default)]
    pub window_ms: i64,
}

impl RateLimitRecord {
    fn new(key: &str, identifier: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            identifier: identifier.map(str::to_string),
            timestamps: Vec::new(),
            window_ms: 0,
        }
    }

    /// 窗口内的尝试（`t > now - window`）
    fn in_window(&self, now: i64, window_ms: i64) -> impl Iterator<Item = &i64> {
        let cutoff = now.saturating_sub(window_ms);
        self.timestamps.iter().filter(move |&&t| t > cutoff)
    }

    fn count_in_window(&self, now: i64, window_ms: i64) -> usize {
        self.in_window(now, window_ms).count()
    }

    /// 记住查询或记录时用过的最大窗口，清扫不会丢掉其中的时间戳
    fn widen_window(&mut self, window_ms: i64) {
        self.window_ms = self.window_ms.max(window_ms);
    }

    /// 丢弃已过期的时间戳，返回丢弃数量
    fn prune(&mut self, now: i64) -> usize {
        let cutoff = now.saturating_sub(self.window_ms);
        let before = self.timestamps.len();
        self.timestamps.retain(|&t| t > cutoff);
        before - self.timestamps.len()
    }
}

/// 限流状态查询结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    /// 当前是否允许执行
    pub allowed: bool,
    /// 窗口内剩余次数
    pub remaining: u32,
    /// 最早一次窗口内尝试过期的时间（Unix 毫秒）；无记录时为当前时间
    pub reset_time: i64,
    /// 被限流时给用户的提示
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RateLimitStatus {
    /// 距离重置还需多少毫秒
    pub fn retry_after_ms(&self, now_ms: i64) -> i64 {
        (self.reset_time - now_ms).max(0)
    }
}

/// 组合键
///
/// 有 identifier 时为 `action:identifier`（空字符串 identifier 得到 `action:`），
/// 无 identifier 时为 `action`。空字符串与 None 是两个独立的桶。
pub fn composite_key(action: &str, identifier: Option<&str>) -> String {
    match identifier {
        Some(id) => format!("{}:{}", action, id),
        None => action.to_string(),
    }
}

/// 被限流时的提示文案
pub fn throttle_message(retry_after_ms: i64) -> String {
    let secs = (retry_after_ms + 999) / 1000;
    if secs <= 0 {
        "Too many attempts. Please try again later.".to_string()
    } else if secs == 1 {
        "Too many attempts. Please try again in 1 second.".to_string()
    } else if secs <= 60 {
        format!("Too many attempts. Please try again in {} seconds.", secs)
    } else {
        let minutes = (secs + 59) / 60;
        format!("Too many attempts. Please try again in {} minutes.", minutes)
    }
}

/// 滑动窗口限流器
///
/// 每个实例拥有独立的记录表，测试中可随意创建互不干扰的实例。
pub struct RateLimiter {
    records: Mutex<HashMap<String, RateLimitRecord>>,
    store: Option<SharedStore>,
    clock: SharedClock,
    default_config: RateLimitConfig,
    presets: HashMap<String, RateLimitConfig>,
    sweep_probability: f64,
}

impl RateLimiter {
    /// 纯内存限流器（系统时钟、默认配置）
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RateLimiterBuilder {
        RateLimiterBuilder::default()
    }

    /// 指定 action 的生效配置：预设优先，否则使用默认配置
    pub fn config_for(&self, action: &str) -> RateLimitConfig {
        self.presets
            .get(action)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// 当前是否被限流
    ///
    /// 窗口内尝试次数达到 `max_attempts`（含等于）即视为限流。
    pub fn is_limited(&self, action: &str, identifier: Option<&str>, config: &RateLimitConfig) -> bool {
        let key = composite_key(action, identifier);
        let now = self.clock.now_ms();
        let mut records = self.records.lock();
        let count = self
            .load_record(&mut records, &key)
            .map(|record| {
                record.widen_window(config.window_ms());
                record.count_in_window(now, config.window_ms())
            })
            .unwrap_or(0);

        let limited = count >= config.max_attempts as usize;
        if limited {
            debug!("限流命中: key={}, count={}, max={}", key, count, config.max_attempts);
        }
        limited
    }

    /// 记录一次尝试
    pub fn record_attempt(&self, action: &str, identifier: Option<&str>, config: Option<&RateLimitConfig>) {
        let config = config.copied().unwrap_or_else(|| self.config_for(action));
        let key = composite_key(action, identifier);
        let now = self.clock.now_ms();

        let mut records = self.records.lock();
        if self.load_record(&mut records, &key).is_none() {
            records.insert(key.clone(), RateLimitRecord::new(action, identifier));
        }

        if let Some(record) = records.get_mut(&key) {
            // 时间戳保持单调不减（时钟回拨时沿用上一次的时间）
            let ts = record.timestamps.last().map_or(now, |&last| last.max(now));
            record.timestamps.push(ts);
            record.widen_window(config.window_ms());
            self.persist_record(&key, record);
        }

        if self.sweep_probability > 0.0 && fastrand::f64() < self.sweep_probability {
            let removed = Self::sweep(&mut records, now);
            drop(records);
            if !removed.is_empty() {
                debug!("清扫过期限流记录: removed={}", removed.len());
                for key in &removed {
                    self.remove_persisted(key);
                }
            }
        }
    }

    /// 查询状态（不记录尝试）
    pub fn get_status(
        &self,
        action: &str,
        identifier: Option<&str>,
        config: Option<&RateLimitConfig>,
    ) -> RateLimitStatus {
        let config = config.copied().unwrap_or_else(|| self.config_for(action));
        let key = composite_key(action, identifier);
        let now = self.clock.now_ms();
        let window = config.window_ms();

        let mut records = self.records.lock();
        let (count, oldest) = match self.load_record(&mut records, &key) {
            Some(record) => {
                record.widen_window(window);
                let mut in_window = record.in_window(now, window);
                let oldest = in_window.next().copied();
                let count = oldest.map_or(0, |_| 1 + in_window.count());
                (count, oldest)
            }
            None => (0, None),
        };
        drop(records);

        let max = config.max_attempts as usize;
        let allowed = count < max;
        let remaining = max.saturating_sub(count) as u32;
        let reset_time = oldest.map_or(now, |t| t.saturating_add(window));
        let message = if allowed {
            None
        } else {
            Some(throttle_message(reset_time - now))
        };

        RateLimitStatus {
            allowed,
            remaining,
            reset_time,
            message,
        }
    }

    /// 清空指定 (action, identifier) 的全部记录
    pub fn reset(&self, action: &str, identifier: Option<&str>) {
        let key = composite_key(action, identifier);
        self.records.lock().remove(&key);
        self.remove_persisted(&key);
        debug!("重置限流记录: key={}", key);
    }

    /// 清空全部记录（测试清理用）
    pub fn reset_all(&self) {
        let keys: Vec<String> = self.records.lock().drain().map(|(k, _)| k).collect();
        for key in keys {
            self.remove_persisted(&key);
        }
    }

    /// 立即清扫所有过期记录，返回移除的记录数
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let removed = Self::sweep(&mut self.records.lock(), now);

        for key in &removed {
            self.remove_persisted(key);
        }
        removed.len()
    }

    /// 当前内存中跟踪的组合键
    pub fn tracked_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// 移除每条记录的过期时间戳并删除空记录，返回被删除记录的键
    fn sweep(records: &mut HashMap<String, RateLimitRecord>, now: i64) -> Vec<String> {
        let mut removed = Vec::new();
        records.retain(|key, record| {
            record.prune(now);
            if record.timestamps.is_empty() {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// 取内存记录；未命中时尝试从存储加载
    fn load_record<'a>(
        &self,
        records: &'a mut HashMap<String, RateLimitRecord>,
        key: &str,
    ) -> Option<&'a mut RateLimitRecord> {
        if !records.contains_key(key) {
            if let Some(record) = self.read_persisted(key) {
                records.insert(key.to_string(), record);
            }
        }
        records.get_mut(key)
    }

    fn read_persisted(&self, key: &str) -> Option<RateLimitRecord> {
        let store = self.store.as_ref()?;
        let storage_key = format!("{}{}", ATTEMPTS_KEY_PREFIX, key);
        match store.get(&storage_key) {
            Ok(Some(raw)) => match serde_json::from_str::<RateLimitRecord>(&raw) {
                Ok(mut record) => {
                    record.timestamps.sort_unstable();
                    Some(record)
                }
                Err(e) => {
                    warn!("⚠️ 限流记录已损坏，丢弃: key={}, error={}", storage_key, e);
                    let _ = store.remove(&storage_key);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("⚠️ 读取限流记录失败: key={}, error={}", storage_key, e);
                None
            }
        }
    }

    fn persist_record(&self, key: &str, record: &RateLimitRecord) {
        let Some(store) = &self.store else {
            return;
        };
        let storage_key = format!("{}{}", ATTEMPTS_KEY_PREFIX, key);
        let result = serde_json::to_string(record)
            .map_err(LinkError::from)
            .and_then(|raw| store.set(&storage_key, &raw));
        if let Err(e) = result {
            warn!("⚠️ 写入限流记录失败: key={}, error={}", storage_key, e);
        }
    }

    fn remove_persisted(&self, key: &str) {
        if let Some(store) = &self.store {
            let storage_key = format!("{}{}", ATTEMPTS_KEY_PREFIX, key);
            if let Err(e) = store.remove(&storage_key) {
                warn!("⚠️ 删除限流记录失败: key={}, error={}", storage_key, e);
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// 限流器构建器
pub struct RateLimiterBuilder {
    store: Option<SharedStore>,
    clock: SharedClock,
    default_config: RateLimitConfig,
    presets: HashMap<String, RateLimitConfig>,
    sweep_probability: f64,
}

impl Default for RateLimiterBuilder {
    fn default() -> Self {
        Self {
            store: None,
            clock: system_clock(),
            default_config: RateLimitConfig::default(),
            presets: HashMap::new(),
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
        }
    }
}

impl RateLimiterBuilder {
    /// 镜像尝试记录到本地存储
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_config(mut self, config: RateLimitConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn preset(mut self, action: impl Into<String>, config: RateLimitConfig) -> Self {
        self.presets.insert(action.into(), config);
        self
    }

    pub fn presets(mut self, presets: HashMap<String, RateLimitConfig>) -> Self {
        self.presets.extend(presets);
        self
    }

    /// 每次记录尝试触发清扫的概率（0.0 关闭，1.0 每次都清扫）
    pub fn sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = probability.clamp(0.0, 1.0);
        self
    }

    pub fn build(self) -> RateLimiter {
        RateLimiter {
            records: Mutex::new(HashMap::new()),
            store: self.store,
            clock: self.clock,
            default_config: self.default_config,
            presets: self.presets,
            sweep_probability: self.sweep_probability,
        }
    }
}

/// 常用操作的预设配置
pub fn default_presets() -> HashMap<String, RateLimitConfig> {
    const MINUTE: u64 = 60 * 1000;
    HashMap::from([
        ("login".to_string(), RateLimitConfig::new(5, 15 * MINUTE)),
        ("signup".to_string(), RateLimitConfig::new(3, 60 * MINUTE)),
        ("passwordReset".to_string(), RateLimitConfig::new(3, 60 * MINUTE)),
        ("passwordChange".to_string(), RateLimitConfig::new(5, 60 * MINUTE)),
        ("twoFactorVerify".to_string(), RateLimitConfig::new(5, 5 * MINUTE)),
        ("logoutAllDevices".to_string(), RateLimitConfig::new(3, 10 * MINUTE)),
    ])
}

/// 便于在多个组件间共享的限流器句柄
pub type SharedRateLimiter = Arc<RateLimiter>;
