//! 服务端限流头同步
//!
//! 解析 `X-RateLimit-*` / `Retry-After` 响应头，按接口持久化权威配额快照。
//! 快照是咨询性数据：写失败只记日志，读到损坏或过期的数据按不存在处理。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::LinkError;
use crate::infra::clock::{system_clock, SharedClock};
use crate::infra::kv_store::SharedStore;
use crate::infra::metrics;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// 持久化键前缀
pub const QUOTA_KEY_PREFIX: &str = "rate_limit_info_";
/// 全局作用域的键后缀
const GLOBAL_SCOPE: &str = "global";
/// 快照有效期：1 小时
pub const QUOTA_TTL_MS: i64 = 60 * 60 * 1000;

/// 配额作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuotaScope {
    /// 未关联具体接口
    Global,
    /// 按接口路径区分
    Endpoint(String),
}

impl QuotaScope {
    /// 根据请求 URL 推导作用域（只取 path，忽略查询串）
    pub fn from_url(url: Option<&str>) -> Self {
        match url.map(str::trim).filter(|u| !u.is_empty()) {
            None => QuotaScope::Global,
            Some(raw) => {
                let endpoint = match url::Url::parse(raw) {
                    Ok(parsed) => parsed.path().to_string(),
                    Err(_) => raw
                        .split(['?', '#'])
                        .next()
                        .unwrap_or(raw)
                        .to_string(),
                };
                QuotaScope::Endpoint(endpoint)
            }
        }
    }

    /// 本地存储键：`rate_limit_info_<endpoint|global>`
    pub fn storage_key(&self) -> String {
        match self {
            QuotaScope::Global => format!("{}{}", QUOTA_KEY_PREFIX, GLOBAL_SCOPE),
            QuotaScope::Endpoint(endpoint) => format!("{}{}", QUOTA_KEY_PREFIX, endpoint),
        }
    }
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Global => write!(f, "{}", GLOBAL_SCOPE),
            QuotaScope::Endpoint(endpoint) => write!(f, "{}", endpoint),
        }
    }
}

/// 服务端下发的权威配额
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitQuota {
    pub limit: u32,
    pub remaining: u32,
    /// 重置时间（Unix 秒）
    pub reset: i64,
    /// 相对等待秒数
    pub retry_after: Option<u64>,
    pub scope: QuotaScope,
}

impl RateLimitQuota {
    /// 重置时间（Unix 毫秒）
    pub fn reset_at_ms(&self) -> i64 {
        self.reset.saturating_mul(1000)
    }

    /// 配额是否已用尽
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }

    /// 从 `now_ms` 起还需等待的毫秒数；Retry-After 优先
    pub fn wait_ms(&self, now_ms: i64) -> i64 {
        match self.retry_after {
            Some(secs) => i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000),
            None => (self.reset_at_ms() - now_ms).max(0),
        }
    }
}

/// 落盘格式：`{limit, remaining, reset, retryAfter?, updatedAt}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredQuota {
    limit: u32,
    remaining: u32,
    reset: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    updated_at: i64,
}

/// 限流头同步器
pub struct RateLimitHeaderSync {
    store: SharedStore,
    clock: SharedClock,
}

impl RateLimitHeaderSync {
    pub fn new(store: SharedStore) -> Self {
        Self::with_clock(store, system_clock())
    }

    pub fn with_clock(store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// 解析响应头（名称大小写不敏感）
    ///
    /// limit / remaining 缺失或不是整数时返回 None；reset 与 Retry-After 都无法解析时返回 None；
    /// reset 无效但 Retry-After 有效时 `reset = now + retryAfter`。
    pub fn parse<I, K, V>(&self, headers: I, url: Option<&str>) -> Option<RateLimitQuota>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let headers: HashMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.as_ref().trim().to_ascii_lowercase(), v.as_ref().trim().to_string()))
            .collect();

        let limit = match headers.get(HEADER_LIMIT).map(|v| v.parse::<u32>()) {
            Some(Ok(limit)) => limit,
            Some(Err(e)) => {
                debug!("无效的 {} 头: {}", HEADER_LIMIT, e);
                return None;
            }
            None => return None,
        };
        let remaining = match headers.get(HEADER_REMAINING).map(|v| v.parse::<u32>()) {
            Some(Ok(remaining)) => remaining,
            Some(Err(e)) => {
                debug!("无效的 {} 头: {}", HEADER_REMAINING, e);
                return None;
            }
            None => return None,
        };

        let retry_after = headers
            .get(HEADER_RETRY_AFTER)
            .and_then(|v| v.parse::<u64>().ok());
        let reset = headers
            .get(HEADER_RESET)
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|r| *r >= 0);

        let reset = match (reset, retry_after) {
            (Some(reset), _) => reset,
            (None, Some(secs)) => self
                .clock
                .now_secs()
                .saturating_add(i64::try_from(secs).unwrap_or(i64::MAX)),
            (None, None) => {
                debug!("缺少有效的 {} / {} 头", HEADER_RESET, HEADER_RETRY_AFTER);
                return None;
            }
        };

        Some(RateLimitQuota {
            limit,
            remaining,
            reset,
            retry_after,
            scope: QuotaScope::from_url(url),
        })
    }

    /// 解析 HTTP 响应头表
    pub fn parse_header_map(
        &self,
        headers: &reqwest::header::HeaderMap,
        url: Option<&str>,
    ) -> Option<RateLimitQuota> {
        let pairs = headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v)));
        self.parse(pairs, url)
    }

    /// 持久化配额快照，失败只记录日志
    pub fn persist(&self, quota: &RateLimitQuota) {
        let key = quota.scope.storage_key();
        let stored = StoredQuota {
            limit: quota.limit,
            remaining: quota.remaining,
            reset: quota.reset,
            retry_after: quota.retry_after,
            updated_at: self.clock.now_ms(),
        };

        let result = serde_json::to_string(&stored)
            .map_err(LinkError::from)
            .and_then(|raw| self.store.set(&key, &raw));

        match result {
            Ok(()) => debug!(
                "配额快照已保存: scope={}, remaining={}/{}",
                quota.scope, quota.remaining, quota.limit
            ),
            Err(e) => {
                metrics::record_quota_persist_failure();
                warn!("⚠️ 保存配额快照失败: key={}, error={}", key, e);
            }
        }
    }

    /// 读取配额快照；过期（超过 1 小时）或损坏的快照会被删除并返回 None
    pub fn retrieve(&self, url: Option<&str>) -> Option<RateLimitQuota> {
        let scope = QuotaScope::from_url(url);
        let key = scope.storage_key();

        let raw = match self.store.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("⚠️ 读取配额快照失败: key={}, error={}", key, e);
                return None;
            }
        };

        let stored = match serde_json::from_str::<StoredQuota>(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("⚠️ 配额快照格式错误，已清除: key={}, error={}", key, e);
                self.remove_key(&key);
                return None;
            }
        };

        if self.clock.now_ms() - stored.updated_at > QUOTA_TTL_MS {
            debug!("配额快照已过期，清除: key={}", key);
            self.remove_key(&key);
            return None;
        }

        Some(RateLimitQuota {
            limit: stored.limit,
            remaining: stored.remaining,
            reset: stored.reset,
            retry_after: stored.retry_after,
            scope,
        })
    }

    /// 解析并保存，返回解析结果
    pub fn sync<I, K, V>(&self, headers: I, url: Option<&str>) -> Option<RateLimitQuota>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let quota = self.parse(headers, url)?;
        self.persist(&quota);
        Some(quota)
    }

    /// 解析并保存 HTTP 响应头表
    pub fn sync_header_map(
        &self,
        headers: &reqwest::header::HeaderMap,
        url: Option<&str>,
    ) -> Option<RateLimitQuota> {
        let quota = self.parse_header_map(headers, url)?;
        self.persist(&quota);
        Some(quota)
    }

    /// 删除指定接口的快照
    pub fn clear(&self, url: Option<&str>) {
        self.remove_key(&QuotaScope::from_url(url).storage_key());
    }

    /// 列出所有已保存快照的作用域
    pub fn scopes(&self) -> Vec<String> {
        match self.store.keys_with_prefix(QUOTA_KEY_PREFIX) {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(QUOTA_KEY_PREFIX).map(str::to_string))
                .collect(),
            Err(e) => {
                warn!("⚠️ 列出配额快照失败: error={}", e);
                Vec::new()
            }
        }
    }

    fn remove_key(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!("⚠️ 删除配额快照失败: key={}, error={}", key, e);
        }
    }
}
