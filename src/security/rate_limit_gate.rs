//! 本地估算与服务端权威配额的合并判断
//!
//! 服务端快照新鲜且已用尽（remaining == 0 且重置时间未到，或带有 Retry-After）时，
//! 无论本地计数如何都判定为限流；其余情况使用本地滑动窗口的结果。

use std::sync::Arc;

use tracing::debug;

use crate::error::{LinkError, Result};
use crate::infra::clock::SharedClock;
use crate::infra::metrics;

use super::header_sync::{RateLimitHeaderSync, RateLimitQuota};
use super::rate_limiter::{throttle_message, RateLimitConfig, RateLimitStatus, RateLimiter};

/// 合并后的限流判断来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSource {
    /// 本地滑动窗口估算
    Local,
    /// 服务端权威配额
    Server,
}

/// 合并后的限流状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateStatus {
    pub status: RateLimitStatus,
    pub source: StatusSource,
    /// 当时可用的服务端配额
    pub quota: Option<RateLimitQuota>,
}

/// 限流闸门
pub struct RateLimitGate {
    limiter: Arc<RateLimiter>,
    header_sync: Arc<RateLimitHeaderSync>,
    clock: SharedClock,
}

impl RateLimitGate {
    pub fn new(
        limiter: Arc<RateLimiter>,
        header_sync: Arc<RateLimitHeaderSync>,
        clock: SharedClock,
    ) -> Self {
        Self {
            limiter,
            header_sync,
            clock,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn header_sync(&self) -> &Arc<RateLimitHeaderSync> {
        &self.header_sync
    }

    /// 查询合并状态（不记录尝试）
    pub fn check(&self, action: &str, identifier: Option<&str>, endpoint: Option<&str>) -> GateStatus {
        let config = self.limiter.config_for(action);
        self.check_with(action, identifier, endpoint, &config)
    }

    pub fn check_with(
        &self,
        action: &str,
        identifier: Option<&str>,
        endpoint: Option<&str>,
        config: &RateLimitConfig,
    ) -> GateStatus {
        let local = self.limiter.get_status(action, identifier, Some(config));
        let quota = endpoint.and_then(|url| self.header_sync.retrieve(Some(url)));
        let now = self.clock.now_ms();

        if let Some(blocking) = quota.as_ref().filter(|q| Self::server_blocks(q, now)) {
            let reset_time = now + blocking.wait_ms(now);
            debug!(
                "服务端配额已用尽: action={}, scope={}, reset_time={}",
                action, blocking.scope, reset_time
            );
            return GateStatus {
                status: RateLimitStatus {
                    allowed: false,
                    remaining: 0,
                    reset_time: reset_time.max(local.reset_time),
                    message: Some(throttle_message(reset_time - now)),
                },
                source: StatusSource::Server,
                quota: Some(blocking.clone()),
            };
        }

        // 服务端剩余次数更少时以服务端为准
        let status = match quota.as_ref() {
            Some(q) if local.allowed && q.remaining < local.remaining => RateLimitStatus {
                remaining: q.remaining,
                ..local
            },
            _ => local,
        };

        GateStatus {
            status,
            source: StatusSource::Local,
            quota,
        }
    }

    /// 检查并记录一次尝试；被限流时返回 [`LinkError::RateLimited`]
    pub fn attempt(
        &self,
        action: &str,
        identifier: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<GateStatus> {
        let config = self.limiter.config_for(action);
        let before = self.check_with(action, identifier, endpoint, &config);
        if !before.status.allowed {
            metrics::record_rate_limited(action);
            let message = before
                .status
                .message
                .clone()
                .unwrap_or_else(|| throttle_message(0));
            return Err(LinkError::RateLimited(message));
        }

        self.limiter.record_attempt(action, identifier, Some(&config));
        Ok(self.check_with(action, identifier, endpoint, &config))
    }

    fn server_blocks(quota: &RateLimitQuota, now_ms: i64) -> bool {
        if !quota.is_exhausted() {
            return false;
        }
        quota.retry_after.is_some_and(|secs| secs > 0) || quota.reset_at_ms() > now_ms
    }
}
