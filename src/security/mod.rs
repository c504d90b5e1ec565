/// 限流模块
///
/// 提供客户端动作节流能力：
/// - 滑动窗口限流（按 action + identifier 隔离）
/// - 服务端 `X-RateLimit-*` 响应头解析与配额快照持久化
/// - 本地估算与服务端权威配额的合并判断
///
/// 所有数据都是咨询性的，只用于提示用户稍后重试，从不作为安全判定依据。
pub mod header_sync;
pub mod rate_limit_gate;
pub mod rate_limiter;

pub use header_sync::{QuotaScope, RateLimitHeaderSync, RateLimitQuota, QUOTA_TTL_MS};
pub use rate_limit_gate::{GateStatus, RateLimitGate, StatusSource};
pub use rate_limiter::{
    composite_key, default_presets, RateLimitConfig, RateLimitRecord, RateLimitStatus,
    RateLimiter, RateLimiterBuilder, SharedRateLimiter,
};
