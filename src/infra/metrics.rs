//! Prometheus 指标：连接状态、重连次数、限流命中、会话撤销等
//!
//! 未安装 Recorder 时所有记录函数都是空操作；CLI 通过 `--metrics-port` 调用 `init()`
//! 启动内置 HTTP 抓取端点。

use std::net::SocketAddr;
use std::sync::OnceLock;

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// 指标名称
const COUNTER_CONNECTIONS_OPENED: &str = "authlink_connections_opened_total";
const COUNTER_CONNECTIONS_CLOSED: &str = "authlink_connections_closed_total";
const COUNTER_RECONNECT_ATTEMPTS: &str = "authlink_reconnect_attempts_total";
const GAUGE_CHANNEL_STATE: &str = "authlink_channel_state";
const COUNTER_FRAMES_DROPPED: &str = "authlink_frames_dropped_total";
const COUNTER_RATE_LIMITED: &str = "authlink_rate_limited_total";
const COUNTER_QUOTA_PERSIST_FAIL: &str = "authlink_quota_persist_fail_total";
const COUNTER_SESSIONS_REVOKED: &str = "authlink_sessions_revoked_total";
const COUNTER_POLLS: &str = "authlink_fallback_polls_total";

/// 安装 Prometheus Recorder 并在 `addr` 上暴露 `/metrics`。
/// 仅需在进程内调用一次；重复调用会返回 Err。
pub fn init(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if INSTALLED.get().is_some() {
        return Err("metrics already initialized".into());
    }
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    INSTALLED.set(addr).map_err(|_| "metrics already initialized")?;
    Ok(())
}

/// 是否已初始化
pub fn is_initialized() -> bool {
    INSTALLED.get().is_some()
}

/// 通道建立成功 +1
pub fn record_connection_opened(channel: &'static str) {
    metrics::counter!(COUNTER_CONNECTIONS_OPENED, "channel" => channel).increment(1);
}

/// 通道关闭 +1（按关闭码分类）
pub fn record_connection_closed(channel: &'static str, close_class: &'static str) {
    metrics::counter!(COUNTER_CONNECTIONS_CLOSED, "channel" => channel, "class" => close_class)
        .increment(1);
}

/// 重连尝试 +1
pub fn record_reconnect_attempt(channel: &'static str) {
    metrics::counter!(COUNTER_RECONNECT_ATTEMPTS, "channel" => channel).increment(1);
}

/// 当前通道状态（Gauge，取值为状态序号）
pub fn record_channel_state(channel: &'static str, state_ordinal: u8) {
    metrics::gauge!(GAUGE_CHANNEL_STATE, "channel" => channel).set(state_ordinal as f64);
}

/// 丢弃的畸形帧 +1
pub fn record_frame_dropped(channel: &'static str) {
    metrics::counter!(COUNTER_FRAMES_DROPPED, "channel" => channel).increment(1);
}

/// 本地限流命中 +1
pub fn record_rate_limited(action: &str) {
    metrics::counter!(COUNTER_RATE_LIMITED, "action" => action.to_string()).increment(1);
}

/// 配额快照写入失败 +1
pub fn record_quota_persist_failure() {
    metrics::counter!(COUNTER_QUOTA_PERSIST_FAIL).increment(1);
}

/// 撤销的会话数
pub fn record_sessions_revoked(count: u64) {
    metrics::counter!(COUNTER_SESSIONS_REVOKED).increment(count);
}

/// 降级轮询次数 +1
pub fn record_fallback_poll(channel: &'static str) {
    metrics::counter!(COUNTER_POLLS, "channel" => channel).increment(1);
}
