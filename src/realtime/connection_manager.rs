//! 实时通道连接管理器
//!
//! 每个管理器拥有一个后台驱动任务，负责握手、收帧、心跳与按策略重连。
//! 状态通过 watch 通道发布；所有状态写入都带有代次（epoch）检查，
//! 旧的驱动任务在 `disconnect()` / `dispose()` 之后无法再改写状态或触发回调。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::token::TokenProvider;
use crate::error::{LinkError, Result};
use crate::infra::metrics;

use super::state::{
    ChannelKind, CloseClass, CloseCode, ConnectionSnapshot, ConnectionStatus, DeliveryMode,
};
use super::subscription::{
    ChannelEvent, EventCallback, EventType, SubscriberRegistry, Subscription,
};
use super::transport::{redact, Connector, OutboundFrame, TransportEvent, TransportLink};

/// 重连退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// 固定间隔
    Fixed,
    /// 指数退避（以 max_delay 封顶）
    Exponential,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Fixed
    }
}

/// 重连策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 连续失败上限，超过后进入 Failed
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// 第 `attempt` 次重连（从 1 开始）前的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(16);
                self.base_delay
                    .saturating_mul(1u32 << shift)
                    .min(self.max_delay)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// 连接参数
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub kind: ChannelKind,
    /// 完整的 ws(s):// 地址（不含 token）
    pub endpoint: Url,
    /// token 查询参数名
    pub token_param: String,
    /// 关闭时只走轮询
    pub enabled: bool,
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// 应用层心跳间隔，None 表示关闭
    pub heartbeat_interval: Option<Duration>,
}

impl ConnectionOptions {
    pub fn new(kind: ChannelKind, endpoint: Url) -> Self {
        Self {
            kind,
            endpoint,
            token_param: "token".to_string(),
            enabled: true,
            reconnect: ReconnectPolicy::default(),
            poll_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: None,
        }
    }

    /// 携带 token 的连接地址
    pub fn url_with_token(&self, token: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair(&self.token_param, token);
        url
    }
}

enum LinkOutcome {
    Cancelled,
    Closed { code: CloseCode, reason: String },
}

struct Driver {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenProvider>,
    registry: Arc<SubscriberRegistry>,
    state: watch::Sender<ConnectionSnapshot>,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    driver: Mutex<Option<Driver>>,
    epoch: AtomicU64,
    disposed: AtomicBool,
}

/// 实时通道连接管理器
///
/// 未登录时不会创建任何连接，`send_message` 只记录警告。
/// 丢弃管理器等同于 `dispose()`。
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionSnapshot::new(options.kind));
        Self {
            inner: Arc::new(Inner {
                options,
                connector,
                tokens,
                registry: Arc::new(SubscriberRegistry::new()),
                state,
                outbound: Mutex::new(None),
                driver: Mutex::new(None),
                epoch: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.inner.options.kind
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// 开始连接
    ///
    /// 已有连接任务时不做任何事；没有 token 时保持 Disconnected。
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(LinkError::Disposed);
        }
        if inner.driver_running() {
            debug!("连接任务已在运行: channel={}", inner.options.kind);
            return Ok(());
        }

        let token = inner.tokens.access_token().await;
        let authenticated = token.is_some();

        let Some(token) = token.filter(|_| inner.options.enabled) else {
            inner.update(None, |s| {
                s.status = ConnectionStatus::Disconnected;
                s.authenticated = authenticated;
                s.attempt = 0;
                s.last_close = None;
            });
            if !authenticated {
                debug!("未登录，跳过实时通道: channel={}", inner.options.kind);
            } else {
                info!("实时通道已禁用，使用轮询: channel={}", inner.options.kind);
            }
            return Ok(());
        };

        let mut driver = inner.driver.lock();
        if inner.is_disposed() {
            return Err(LinkError::Disposed);
        }
        if driver.as_ref().is_some_and(|d| !d.handle.is_finished()) {
            return Ok(());
        }

        let epoch = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        inner.update(Some(epoch), |s| {
            s.status = ConnectionStatus::Connecting;
            s.authenticated = true;
            s.attempt = 0;
            s.last_error = None;
            s.last_close = None;
        });
        let handle = tokio::spawn(Inner::run(inner.clone(), epoch, cancel.clone(), token));
        *driver = Some(Driver { cancel, handle });
        Ok(())
    }

    /// 主动断开（1000），保留订阅，之后可以再次 `connect()`
    ///
    /// 清除上一次的关闭码，主动断开不会被当作服务端关闭。
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let driver = inner.driver.lock().take();
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(driver) = driver {
            driver.cancel.cancel();
        }
        inner.outbound.lock().take();
        inner.update(None, |s| {
            s.status = ConnectionStatus::Disconnected;
            s.attempt = 0;
            s.last_close = None;
        });
        debug!("实时通道已断开: channel={}", inner.options.kind);
    }

    /// 断开后立即重新连接（例如 token 轮换后）
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect();
        self.connect().await
    }

    /// 销毁
    ///
    /// 同步完成：取消重连定时器、终止驱动任务、清空订阅。
    /// 返回后不会再有任何回调被调用，也不会再创建连接。
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let driver = inner.driver.lock().take();
        inner.epoch.fetch_add(1, Ordering::SeqCst);

        if let Some(tx) = inner.outbound.lock().take() {
            let _ = tx.send(OutboundFrame::Close {
                code: CloseCode::NORMAL,
                reason: "disposed".to_string(),
            });
        }
        if let Some(driver) = driver {
            driver.cancel.cancel();
            driver.handle.abort();
        }
        inner.registry.clear();
        inner.update(None, |s| {
            s.status = ConnectionStatus::Disconnected;
            s.attempt = 0;
            s.disposed = true;
        });
        debug!("🗑️ 实时通道已销毁: channel={}", inner.options.kind);
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// 发送 `{"type": ..., "payload": ...}` 帧
    ///
    /// 未登录时记录警告并忽略；已登录但通道未 Open（包括尚未 `connect()`）时返回错误。
    pub fn send_message(&self, event_type: &str, payload: Value) -> Result<()> {
        let inner = &self.inner;
        if inner.is_disposed() {
            return Err(LinkError::Disposed);
        }
        let snapshot = self.snapshot();
        if !inner.tokens.has_token() {
            warn!(
                "⚠️ 未登录，忽略发送: channel={}, type={}",
                inner.options.kind, event_type
            );
            return Ok(());
        }
        if snapshot.status != ConnectionStatus::Open {
            return Err(LinkError::NotConnected(format!(
                "{} channel is {}",
                inner.options.kind, snapshot.status
            )));
        }

        let frame = json!({ "type": event_type, "payload": payload }).to_string();
        let sender = inner
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| LinkError::NotConnected(format!("{} channel has no link", inner.options.kind)))?;
        sender
            .send(OutboundFrame::Text(frame))
            .map_err(|_| LinkError::NotConnected(format!("{} link closed", inner.options.kind)))
    }

    /// 订阅某类事件；按注册顺序投递
    pub fn subscribe<F>(&self, event_type: EventType, callback: F) -> Subscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        self.subscribe_arc(event_type, Arc::new(callback))
    }

    pub fn subscribe_arc(&self, event_type: EventType, callback: EventCallback) -> Subscription {
        let registry = &self.inner.registry;
        let id = registry.subscribe(event_type, callback);
        Subscription::new(id, registry)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner.registry.unsubscribe(subscription.id())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// 订阅状态变化
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        delivery_mode_for(&self.snapshot(), &self.inner.options)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// 根据快照决定消息投递方式
pub fn delivery_mode_for(snapshot: &ConnectionSnapshot, options: &ConnectionOptions) -> DeliveryMode {
    if snapshot.disposed || !snapshot.authenticated {
        return DeliveryMode::Idle;
    }
    if !options.enabled || snapshot.status == ConnectionStatus::Failed {
        return DeliveryMode::Polling {
            interval: options.poll_interval,
        };
    }
    if snapshot.status.is_active() {
        DeliveryMode::Realtime
    } else {
        DeliveryMode::Idle
    }
}

impl Inner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn driver_running(&self) -> bool {
        self.driver
            .lock()
            .as_ref()
            .is_some_and(|d| !d.handle.is_finished())
    }

    /// 当前代次的驱动是否仍然有效
    fn is_live(&self, epoch: u64) -> bool {
        !self.is_disposed() && self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// 修改快照；`epoch` 为 Some 时仅在代次匹配时生效
    fn update(&self, epoch: Option<u64>, f: impl FnOnce(&mut ConnectionSnapshot)) -> bool {
        let mut applied = false;
        let mut new_status = None;
        self.state.send_if_modified(|snapshot| {
            if let Some(epoch) = epoch {
                if self.epoch.load(Ordering::SeqCst) != epoch {
                    return false;
                }
            }
            applied = true;
            let before = snapshot.clone();
            f(snapshot);
            if snapshot.status != before.status {
                new_status = Some(snapshot.status);
            }
            *snapshot != before
        });

        if let Some(status) = new_status {
            let channel = self.options.kind.as_str();
            metrics::record_channel_state(channel, status.ordinal());
            debug!("通道状态变化: channel={}, status={}", channel, status);
        }
        applied
    }

    async fn run(self: Arc<Self>, epoch: u64, cancel: CancellationToken, first_token: String) {
        let channel = self.options.kind.as_str();
        let policy = self.options.reconnect.clone();
        let mut pending_token = Some(first_token);
        let mut attempt: u32 = 0;

        loop {
            let token = match pending_token.take() {
                Some(token) => Some(token),
                None => self.tokens.access_token().await,
            };
            let Some(token) = token else {
                info!("凭证已失效，停止重连: channel={}", channel);
                self.update(Some(epoch), |s| {
                    s.status = ConnectionStatus::Disconnected;
                    s.authenticated = false;
                    s.attempt = 0;
                });
                return;
            };

            let url = self.options.url_with_token(&token);
            self.update(Some(epoch), |s| {
                s.status = ConnectionStatus::Connecting;
                s.attempt = attempt;
            });
            debug!("🔌 连接实时通道: channel={}, url={}", channel, redact(&url));

            let connected = tokio::select! {
                _ = cancel.cancelled() => return,
                result = tokio::time::timeout(
                    self.options.connect_timeout,
                    self.connector.connect(&url),
                ) => result,
            };

            let (error, code) = match connected {
                Ok(Ok(link)) => {
                    attempt = 0;
                    match self.run_link(epoch, link, &cancel).await {
                        LinkOutcome::Cancelled => return,
                        LinkOutcome::Closed { code, reason } => {
                            let class = code.class();
                            metrics::record_connection_closed(channel, class.as_str());
                            if !class.should_reconnect() {
                                self.finish_on_close(epoch, code, class, &reason);
                                return;
                            }
                            info!(
                                "⚠️ 实时通道异常关闭: channel={}, code={}, reason={}",
                                channel, code, reason
                            );
                            (format!("connection closed ({}): {}", code, reason), code)
                        }
                    }
                }
                Ok(Err(LinkError::Unauthorized(reason))) => {
                    self.finish_on_close(epoch, CloseCode::AUTH_FAILED, CloseClass::AuthFailed, &reason);
                    return;
                }
                Ok(Err(LinkError::Forbidden(reason))) => {
                    self.finish_on_close(epoch, CloseCode::FORBIDDEN, CloseClass::Forbidden, &reason);
                    return;
                }
                // 握手阶段的其他失败按 1006 处理，消耗重连次数
                Ok(Err(e)) => (e.to_string(), CloseCode::ABNORMAL),
                Err(_) => ("connect timeout".to_string(), CloseCode::ABNORMAL),
            };

            attempt += 1;
            if attempt > policy.max_attempts {
                warn!(
                    "❌ 重连次数耗尽，切换到轮询: channel={}, attempts={}",
                    channel, policy.max_attempts
                );
                self.update(Some(epoch), |s| {
                    s.status = ConnectionStatus::Failed;
                    s.last_error = Some(error);
                    s.last_close = Some(code);
                    s.attempt = attempt - 1;
                });
                return;
            }

            let delay = policy.delay_for(attempt);
            metrics::record_reconnect_attempt(channel);
            debug!(
                "🔄 {}ms 后重连: channel={}, attempt={}/{}",
                delay.as_millis(),
                channel,
                attempt,
                policy.max_attempts
            );
            self.update(Some(epoch), |s| {
                s.status = ConnectionStatus::Reconnecting;
                s.last_error = Some(error);
                s.last_close = Some(code);
                s.attempt = attempt;
                s.stats.reconnect_attempts += 1;
            });

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 不再重连的关闭：1000 / 4001 / 4003
    fn finish_on_close(&self, epoch: u64, code: CloseCode, class: CloseClass, reason: &str) {
        let channel = self.options.kind.as_str();
        match class {
            CloseClass::AuthFailed => {
                warn!("❌ 实时通道认证失败: channel={}, reason={}", channel, reason);
                self.update(Some(epoch), |s| {
                    s.status = ConnectionStatus::Disconnected;
                    s.authenticated = false;
                    s.last_error = Some(format!("authentication rejected: {}", reason));
                    s.last_close = Some(code);
                    s.attempt = 0;
                    s.stats.auth_rejections += 1;
                });
            }
            CloseClass::Forbidden => {
                warn!("❌ 实时通道权限不足: channel={}, reason={}", channel, reason);
                self.update(Some(epoch), |s| {
                    s.status = ConnectionStatus::Failed;
                    s.last_error = Some(format!("insufficient privileges: {}", reason));
                    s.last_close = Some(code);
                    s.attempt = 0;
                });
            }
            _ => {
                info!("实时通道已关闭: channel={}, code={}", channel, code);
                self.update(Some(epoch), |s| {
                    s.status = ConnectionStatus::Disconnected;
                    s.last_close = Some(code);
                    s.attempt = 0;
                });
            }
        }
    }

    async fn run_link(
        &self,
        epoch: u64,
        link: TransportLink,
        cancel: &CancellationToken,
    ) -> LinkOutcome {
        let channel = self.options.kind.as_str();
        let TransportLink {
            outbound,
            mut inbound,
        } = link;

        if !self.is_live(epoch) {
            return LinkOutcome::Cancelled;
        }
        *self.outbound.lock() = Some(outbound.clone());
        self.update(Some(epoch), |s| {
            s.status = ConnectionStatus::Open;
            s.stats.opened += 1;
            s.attempt = 0;
            s.last_error = None;
            s.last_close = None;
        });
        metrics::record_connection_opened(channel);
        info!("✅ 实时通道已连接: channel={}", channel);

        let mut heartbeat = self
            .options
            .heartbeat_interval
            .filter(|period| !period.is_zero())
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = outbound.send(OutboundFrame::Close {
                        code: CloseCode::NORMAL,
                        reason: "client disconnect".to_string(),
                    });
                    break LinkOutcome::Cancelled;
                }
                event = inbound.recv() => match event {
                    Some(TransportEvent::Text(text)) => self.handle_frame(epoch, &text),
                    Some(TransportEvent::Closed { code, reason }) => {
                        break LinkOutcome::Closed { code, reason };
                    }
                    None => {
                        break LinkOutcome::Closed {
                            code: CloseCode::ABNORMAL,
                            reason: "transport dropped".to_string(),
                        };
                    }
                },
                _ = next_tick(&mut heartbeat) => {
                    let ping = json!({ "type": "ping" }).to_string();
                    if outbound.send(OutboundFrame::Text(ping)).is_err() {
                        debug!("心跳发送失败: channel={}", channel);
                    }
                }
            }
        };

        {
            let mut slot = self.outbound.lock();
            if slot.as_ref().is_some_and(|tx| tx.same_channel(&outbound)) {
                *slot = None;
            }
        }
        if matches!(outcome, LinkOutcome::Closed { .. }) {
            self.update(Some(epoch), |s| s.stats.closed += 1);
        }
        outcome
    }

    fn handle_frame(&self, epoch: u64, text: &str) {
        match ChannelEvent::parse(text) {
            Ok(event) => {
                self.registry.dispatch(&event, || self.is_live(epoch));
            }
            Err(reason) => {
                warn!(
                    "⚠️ 丢弃畸形帧: channel={}, error={}",
                    self.options.kind, reason
                );
                metrics::record_frame_dropped(self.options.kind.as_str());
            }
        }
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(5), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = ReconnectPolicy {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: 10,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn test_url_with_token_keeps_existing_query() {
        let options = ConnectionOptions::new(
            ChannelKind::Admin,
            Url::parse("wss://example.com/ws/admin?v=2").unwrap(),
        );
        let url = options.url_with_token("a b");
        assert_eq!(url.as_str(), "wss://example.com/ws/admin?v=2&token=a+b");
    }

    #[test]
    fn test_delivery_mode() {
        let mut options =
            ConnectionOptions::new(ChannelKind::User, Url::parse("ws://localhost/ws").unwrap());
        let mut snapshot = ConnectionSnapshot::new(ChannelKind::User);
        assert_eq!(delivery_mode_for(&snapshot, &options), DeliveryMode::Idle);

        snapshot.authenticated = true;
        snapshot.status = ConnectionStatus::Reconnecting;
        assert_eq!(delivery_mode_for(&snapshot, &options), DeliveryMode::Realtime);

        snapshot.status = ConnectionStatus::Failed;
        assert_eq!(
            delivery_mode_for(&snapshot, &options),
            DeliveryMode::Polling {
                interval: Duration::from_secs(30)
            }
        );

        options.enabled = false;
        snapshot.status = ConnectionStatus::Disconnected;
        assert!(matches!(
            delivery_mode_for(&snapshot, &options),
            DeliveryMode::Polling { .. }
        ));

        snapshot.disposed = true;
        assert_eq!(delivery_mode_for(&snapshot, &options), DeliveryMode::Idle);
    }
}
