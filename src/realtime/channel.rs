//! 面向消费者的实时通道句柄
//!
//! 未在连接上下文中使用时返回 `ChannelContext::Disconnected`：
//! 状态恒为 Disconnected，发送只记录警告，订阅不会收到事件。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::error::Result;

use super::connection_manager::ConnectionManager;
use super::state::{ChannelKind, ConnectionSnapshot, ConnectionStatus, DeliveryMode};
use super::subscription::{EventCallback, EventType, SubscriberRegistry, Subscription};

/// 实时通道的统一接口
pub trait RealtimeChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    fn snapshot(&self) -> ConnectionSnapshot;

    fn status(&self) -> ConnectionStatus {
        self.snapshot().status
    }

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    fn send_message(&self, event_type: &str, payload: Value) -> Result<()>;

    fn subscribe(&self, event_type: EventType, callback: EventCallback) -> Subscription;

    fn unsubscribe(&self, subscription: &Subscription) -> bool;

    fn delivery_mode(&self) -> DeliveryMode;
}

impl RealtimeChannel for ConnectionManager {
    fn kind(&self) -> ChannelKind {
        ConnectionManager::kind(self)
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionManager::snapshot(self)
    }

    fn send_message(&self, event_type: &str, payload: Value) -> Result<()> {
        ConnectionManager::send_message(self, event_type, payload)
    }

    fn subscribe(&self, event_type: EventType, callback: EventCallback) -> Subscription {
        self.subscribe_arc(event_type, callback)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> bool {
        ConnectionManager::unsubscribe(self, subscription)
    }

    fn delivery_mode(&self) -> DeliveryMode {
        ConnectionManager::delivery_mode(self)
    }
}

/// 断开状态的桩通道
pub struct DisconnectedChannel {
    kind: ChannelKind,
    registry: Arc<SubscriberRegistry>,
    state: watch::Sender<ConnectionSnapshot>,
}

impl DisconnectedChannel {
    pub fn new(kind: ChannelKind) -> Self {
        let (state, _) = watch::channel(ConnectionSnapshot::new(kind));
        Self {
            kind,
            registry: Arc::new(SubscriberRegistry::new()),
            state,
        }
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.subscribe()
    }
}

impl Default for DisconnectedChannel {
    fn default() -> Self {
        Self::new(ChannelKind::User)
    }
}

impl RealtimeChannel for DisconnectedChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        self.state.borrow().clone()
    }

    fn send_message(&self, event_type: &str, _payload: Value) -> Result<()> {
        warn!(
            "⚠️ 实时通道未连接，忽略发送: channel={}, type={}",
            self.kind, event_type
        );
        Ok(())
    }

    fn subscribe(&self, event_type: EventType, callback: EventCallback) -> Subscription {
        let id = self.registry.subscribe(event_type, callback);
        Subscription::new(id, &self.registry)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.registry.unsubscribe(subscription.id())
    }

    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Idle
    }
}

/// 消费者拿到的通道上下文
pub enum ChannelContext {
    /// 未处于连接上下文中
    Disconnected(DisconnectedChannel),
    /// 由连接管理器驱动
    Live(Arc<ConnectionManager>),
}

impl ChannelContext {
    pub fn live(manager: Arc<ConnectionManager>) -> Self {
        ChannelContext::Live(manager)
    }

    pub fn disconnected(kind: ChannelKind) -> Self {
        ChannelContext::Disconnected(DisconnectedChannel::new(kind))
    }

    pub fn manager(&self) -> Option<&Arc<ConnectionManager>> {
        match self {
            ChannelContext::Live(manager) => Some(manager),
            ChannelContext::Disconnected(_) => None,
        }
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        match self {
            ChannelContext::Live(manager) => manager.watch(),
            ChannelContext::Disconnected(stub) => stub.watch(),
        }
    }

    fn as_channel(&self) -> &dyn RealtimeChannel {
        match self {
            ChannelContext::Live(manager) => manager.as_ref(),
            ChannelContext::Disconnected(stub) => stub,
        }
    }
}

impl Default for ChannelContext {
    fn default() -> Self {
        ChannelContext::Disconnected(DisconnectedChannel::default())
    }
}

impl RealtimeChannel for ChannelContext {
    fn kind(&self) -> ChannelKind {
        self.as_channel().kind()
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        self.as_channel().snapshot()
    }

    fn send_message(&self, event_type: &str, payload: Value) -> Result<()> {
        self.as_channel().send_message(event_type, payload)
    }

    fn subscribe(&self, event_type: EventType, callback: EventCallback) -> Subscription {
        self.as_channel().subscribe(event_type, callback)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.as_channel().unsubscribe(subscription)
    }

    fn delivery_mode(&self) -> DeliveryMode {
        self.as_channel().delivery_mode()
    }
}
