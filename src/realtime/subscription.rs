//! 事件订阅注册表
//!
//! 按事件类型保存回调，按注册顺序投递；单个回调 panic 不影响其他订阅者。

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error};

/// 服务端事件类型
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Notification,
    DocumentUpdated,
    CaseUpdated,
    SessionRevoked,
    AdminAlert,
    SystemStatus,
    Pong,
    /// 订阅全部事件
    Any,
    Other(String),
}

impl EventType {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "notification" => EventType::Notification,
            "document_updated" => EventType::DocumentUpdated,
            "case_updated" => EventType::CaseUpdated,
            "session_revoked" => EventType::SessionRevoked,
            "admin_alert" => EventType::AdminAlert,
            "system_status" => EventType::SystemStatus,
            "pong" => EventType::Pong,
            "*" => EventType::Any,
            other => EventType::Other(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            EventType::Notification => "notification",
            EventType::DocumentUpdated => "document_updated",
            EventType::CaseUpdated => "case_updated",
            EventType::SessionRevoked => "session_revoked",
            EventType::AdminAlert => "admin_alert",
            EventType::SystemStatus => "system_status",
            EventType::Pong => "pong",
            EventType::Any => "*",
            EventType::Other(name) => name,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// 一条已解析的服务端事件
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub event_type: EventType,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl ChannelEvent {
    /// 解析 `{"type": "...", "payload": ...}` 帧；`data` 字段作为 `payload` 的别名
    pub fn parse(text: &str) -> Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
        let object = value
            .as_object()
            .ok_or_else(|| "frame is not a JSON object".to_string())?;
        let event_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| "frame has no string `type` field".to_string())?;
        let payload = object
            .get("payload")
            .or_else(|| object.get("data"))
            .cloned()
            .unwrap_or(Value::Null);

        Ok(Self {
            event_type: EventType::from_wire(event_type),
            payload,
            received_at: Utc::now(),
        })
    }
}

/// 事件回调
pub type EventCallback = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// 订阅 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Entry {
    id: SubscriptionId,
    callback: EventCallback,
}

/// 订阅注册表
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    entries: RwLock<HashMap<EventType, Vec<Entry>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event_type: EventType, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.entries
            .write()
            .entry(event_type)
            .or_default()
            .push(Entry { id, callback });
        id
    }

    /// 取消订阅；返回是否找到
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write();
        let mut found = false;
        entries.retain(|_, list| {
            let before = list.len();
            list.retain(|e| e.id != id);
            found |= list.len() != before;
            !list.is_empty()
        });
        found
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 投递事件，返回成功执行的回调数
    ///
    /// 回调列表先拷贝出来再调用，回调内部可以安全地订阅或取消订阅。
    /// `should_continue` 在每个回调之前检查，返回 false 时立即停止。
    pub fn dispatch(&self, event: &ChannelEvent, should_continue: impl Fn() -> bool) -> usize {
        let callbacks: Vec<(SubscriptionId, EventCallback)> = {
            let entries = self.entries.read();
            let mut list: Vec<(SubscriptionId, EventCallback)> = entries
                .get(&event.event_type)
                .into_iter()
                .chain(
                    entries
                        .get(&EventType::Any)
                        .filter(|_| event.event_type != EventType::Any),
                )
                .flatten()
                .map(|e| (e.id, e.callback.clone()))
                .collect();
            // 通配订阅与具体订阅合并后仍按注册顺序
            list.sort_by_key(|(id, _)| id.0);
            list
        };

        let mut delivered = 0;
        for (id, callback) in callbacks {
            if !should_continue() {
                break;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(_) => error!(
                    "❌ 订阅回调 panic: event={}, subscription={:?}",
                    event.event_type, id
                ),
            }
        }

        if delivered == 0 && event.event_type != EventType::Pong {
            debug!("事件无订阅者: {}", event.event_type);
        }
        delivered
    }
}

/// 订阅句柄；调用 `unsubscribe()` 取消，丢弃句柄不会自动取消
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, registry: &Arc<SubscriberRegistry>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.unsubscribe(self.id))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
