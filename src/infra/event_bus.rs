use tokio::sync::broadcast;
use tracing::trace;

/// In-process Event Bus（进程内事件总线）
///
/// 基于 tokio::sync::broadcast；没有订阅者时发布不算错误。
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + std::fmt::Debug> EventBus<E> {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件，返回收到事件的订阅者数量
    pub fn publish(&self, event: E) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!("事件无订阅者: {:?}", event);
                0
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + std::fmt::Debug> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(64)
    }
}
