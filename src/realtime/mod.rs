/// 实时通道模块
///
/// - 带显式状态机的 WebSocket 连接管理（重连、退避、心跳）
/// - 按事件类型的订阅分发
/// - 未登录或未处于连接上下文时的断开桩
/// - 通道不可用时的轮询降级
pub mod channel;
pub mod connection_manager;
pub mod polling;
pub mod state;
pub mod subscription;
pub mod transport;

pub use channel::{ChannelContext, DisconnectedChannel, RealtimeChannel};
pub use connection_manager::{
    BackoffStrategy, ConnectionManager, ConnectionOptions, ReconnectPolicy,
};
pub use polling::{Poller, PollingFallback};
pub use state::{
    ChannelKind, CloseClass, CloseCode, ConnectionSnapshot, ConnectionStats, ConnectionStatus,
    DeliveryMode,
};
pub use subscription::{ChannelEvent, EventCallback, EventType, Subscription, SubscriptionId};
pub use transport::{
    Connector, OutboundFrame, RemoteEnd, TransportEvent, TransportLink, TungsteniteConnector,
};
