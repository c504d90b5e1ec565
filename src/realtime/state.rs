use serde::{Deserialize, Serialize};
use std::fmt;

/// 通道连接状态（显式状态机）
///
/// ```text
/// Disconnected -> Connecting -> Open -> Reconnecting -> Connecting -> ...
///                                  \-> Disconnected (1000 / 主动断开 / 4001)
///                  Reconnecting --(重试耗尽)--> Failed（切换轮询）
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// 未连接（包括未登录时的桩状态）
    Disconnected,
    /// 正在握手
    Connecting,
    /// 已连接
    Open,
    /// 等待重连定时器
    Reconnecting,
    /// 重连耗尽或被拒绝，消费者应切换到轮询
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        }
    }

    /// 指标用的状态序号
    pub fn ordinal(&self) -> u8 {
        match self {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Open => 2,
            ConnectionStatus::Reconnecting => 3,
            ConnectionStatus::Failed => 4,
        }
    }

    /// 是否处于连接生命周期中（有驱动任务在跑）
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting | ConnectionStatus::Open | ConnectionStatus::Reconnecting
        )
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        ConnectionStatus::Disconnected
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 逻辑通道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    User,
    Admin,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::User => "user",
            ChannelKind::Admin => "admin",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// WebSocket 关闭码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// 正常关闭
    pub const NORMAL: CloseCode = CloseCode(1000);
    /// 异常关闭（未收到关闭帧）
    pub const ABNORMAL: CloseCode = CloseCode(1006);
    /// 认证失败
    pub const AUTH_FAILED: CloseCode = CloseCode(4001);
    /// 权限不足
    pub const FORBIDDEN: CloseCode = CloseCode(4003);

    pub fn class(&self) -> CloseClass {
        match self.0 {
            1000 => CloseClass::Normal,
            1006 => CloseClass::Abnormal,
            4001 => CloseClass::AuthFailed,
            4003 => CloseClass::Forbidden,
            _ => CloseClass::Other,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 关闭码分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseClass {
    Normal,
    Abnormal,
    AuthFailed,
    Forbidden,
    Other,
}

impl CloseClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseClass::Normal => "normal",
            CloseClass::Abnormal => "abnormal",
            CloseClass::AuthFailed => "auth_failed",
            CloseClass::Forbidden => "forbidden",
            CloseClass::Other => "other",
        }
    }

    /// 是否需要重连
    pub fn should_reconnect(&self) -> bool {
        matches!(self, CloseClass::Abnormal | CloseClass::Other)
    }
}

/// 连接统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    /// 成功建立的连接数
    pub opened: u64,
    /// 关闭的连接数
    pub closed: u64,
    /// 累计重连尝试次数
    pub reconnect_attempts: u64,
    /// 服务端拒绝认证（4001 / 握手 401）的次数
    #[serde(default)]
    pub auth_rejections: u64,
}

/// 消息投递方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// 实时通道可用或正在恢复
    Realtime,
    /// 实时通道不可用，按固定间隔轮询
    Polling { interval: std::time::Duration },
    /// 未连接，也无需轮询
    Idle,
}

/// 通道状态快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub channel: ChannelKind,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub last_close: Option<CloseCode>,
    pub stats: ConnectionStats,
    /// 当前连续重连次数（连接成功后清零）
    pub attempt: u32,
    /// 是否持有有效凭证
    pub authenticated: bool,
    /// 实例是否已销毁
    pub disposed: bool,
}

impl ConnectionSnapshot {
    pub fn new(channel: ChannelKind) -> Self {
        Self {
            channel,
            status: ConnectionStatus::Disconnected,
            last_error: None,
            last_close: None,
            stats: ConnectionStats::default(),
            attempt: 0,
            authenticated: false,
            disposed: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_classes() {
        assert_eq!(CloseCode::NORMAL.class(), CloseClass::Normal);
        assert_eq!(CloseCode::ABNORMAL.class(), CloseClass::Abnormal);
        assert_eq!(CloseCode::AUTH_FAILED.class(), CloseClass::AuthFailed);
        assert_eq!(CloseCode::FORBIDDEN.class(), CloseClass::Forbidden);
        assert_eq!(CloseCode(1011).class(), CloseClass::Other);

        assert!(CloseClass::Abnormal.should_reconnect());
        assert!(CloseClass::Other.should_reconnect());
        assert!(!CloseClass::Normal.should_reconnect());
        assert!(!CloseClass::AuthFailed.should_reconnect());
        assert!(!CloseClass::Forbidden.should_reconnect());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ConnectionStatus::Disconnected).unwrap(),
            "\"disconnected\""
        );
        assert_eq!(ConnectionStatus::Reconnecting.to_string(), "reconnecting");
        assert!(ConnectionStatus::Connecting.is_active());
        assert!(!ConnectionStatus::Failed.is_active());
    }
}
