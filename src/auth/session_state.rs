// =====================================================
// 客户端会话状态
// =====================================================

use serde::{Deserialize, Serialize};

/// 本地会话状态（显式状态机）
///
/// 只有 `Active` 状态允许携带凭证发起请求或建立实时通道。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "state", content = "reason")]
pub enum SessionState {
    /// 从未登录
    Anonymous,

    /// 已登录（持有 access token）
    Active,

    /// 已登出
    /// - 主动登出、密码修改、被远程撤销等场景
    /// - 必须重新登录
    SignedOut(RevocationReason),
}

impl SessionState {
    /// 判断状态是否可用（允许连接）
    pub fn is_usable(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// 判断是否需要断开连接
    pub fn should_disconnect(&self) -> bool {
        !self.is_usable()
    }

    /// 获取用户友好的提示
    pub fn to_message(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "Not signed in",
            SessionState::Active => "Signed in",
            SessionState::SignedOut(reason) => reason.to_message(),
        }
    }

    /// 获取状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "ANONYMOUS",
            SessionState::Active => "ACTIVE",
            SessionState::SignedOut(_) => "SIGNED_OUT",
        }
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Anonymous
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::SignedOut(reason) => write!(f, "{}({})", self.as_str(), reason),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

/// 会话结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// 用户主动登出或撤销当前会话
    UserRequested,

    /// 密码修改（服务端使其他会话失效）
    PasswordChanged,

    /// 被其他设备撤销（401 / close code 4001 / session_revoked 事件）
    RemoteRevocation,

    /// Token 过期
    TokenExpired,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::UserRequested => "user_requested",
            RevocationReason::PasswordChanged => "password_changed",
            RevocationReason::RemoteRevocation => "remote_revocation",
            RevocationReason::TokenExpired => "token_expired",
        }
    }

    pub fn to_message(&self) -> &'static str {
        match self {
            RevocationReason::UserRequested => "You have signed out",
            RevocationReason::PasswordChanged => "Your password was changed, please sign in again",
            RevocationReason::RemoteRevocation => "This session was signed out from another device",
            RevocationReason::TokenExpired => "Your session has expired, please sign in again",
        }
    }
}

impl std::fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话事件（通过事件总线广播）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// 登录成功
    SignedIn { session_id: Option<String> },

    /// Token 被替换（刷新或密码修改后重新签发）
    TokenRotated,

    /// 撤销了一个其他会话
    SessionRevoked { session_id: String },

    /// 批量撤销了其他会话
    SessionsRevoked {
        count: usize,
        reason: RevocationReason,
    },

    /// 本地会话结束
    SignedOut { reason: RevocationReason },
}
