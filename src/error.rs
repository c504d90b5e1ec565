use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 客户端可靠性层错误类型
///
/// 分类对应四类故障：
/// - 传输层瞬时错误（可重试，不向上抛出硬失败）
/// - 认证错误（4001/4003/token 失效，体现为状态迁移）
/// - 存储错误（在边界处捕获并记录，视为缓存未命中）
/// - 配置错误（无效的限流头等）
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum LinkError {
    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
    /// 认证失败（401 / close code 4001）
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// 权限不足（403 / close code 4003）
    #[error("Forbidden: {0}")]
    Forbidden(String),
    /// 未登录，无法获取 access token
    #[error("Not authenticated")]
    NotAuthenticated,
    /// 通道未处于 Open 状态
    #[error("Channel not open: {0}")]
    NotConnected(String),
    /// 通道已被销毁
    #[error("Channel disposed")]
    Disposed,
    /// 网络 / WebSocket 传输错误
    #[error("Transport error: {0}")]
    Transport(String),
    /// 连接超时
    #[error("Timeout error: {0}")]
    Timeout(String),
    /// 本地存储错误
    #[error("Storage error: {0}")]
    Storage(String),
    /// 本地存储配额不足
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// 被限流
    #[error("Rate limit error: {0}")]
    RateLimited(String),
    /// 服务端返回的其他 HTTP 错误
    #[error("HTTP error {status}: {message}")]
    Http { status: u16, message: String },
    /// 资源未找到
    #[error("Not found: {0}")]
    NotFound(String),
    /// 无效的请求参数
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl LinkError {
    /// 是否为可本地重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LinkError::Transport(_) | LinkError::Timeout(_) | LinkError::Http { status: 500..=599, .. }
        )
    }

    /// 是否为认证类错误（需要转入登出状态）
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            LinkError::Unauthorized(_) | LinkError::Forbidden(_) | LinkError::NotAuthenticated
        )
    }

    /// 是否为存储类错误
    pub fn is_storage(&self) -> bool {
        matches!(self, LinkError::Storage(_) | LinkError::QuotaExceeded(_))
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for LinkError {
    fn from(err: sled::Error) -> Self {
        LinkError::Storage(err.to_string())
    }
}

impl From<url::ParseError> for LinkError {
    fn from(err: url::ParseError) -> Self {
        LinkError::Configuration(format!("invalid url: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for LinkError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        LinkError::Timeout(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => match response.status().as_u16() {
                401 => LinkError::Unauthorized("WebSocket handshake rejected".to_string()),
                403 => LinkError::Forbidden("WebSocket handshake rejected".to_string()),
                code => LinkError::Http {
                    status: code,
                    message: "WebSocket handshake failed".to_string(),
                },
            },
            other => LinkError::Transport(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for LinkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return LinkError::Timeout(err.to_string());
        }
        match err.status().map(|s| s.as_u16()) {
            Some(401) => LinkError::Unauthorized(err.to_string()),
            Some(403) => LinkError::Forbidden(err.to_string()),
            Some(404) => LinkError::NotFound(err.to_string()),
            Some(status) => LinkError::Http {
                status,
                message: err.to_string(),
            },
            None => LinkError::Transport(err.to_string()),
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, LinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(LinkError::Transport("reset".into()).is_transient());
        assert!(LinkError::Http { status: 503, message: "busy".into() }.is_transient());
        assert!(!LinkError::Http { status: 400, message: "bad".into() }.is_transient());

        assert!(LinkError::Unauthorized("expired".into()).is_auth());
        assert!(LinkError::Forbidden("admin only".into()).is_auth());
        assert!(!LinkError::Timeout("10s".into()).is_auth());

        assert!(LinkError::QuotaExceeded("full".into()).is_storage());
    }

    #[test]
    fn test_error_display() {
        let err = LinkError::Http { status: 429, message: "slow down".into() };
        assert_eq!(err.to_string(), "HTTP error 429: slow down");
        assert_eq!(LinkError::NotAuthenticated.to_string(), "Not authenticated");
    }
}
