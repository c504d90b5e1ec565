use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info};

use super::session_state::{RevocationReason, SessionState};

/// access token 来源
///
/// 连接管理器在每次（重）连接前调用一次；返回 `None` 表示未登录。
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self) -> Option<String>;

    /// 当前是否持有 token（同步判断，不触发刷新）
    fn has_token(&self) -> bool;
}

/// 固定 token（CLI 与测试使用）
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Option<String> {
        self.0.clone()
    }

    fn has_token(&self) -> bool {
        self.0.is_some()
    }
}

#[derive(Debug, Default)]
struct Credentials {
    token: Option<String>,
    session_id: Option<String>,
}

/// 当前登录会话
///
/// 持有 access token 与当前会话 ID，并通过 watch 通道广播状态变化。
pub struct AuthSession {
    credentials: RwLock<Credentials>,
    state: watch::Sender<SessionState>,
}

impl AuthSession {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);
        Self {
            credentials: RwLock::new(Credentials::default()),
            state,
        }
    }

    /// 以已有凭证创建
    pub fn signed_in(token: impl Into<String>, session_id: Option<String>) -> Self {
        let session = Self::new();
        session.sign_in(token, session_id);
        session
    }

    pub fn sign_in(&self, token: impl Into<String>, session_id: Option<String>) {
        {
            let mut creds = self.credentials.write();
            creds.token = Some(token.into());
            creds.session_id = session_id;
        }
        self.state.send_replace(SessionState::Active);
        info!("✅ 会话已激活");
    }

    /// 替换 token（保持当前会话）；未登录时返回 false
    pub fn replace_token(&self, token: impl Into<String>) -> bool {
        let mut creds = self.credentials.write();
        if creds.token.is_none() {
            return false;
        }
        creds.token = Some(token.into());
        debug!("access token 已替换");
        true
    }

    /// 登出；返回之前是否处于登录状态
    pub fn sign_out(&self, reason: RevocationReason) -> bool {
        let was_active = {
            let mut creds = self.credentials.write();
            let was_active = creds.token.take().is_some();
            creds.session_id = None;
            was_active
        };
        if was_active {
            self.state.send_replace(SessionState::SignedOut(reason));
            info!("会话已结束: reason={}", reason);
        }
        was_active
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.read().token.is_some()
    }

    pub fn token(&self) -> Option<String> {
        self.credentials.read().token.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.credentials.read().session_id.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for AuthSession {
    async fn access_token(&self) -> Option<String> {
        self.token()
    }

    fn has_token(&self) -> bool {
        self.is_authenticated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let session = AuthSession::new();
        assert_eq!(session.state(), SessionState::Anonymous);
        assert_eq!(session.access_token().await, None);

        session.sign_in("tok-1", Some("s-1".to_string()));
        assert!(session.is_authenticated());
        assert_eq!(session.access_token().await.as_deref(), Some("tok-1"));
        assert_eq!(session.session_id().as_deref(), Some("s-1"));

        assert!(session.replace_token("tok-2"));
        assert_eq!(session.token().as_deref(), Some("tok-2"));
        assert_eq!(session.session_id().as_deref(), Some("s-1"));

        assert!(session.sign_out(RevocationReason::UserRequested));
        assert!(!session.sign_out(RevocationReason::UserRequested));
        assert_eq!(
            session.state(),
            SessionState::SignedOut(RevocationReason::UserRequested)
        );
        assert!(!session.replace_token("tok-3"));
        assert_eq!(session.access_token().await, None);
    }

    #[tokio::test]
    async fn test_watch_receives_sign_out() {
        let session = AuthSession::signed_in("tok", None);
        let mut rx = session.watch();
        assert_eq!(*rx.borrow(), SessionState::Active);

        session.sign_out(RevocationReason::RemoteRevocation);
        rx.changed().await.unwrap();
        assert_eq!(
            *rx.borrow(),
            SessionState::SignedOut(RevocationReason::RemoteRevocation)
        );
    }

    #[tokio::test]
    async fn test_static_token() {
        assert_eq!(StaticToken::new("abc").access_token().await.as_deref(), Some("abc"));
        assert_eq!(StaticToken::none().access_token().await, None);
    }
}
