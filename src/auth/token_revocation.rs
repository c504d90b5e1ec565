use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LinkError, Result};
use crate::infra::event_bus::EventBus;
use crate::infra::metrics;
use crate::realtime::{ChannelEvent, CloseClass, CloseCode, ConnectionManager, EventType};
use crate::security::rate_limit_gate::RateLimitGate;

use super::models::{PasswordChangeOutcome, SessionRecord};
use super::session_api::SessionApi;
use super::session_state::{RevocationReason, SessionEvent};
use super::token::AuthSession;

/// 会话撤销协调器
///
/// 串联会话管理接口、本地登录态与实时通道：
/// - 撤销当前会话或修改密码（未重新签发 token）时本地登出并断开所有通道
/// - 任意请求返回 401、通道以 4001 关闭或收到 `session_revoked` 事件时视为被远程撤销
pub struct SessionRevocationCoordinator {
    api: Arc<dyn SessionApi>,
    auth: Arc<AuthSession>,
    gate: Option<Arc<RateLimitGate>>,
    sessions: RwLock<Vec<SessionRecord>>,
    channels: Mutex<Vec<Arc<ConnectionManager>>>,
    events: EventBus<SessionEvent>,
    watchers: CancellationToken,
}

impl SessionRevocationCoordinator {
    pub fn new(api: Arc<dyn SessionApi>, auth: Arc<AuthSession>) -> Self {
        Self {
            api,
            auth,
            gate: None,
            sessions: RwLock::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            events: EventBus::default(),
            watchers: CancellationToken::new(),
        }
    }

    /// 对批量撤销与修改密码应用本地限流
    pub fn with_rate_limit(mut self, gate: Arc<RateLimitGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    /// 订阅会话事件
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// 最近一次拉取的会话列表
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.read().clone()
    }

    pub fn current_session(&self) -> Option<SessionRecord> {
        let current_id = self.auth.session_id();
        self.sessions
            .read()
            .iter()
            .find(|s| s.is_current || current_id.as_deref() == Some(s.session_id.as_str()))
            .cloned()
    }

    /// 登录并连接所有已注册通道
    pub async fn sign_in(&self, token: impl Into<String>, session_id: Option<String>) {
        self.auth.sign_in(token, session_id.clone());
        self.events.publish(SessionEvent::SignedIn { session_id });
        for manager in self.channel_list() {
            if let Err(e) = manager.connect().await {
                warn!("⚠️ 登录后连接通道失败: channel={}, error={}", manager.kind(), e);
            }
        }
    }

    /// 注册一个实时通道：登出时断开，4001 关闭或 `session_revoked` 事件触发远程撤销处理
    pub fn attach_channel(self: &Arc<Self>, manager: Arc<ConnectionManager>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        manager.subscribe(EventType::SessionRevoked, move |event: &ChannelEvent| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.on_session_revoked_event(event);
            }
        });

        let weak = Arc::downgrade(self);
        let mut state = manager.watch();
        let cancel = self.watchers.child_token();
        let channel = manager.kind();
        // 只响应注册之后新增的认证拒绝
        let mut seen_rejections = state.borrow_and_update().stats.auth_rejections;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                let rejected = {
                    let snapshot = state.borrow_and_update();
                    if snapshot.disposed {
                        return;
                    }
                    let rejections = snapshot.stats.auth_rejections;
                    let fresh = rejections > seen_rejections;
                    seen_rejections = rejections;
                    fresh
                };
                if rejected {
                    let Some(coordinator) = weak.upgrade() else {
                        return;
                    };
                    debug!("通道认证被拒绝: channel={}", channel);
                    coordinator.handle_remote_revocation();
                }
            }
        });

        self.channels.lock().push(manager);
    }

    /// 刷新会话列表
    pub async fn refresh_sessions(&self) -> Result<Vec<SessionRecord>> {
        let sessions = self.guard(self.api.list_sessions().await)?;
        *self.sessions.write() = sessions.clone();
        debug!("会话列表已刷新: count={}", sessions.len());
        Ok(sessions)
    }

    /// 撤销指定会话；撤销的是当前会话时本地登出
    pub async fn revoke_session(&self, session_id: &str) -> Result<()> {
        self.require_auth()?;
        let is_current = self.is_current_session(session_id);
        self.guard(self.api.revoke_session(session_id).await)?;
        metrics::record_sessions_revoked(1);

        if is_current {
            info!("当前会话已撤销: session_id={}", session_id);
            self.sign_out(RevocationReason::UserRequested);
        } else {
            self.sessions.write().retain(|s| s.session_id != session_id);
            self.events.publish(SessionEvent::SessionRevoked {
                session_id: session_id.to_string(),
            });
            info!("✅ 已撤销会话: session_id={}", session_id);
        }
        Ok(())
    }

    /// 退出其他所有设备，返回撤销数量
    pub async fn revoke_other_sessions(&self) -> Result<usize> {
        self.require_auth()?;
        if let Some(gate) = &self.gate {
            gate.attempt(
                "logoutAllDevices",
                self.auth.session_id().as_deref(),
                Some("/api/auth/sessions/revoke-others"),
            )?;
        }

        let count = self.guard(self.api.revoke_other_sessions().await)?;
        self.retain_current();
        metrics::record_sessions_revoked(count as u64);
        self.events.publish(SessionEvent::SessionsRevoked {
            count,
            reason: RevocationReason::UserRequested,
        });
        info!("✅ 已退出其他 {} 个设备", count);
        Ok(count)
    }

    /// 修改密码
    ///
    /// 服务端为当前设备重新签发 token 时替换 token 并重连通道，否则本地登出。
    pub async fn change_password(&self, current: &str, new: &str) -> Result<PasswordChangeOutcome> {
        self.require_auth()?;
        if new.is_empty() {
            return Err(LinkError::InvalidRequest(
                "new password must not be empty".to_string(),
            ));
        }
        if new == current {
            return Err(LinkError::InvalidRequest(
                "new password must differ from the current one".to_string(),
            ));
        }
        if let Some(gate) = &self.gate {
            gate.attempt(
                "passwordChange",
                self.auth.session_id().as_deref(),
                Some("/api/auth/change-password"),
            )?;
        }

        let outcome = self.guard(self.api.change_password(current, new).await)?;
        metrics::record_sessions_revoked(outcome.revoked_sessions as u64);
        self.events.publish(SessionEvent::SessionsRevoked {
            count: outcome.revoked_sessions,
            reason: RevocationReason::PasswordChanged,
        });

        match outcome.access_token.as_deref() {
            Some(token) if self.auth.replace_token(token) => {
                self.retain_current();
                self.events.publish(SessionEvent::TokenRotated);
                for manager in self.channel_list() {
                    if let Err(e) = manager.reconnect().await {
                        warn!("⚠️ token 轮换后重连失败: channel={}, error={}", manager.kind(), e);
                    }
                }
                info!("✅ 密码已修改，其他 {} 个会话已失效", outcome.revoked_sessions);
            }
            _ => {
                info!("密码已修改，需要重新登录");
                self.sign_out(RevocationReason::PasswordChanged);
            }
        }
        Ok(outcome)
    }

    /// 主动登出：尽力通知服务端撤销当前会话，然后本地登出
    pub async fn logout(&self) -> bool {
        if let Some(session_id) = self.auth.session_id() {
            if let Err(e) = self.api.revoke_session(&session_id).await {
                debug!("登出时撤销服务端会话失败: {}", e);
            }
        }
        self.sign_out(RevocationReason::UserRequested)
    }

    /// 本地登出：清除凭证、断开所有通道并广播事件；返回之前是否已登录
    pub fn sign_out(&self, reason: RevocationReason) -> bool {
        let was_active = self.auth.sign_out(reason);
        for manager in self.channel_list() {
            manager.disconnect();
        }
        self.sessions.write().clear();
        if was_active {
            self.events.publish(SessionEvent::SignedOut { reason });
            info!("会话已登出: reason={}", reason);
        }
        was_active
    }

    /// 检查请求错误；401 视为被远程撤销。返回是否触发了登出
    pub fn observe_error(&self, error: &LinkError) -> bool {
        match error {
            LinkError::Unauthorized(_) => self.handle_remote_revocation(),
            _ => false,
        }
    }

    /// 检查通道关闭码；4001 视为被远程撤销
    pub fn observe_close_code(&self, code: CloseCode) -> bool {
        match code.class() {
            CloseClass::AuthFailed => self.handle_remote_revocation(),
            _ => false,
        }
    }

    fn handle_remote_revocation(&self) -> bool {
        if !self.auth.is_authenticated() {
            return false;
        }
        warn!("⚠️ 当前会话已被远程撤销");
        self.sign_out(RevocationReason::RemoteRevocation)
    }

    fn on_session_revoked_event(&self, event: &ChannelEvent) {
        let target = event
            .payload
            .get("sessionId")
            .or_else(|| event.payload.get("session_id"))
            .and_then(|v| v.as_str());
        match target {
            Some(id) if !self.is_current_session(id) => {
                self.sessions.write().retain(|s| s.session_id != id);
                self.events.publish(SessionEvent::SessionRevoked {
                    session_id: id.to_string(),
                });
            }
            _ => {
                self.handle_remote_revocation();
            }
        }
    }

    fn is_current_session(&self, session_id: &str) -> bool {
        if self.auth.session_id().as_deref() == Some(session_id) {
            return true;
        }
        self.sessions
            .read()
            .iter()
            .any(|s| s.is_current && s.session_id == session_id)
    }

    fn retain_current(&self) {
        let current_id = self.auth.session_id();
        self.sessions
            .write()
            .retain(|s| s.is_current || current_id.as_deref() == Some(s.session_id.as_str()));
    }

    fn require_auth(&self) -> Result<()> {
        if self.auth.is_authenticated() {
            Ok(())
        } else {
            Err(LinkError::NotAuthenticated)
        }
    }

    fn guard<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.observe_error(e);
        }
        result
    }

    fn channel_list(&self) -> Vec<Arc<ConnectionManager>> {
        self.channels.lock().clone()
    }
}

impl Drop for SessionRevocationCoordinator {
    fn drop(&mut self) {
        self.watchers.cancel();
    }
}
