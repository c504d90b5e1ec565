//! 会话管理 HTTP 接口
//!
//! 所有请求都携带 `Authorization: Bearer`，响应中的 `X-RateLimit-*` 头写入配额快照。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::error::{LinkError, Result};
use crate::security::header_sync::RateLimitHeaderSync;

use super::models::{
    ChangePasswordRequest, PasswordChangeOutcome, RevokeOthersResponse, SessionListResponse,
    SessionRecord,
};
use super::token::TokenProvider;

const SESSIONS_PATH: &str = "/api/auth/sessions";
const REVOKE_OTHERS_PATH: &str = "/api/auth/sessions/revoke-others";
const CHANGE_PASSWORD_PATH: &str = "/api/auth/change-password";

/// 会话管理接口
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// 列出当前用户的活跃会话
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    /// 撤销指定会话
    async fn revoke_session(&self, session_id: &str) -> Result<()>;

    /// 撤销除当前会话外的所有会话，返回撤销数量
    async fn revoke_other_sessions(&self) -> Result<usize>;

    /// 修改密码（服务端使其他会话失效）
    async fn change_password(&self, current: &str, new: &str) -> Result<PasswordChangeOutcome>;
}

/// 基于 reqwest 的实现
pub struct HttpSessionApi {
    client: Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
    header_sync: Option<Arc<RateLimitHeaderSync>>,
}

impl HttpSessionApi {
    pub fn new(base_url: Url, tokens: Arc<dyn TokenProvider>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url,
            tokens,
            header_sync: None,
        })
    }

    /// 解析响应中的限流头
    pub fn with_header_sync(mut self, header_sync: Arc<RateLimitHeaderSync>) -> Self {
        self.header_sync = Some(header_sync);
        self
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self
            .tokens
            .access_token()
            .await
            .ok_or(LinkError::NotAuthenticated)?;
        let url = self.base_url.join(path)?;
        debug!("➡️ {} {}", method, url.path());
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    /// 同步限流头并把非 2xx 状态映射为错误
    async fn check(&self, response: Response) -> Result<Response> {
        let path = response.url().path().to_string();
        if let Some(sync) = &self.header_sync {
            let _ = sync.sync_header_map(response.headers(), Some(&path));
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        warn!("⚠️ 请求失败: path={}, status={}", path, status);

        Err(match status {
            StatusCode::UNAUTHORIZED => LinkError::Unauthorized(body),
            StatusCode::FORBIDDEN => LinkError::Forbidden(body),
            StatusCode::NOT_FOUND => LinkError::NotFound(path),
            StatusCode::TOO_MANY_REQUESTS => LinkError::RateLimited(match retry_after {
                Some(secs) => format!("Too many requests. Retry after {} seconds.", secs),
                None => "Too many requests. Please try again later.".to_string(),
            }),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                LinkError::InvalidRequest(body)
            }
            other => LinkError::Http {
                status: other.as_u16(),
                message: body,
            },
        })
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let response = self.request(Method::GET, SESSIONS_PATH).await?.send().await?;
        let body: SessionListResponse = self.check(response).await?.json().await?;
        Ok(body.sessions)
    }

    async fn revoke_session(&self, session_id: &str) -> Result<()> {
        let path = format!("{}/{}", SESSIONS_PATH, urlencode(session_id));
        let response = self.request(Method::DELETE, &path).await?.send().await?;
        self.check(response).await?;
        Ok(())
    }

    async fn revoke_other_sessions(&self) -> Result<usize> {
        let response = self
            .request(Method::POST, REVOKE_OTHERS_PATH)
            .await?
            .send()
            .await?;
        let body: RevokeOthersResponse = self.check(response).await?.json().await?;
        Ok(body.revoked)
    }

    async fn change_password(&self, current: &str, new: &str) -> Result<PasswordChangeOutcome> {
        let payload = ChangePasswordRequest {
            current_password: current.to_string(),
            new_password: new.to_string(),
        };
        let response = self
            .request(Method::POST, CHANGE_PASSWORD_PATH)
            .await?
            .json(&payload)
            .send()
            .await?;
        let response = self.check(response).await?;
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(PasswordChangeOutcome::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn urlencode(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
