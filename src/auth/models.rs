use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 活跃会话（设备）列表项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default)]
    pub device_label: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub is_current: bool,
}

/// 会话列表响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionRecord>,
}

/// 批量撤销响应
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RevokeOthersResponse {
    pub revoked: usize,
}

/// 修改密码请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// 修改密码结果
///
/// 服务端使其他会话失效；如果为当前设备重新签发了 token，则通过 `access_token` 返回。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordChangeOutcome {
    #[serde(default)]
    pub revoked_sessions: usize,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl PasswordChangeOutcome {
    /// 当前设备是否需要重新登录
    pub fn requires_reauth(&self) -> bool {
        self.access_token.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_record_from_json() {
        let json = r#"{
            "sessionId": "s-1",
            "deviceLabel": "Firefox on Linux",
            "createdAt": "2026-01-01T00:00:00Z",
            "lastSeenAt": "2026-01-02T08:30:00Z",
            "isCurrent": true
        }"#;
        let record: SessionRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.session_id, "s-1");
        assert!(record.is_current);
        assert!(record.ip_address.is_none());
        assert!(record.last_seen_at > record.created_at);
    }

    #[test]
    fn test_password_change_outcome_defaults() {
        let outcome: PasswordChangeOutcome = serde_json::from_str("{}").unwrap();
        assert_eq!(outcome.revoked_sessions, 0);
        assert!(outcome.requires_reauth());

        let outcome: PasswordChangeOutcome =
            serde_json::from_str(r#"{"revokedSessions":2,"accessToken":"t"}"#).unwrap();
        assert_eq!(outcome.revoked_sessions, 2);
        assert!(!outcome.requires_reauth());
    }
}
