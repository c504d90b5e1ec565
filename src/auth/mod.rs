// 认证模块 - 提供登录态、会话管理接口与会话撤销协调

pub mod models;
pub mod session_api;
pub mod session_state;
pub mod token;
pub mod token_revocation;

// 重新导出主要类型
pub use models::{ChangePasswordRequest, PasswordChangeOutcome, SessionRecord};
pub use session_api::{HttpSessionApi, SessionApi};
pub use session_state::{RevocationReason, SessionEvent, SessionState};
pub use token::{AuthSession, StaticToken, TokenProvider};
pub use token_revocation::SessionRevocationCoordinator;
