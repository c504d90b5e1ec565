pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod logging;
pub mod realtime;
pub mod security; // 限流模块

pub use auth::{AuthSession, SessionRevocationCoordinator, TokenProvider};
pub use config::ClientConfig;
pub use error::{LinkError, Result};
pub use realtime::{ChannelContext, ConnectionManager, ConnectionStatus, RealtimeChannel};
pub use security::{RateLimitGate, RateLimitHeaderSync, RateLimiter};
