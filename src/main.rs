use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use authlink::{
    auth::{AuthSession, HttpSessionApi, SessionRevocationCoordinator},
    cli::{Cli, Commands, SessionCommands},
    config::ClientConfig,
    infra::{metrics, system_clock},
    logging,
    realtime::{
        ChannelEvent, ChannelKind, ConnectionManager, EventType, Poller, PollingFallback,
        TungsteniteConnector,
    },
    security::{RateLimitGate, RateLimitHeaderSync},
    LinkError,
};
use tracing::{info, warn};
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    // 加载 .env 文件（如果存在）
    let _ = dotenvy::dotenv();

    // 解析命令行参数
    let cli = Cli::parse();

    // 不需要日志的子命令
    match &cli.command {
        Some(Commands::GenerateConfig { path }) => return generate_config(path),
        Some(Commands::ValidateConfig { path }) => return validate_config(path),
        _ => {}
    }

    // 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    let config = ClientConfig::load(&cli).context("加载配置失败")?;

    let _log_guard = logging::init_logging(
        &config.logging.level,
        config.logging.format.as_deref(),
        config.logging.file.as_deref(),
        cli.quiet,
    )?;

    if let Some(port) = cli.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        metrics::init(addr).map_err(|e| anyhow::anyhow!("启动指标端点失败: {}", e))?;
        info!("📈 Prometheus 指标: http://{}/metrics", addr);
    }

    let token = cli
        .token
        .clone()
        .or_else(|| std::env::var("AUTHLINK_TOKEN").ok());

    match cli.command {
        Some(Commands::ShowConfig) | None => show_config(&config),
        Some(Commands::Quota { url, fetch }) => quota(&config, token, &url, fetch).await,
        Some(Commands::Listen { admin }) => {
            let kind = if admin {
                ChannelKind::Admin
            } else {
                ChannelKind::User
            };
            listen(&config, token, kind).await
        }
        Some(Commands::Sessions { action }) => sessions(&config, token, action).await,
        Some(Commands::GenerateConfig { .. }) | Some(Commands::ValidateConfig { .. }) => Ok(()),
    }
}

/// 生成默认配置文件
fn generate_config(path: &str) -> Result<()> {
    let body = ClientConfig::default().to_toml_string()?;
    let content = format!(
        "# authlink 配置文件\n# 此文件由 authlink generate-config 生成\n\n{}",
        body
    );
    fs::write(path, content).with_context(|| format!("无法写入配置文件: {}", path))?;

    println!("✅ 配置文件已生成: {}", path);
    Ok(())
}

/// 验证配置文件
fn validate_config(path: &str) -> Result<()> {
    let config = ClientConfig::from_toml_file(path)
        .with_context(|| format!("配置文件验证失败: {}", path))?;
    config
        .validate()
        .with_context(|| format!("配置文件验证失败: {}", path))?;

    println!("✅ 配置文件有效: {}", path);
    println!("📊 配置摘要:");
    println!("  - Base URL: {}", config.server.base_url);
    println!("  - WebSocket: {}", config.ws_base_url()?);
    println!("  - Realtime: {}", config.realtime.enabled);
    println!(
        "  - Reconnect: {:?} {}s x{}",
        config.realtime.backoff,
        config.realtime.reconnect_delay_secs,
        config.realtime.max_reconnect_attempts
    );
    println!("  - Storage: {:?} ({})", config.storage.backend, config.storage.path);

    Ok(())
}

/// 显示最终配置（合并后的配置）
fn show_config(config: &ClientConfig) -> Result<()> {
    println!("📊 最终配置（合并后的配置）:");
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// 查看（或刷新）接口的配额快照
async fn quota(config: &ClientConfig, token: Option<String>, url: &str, fetch: bool) -> Result<()> {
    let store = config.build_store()?;
    let header_sync = RateLimitHeaderSync::new(store);

    if fetch {
        let target = config.base_url()?.join(url).context("无效的接口地址")?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let mut request = client.get(target.clone());
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(LinkError::from)?;
        info!("GET {} -> {}", target, response.status());
        if header_sync
            .sync_header_map(response.headers(), Some(target.path()))
            .is_none()
        {
            println!("⚠️ 响应中没有有效的 X-RateLimit-* 头");
        }
    }

    match header_sync.retrieve(Some(url)) {
        Some(quota) => {
            println!("📊 配额快照 ({}):", quota.scope);
            println!("  - Limit: {}", quota.limit);
            println!("  - Remaining: {}", quota.remaining);
            println!("  - Reset: {}", quota.reset);
            if let Some(retry_after) = quota.retry_after {
                println!("  - Retry-After: {}s", retry_after);
            }
        }
        None => println!("没有可用的配额快照: {}", url),
    }
    Ok(())
}

/// 轮询降级：定期请求配置中的轮询接口
struct HttpPoller {
    client: reqwest::Client,
    url: Url,
    auth: Arc<AuthSession>,
}

#[async_trait]
impl Poller for HttpPoller {
    async fn poll(&self) -> authlink::Result<()> {
        let token = self.auth.token().ok_or(LinkError::NotAuthenticated)?;
        let response = self
            .client
            .get(self.url.clone())
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?;
        let body = response.text().await?;
        println!("[poll] {}", body);
        Ok(())
    }
}

/// 连接实时通道并打印事件，直到 Ctrl-C
async fn listen(config: &ClientConfig, token: Option<String>, kind: ChannelKind) -> Result<()> {
    let Some(token) = token else {
        bail!("需要 --token 或 AUTHLINK_TOKEN");
    };
    let auth = Arc::new(AuthSession::signed_in(token, None));
    let options = config.connection_options(kind)?;
    let connector = Arc::new(TungsteniteConnector::new(options.connect_timeout));
    let manager = Arc::new(ConnectionManager::new(options, connector, auth.clone()));

    let api = HttpSessionApi::new(config.base_url()?, auth.clone(), config.request_timeout())?;
    let coordinator = Arc::new(SessionRevocationCoordinator::new(Arc::new(api), auth.clone()));
    coordinator.attach_channel(manager.clone());

    manager.subscribe(EventType::Any, |event: &ChannelEvent| {
        println!("[{}] {}", event.event_type, event.payload);
    });

    let poller = HttpPoller {
        client: reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?,
        url: config
            .base_url()?
            .join(&config.realtime.poll_path)
            .context("无效的 realtime.poll_path")?,
        auth: auth.clone(),
    };
    let _fallback = PollingFallback::spawn(&manager, Arc::new(poller));

    let mut state = manager.watch();
    manager.connect().await?;
    info!("👂 监听 {} 通道，Ctrl-C 退出", kind);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                info!(
                    "通道状态: {} (attempt={}, error={:?})",
                    snapshot.status, snapshot.attempt, snapshot.last_error
                );
                if !auth.is_authenticated() {
                    warn!("⚠️ 会话已失效，退出");
                    break;
                }
            }
        }
    }

    manager.dispose();
    Ok(())
}

/// 会话管理子命令
async fn sessions(config: &ClientConfig, token: Option<String>, action: SessionCommands) -> Result<()> {
    let Some(token) = token else {
        bail!("需要 --token 或 AUTHLINK_TOKEN");
    };
    let store = config.build_store()?;
    let clock = system_clock();
    let header_sync = Arc::new(RateLimitHeaderSync::with_clock(store.clone(), clock.clone()));
    let limiter = Arc::new(config.build_rate_limiter(Some(store), clock.clone()));
    let gate = Arc::new(RateLimitGate::new(limiter, header_sync.clone(), clock));

    let auth = Arc::new(AuthSession::signed_in(token, None));
    let api = HttpSessionApi::new(config.base_url()?, auth.clone(), config.request_timeout())?
        .with_header_sync(header_sync);
    let coordinator =
        SessionRevocationCoordinator::new(Arc::new(api), auth).with_rate_limit(gate);

    match action {
        SessionCommands::List => {
            let sessions = coordinator.refresh_sessions().await?;
            println!("{:<4} {:<36} {:<28} {}", "", "SESSION", "DEVICE", "LAST SEEN");
            for s in sessions {
                println!(
                    "{:<4} {:<36} {:<28} {}",
                    if s.is_current { "*" } else { "" },
                    s.session_id,
                    s.device_label,
                    s.last_seen_at.to_rfc3339()
                );
            }
        }
        SessionCommands::Revoke { session_id } => {
            coordinator.revoke_session(&session_id).await?;
            println!("✅ 已撤销会话: {}", session_id);
        }
        SessionCommands::RevokeOthers => {
            let count = coordinator.revoke_other_sessions().await?;
            println!("✅ 已退出其他 {} 个设备", count);
        }
    }
    Ok(())
}
