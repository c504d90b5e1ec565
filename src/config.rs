use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use url::Url;

use crate::infra::clock::SharedClock;
use crate::infra::kv_store::{FileStore, MemoryStore, SharedStore, SledStore};
use crate::realtime::{BackoffStrategy, ChannelKind, ConnectionOptions, ReconnectPolicy};
use crate::security::rate_limiter::{
    default_presets, RateLimitConfig, RateLimiter, DEFAULT_SWEEP_PROBABILITY,
};

/// 环境变量前缀
const ENV_PREFIX: &str = "AUTHLINK_";

/// 客户端配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerSection,
    pub realtime: RealtimeConfig,
    pub rate_limit: RateLimitSection,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// 服务端地址
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// REST 接口根地址
    pub base_url: String,
    /// WebSocket 根地址，未配置时由 base_url 推导（http -> ws, https -> wss）
    pub ws_base_url: Option<String>,
    /// HTTP 请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            ws_base_url: None,
            request_timeout_secs: 30,
        }
    }
}

/// 实时通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// 关闭时只使用轮询
    pub enabled: bool,
    pub user_path: String,
    pub admin_path: String,
    /// token 查询参数名
    pub token_param: String,
    pub reconnect_delay_secs: u64,
    pub max_reconnect_attempts: u32,
    pub backoff: BackoffStrategy,
    pub max_reconnect_delay_secs: u64,
    pub poll_interval_secs: u64,
    /// 轮询降级时请求的接口
    pub poll_path: String,
    pub connect_timeout_secs: u64,
    /// 应用层心跳间隔（秒），0 表示关闭
    pub heartbeat_interval_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_path: "/ws".to_string(),
            admin_path: "/ws/admin".to_string(),
            token_param: "token".to_string(),
            reconnect_delay_secs: 5,
            max_reconnect_attempts: 5,
            backoff: BackoffStrategy::Fixed,
            max_reconnect_delay_secs: 60,
            poll_interval_secs: 30,
            poll_path: "/api/notifications".to_string(),
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 30,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            strategy: self.backoff,
            base_delay: Duration::from_secs(self.reconnect_delay_secs),
            max_delay: Duration::from_secs(self.max_reconnect_delay_secs),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn path_for(&self, kind: ChannelKind) -> &str {
        match kind {
            ChannelKind::User => &self.user_path,
            ChannelKind::Admin => &self.admin_path,
        }
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// 每次记录时触发过期清扫的概率
    pub sweep_probability: f64,
    /// 是否把尝试记录写入本地存储
    pub persist_attempts: bool,
    /// 未命中预设时使用的配置
    pub default: RateLimitConfig,
    /// 按动作覆盖（与内置预设合并）
    pub presets: HashMap<String, RateLimitConfig>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            sweep_probability: DEFAULT_SWEEP_PROBABILITY,
            persist_attempts: true,
            default: RateLimitConfig::default(),
            presets: HashMap::new(),
        }
    }
}

/// 本地存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    File,
    Sled,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "file" => Ok(StorageBackend::File),
            "sled" => Ok(StorageBackend::Sled),
            other => bail!("未知的存储后端: {}（可选 memory, file, sled）", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// file 后端为 JSON 文件路径，sled 后端为目录
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::File,
            path: "./authlink-state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            file: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "配置文件格式错误")
    }

    /// 生成 TOML 文本
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("配置序列化失败")
    }

    /// 从环境变量合并（AUTHLINK_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        self.merge_from_vars(|name| env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    /// 从任意变量来源合并，`lookup` 接收去掉前缀的变量名
    pub fn merge_from_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: FromStr>(name: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.parse::<T>()
                .map_err(|e| anyhow::anyhow!("环境变量 {}{} 无效: {}", ENV_PREFIX, name, e))
        }

        // 服务端
        if let Some(v) = lookup("BASE_URL") {
            self.server.base_url = v;
        }
        if let Some(v) = lookup("WS_BASE_URL") {
            self.server.ws_base_url = Some(v);
        }

        // 实时通道
        if let Some(v) = lookup("REALTIME_ENABLED") {
            self.realtime.enabled = parse("REALTIME_ENABLED", v)?;
        }
        if let Some(v) = lookup("RECONNECT_DELAY_SECS") {
            self.realtime.reconnect_delay_secs = parse("RECONNECT_DELAY_SECS", v)?;
        }
        if let Some(v) = lookup("MAX_RECONNECT_ATTEMPTS") {
            self.realtime.max_reconnect_attempts = parse("MAX_RECONNECT_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("BACKOFF") {
            self.realtime.backoff = match v.to_ascii_lowercase().as_str() {
                "fixed" => BackoffStrategy::Fixed,
                "exponential" => BackoffStrategy::Exponential,
                other => bail!("环境变量 {}BACKOFF 无效: {}", ENV_PREFIX, other),
            };
        }
        if let Some(v) = lookup("POLL_INTERVAL_SECS") {
            self.realtime.poll_interval_secs = parse("POLL_INTERVAL_SECS", v)?;
        }

        // 限流
        if let Some(v) = lookup("SWEEP_PROBABILITY") {
            self.rate_limit.sweep_probability = parse("SWEEP_PROBABILITY", v)?;
        }

        // 存储
        if let Some(v) = lookup("STORAGE_BACKEND") {
            self.storage.backend = v.parse()?;
        }
        if let Some(v) = lookup("STORAGE_PATH") {
            self.storage.path = v;
        }

        // 日志
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.logging.format = Some(v);
        }
        if let Some(v) = lookup("LOG_FILE") {
            self.logging.file = Some(v);
        }

        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(base_url) = &cli.base_url {
            self.server.base_url = base_url.clone();
        }
        if let Some(ws_base_url) = &cli.ws_base_url {
            self.server.ws_base_url = Some(ws_base_url.clone());
        }
        if cli.no_realtime {
            self.realtime.enabled = false;
        }
        if let Some(backend) = cli.storage_backend {
            self.storage.backend = backend;
        }
        if let Some(path) = &cli.storage_path {
            self.storage.path = path.clone();
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = level;
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        // 1. 配置文件（未指定时尝试 authlink.toml）
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::new()
            }
        } else if Path::new("authlink.toml").exists() {
            info!("📄 从默认配置文件加载: authlink.toml");
            Self::from_toml_file("authlink.toml")?
        } else {
            Self::new()
        };

        // 2. 环境变量
        config.merge_from_env()?;

        // 3. 命令行参数
        config.merge_from_cli(cli);

        config.validate()?;
        Ok(config)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.base_url()?;
        self.ws_base_url()?;

        if self.server.request_timeout_secs == 0 {
            bail!("server.request_timeout_secs 必须大于 0");
        }

        let rt = &self.realtime;
        if rt.reconnect_delay_secs == 0 {
            bail!("realtime.reconnect_delay_secs 必须大于 0");
        }
        if rt.max_reconnect_delay_secs < rt.reconnect_delay_secs {
            bail!("realtime.max_reconnect_delay_secs 不能小于 reconnect_delay_secs");
        }
        if rt.poll_interval_secs == 0 {
            bail!("realtime.poll_interval_secs 必须大于 0");
        }
        if rt.connect_timeout_secs == 0 {
            bail!("realtime.connect_timeout_secs 必须大于 0");
        }
        for (name, path) in [("user_path", &rt.user_path), ("admin_path", &rt.admin_path)] {
            if !path.starts_with('/') {
                bail!("realtime.{} 必须以 / 开头: {}", name, path);
            }
        }
        if rt.token_param.trim().is_empty() {
            bail!("realtime.token_param 不能为空");
        }

        let rl = &self.rate_limit;
        validate_rate_limit("rate_limit.default", &rl.default)?;
        for (action, preset) in &rl.presets {
            validate_rate_limit(&format!("rate_limit.presets.{}", action), preset)?;
        }
        if !(0.0..=1.0).contains(&rl.sweep_probability) {
            bail!(
                "rate_limit.sweep_probability 必须在 0 到 1 之间: {}",
                rl.sweep_probability
            );
        }

        if self.storage.backend != StorageBackend::Memory && self.storage.path.trim().is_empty() {
            bail!("storage.path 不能为空");
        }

        Ok(())
    }

    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.server.base_url)
            .with_context(|| format!("server.base_url 无效: {}", self.server.base_url))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => bail!("server.base_url 协议必须是 http 或 https: {}", other),
        }
    }

    /// WebSocket 根地址
    pub fn ws_base_url(&self) -> Result<Url> {
        if let Some(raw) = &self.server.ws_base_url {
            let url = Url::parse(raw).with_context(|| format!("server.ws_base_url 无效: {}", raw))?;
            return match url.scheme() {
                "ws" | "wss" => Ok(url),
                other => bail!("server.ws_base_url 协议必须是 ws 或 wss: {}", other),
            };
        }

        let mut url = self.base_url()?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("无法从 base_url 推导 WebSocket 地址"))?;
        Ok(url)
    }

    /// 指定通道的连接参数
    pub fn connection_options(&self, kind: ChannelKind) -> Result<ConnectionOptions> {
        let rt = &self.realtime;
        let endpoint = self
            .ws_base_url()?
            .join(rt.path_for(kind))
            .with_context(|| format!("无效的通道路径: {}", rt.path_for(kind)))?;

        let mut options = ConnectionOptions::new(kind, endpoint);
        options.token_param = rt.token_param.clone();
        options.enabled = rt.enabled;
        options.reconnect = rt.reconnect_policy();
        options.poll_interval = Duration::from_secs(rt.poll_interval_secs);
        options.connect_timeout = Duration::from_secs(rt.connect_timeout_secs);
        options.heartbeat_interval =
            Some(Duration::from_secs(rt.heartbeat_interval_secs)).filter(|d| !d.is_zero());
        Ok(options)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// 创建本地存储
    pub fn build_store(&self) -> Result<SharedStore> {
        let store: SharedStore = match self.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::File => Arc::new(
                FileStore::open(&self.storage.path)
                    .with_context(|| format!("无法打开存储文件: {}", self.storage.path))?,
            ),
            StorageBackend::Sled => Arc::new(
                SledStore::open(&self.storage.path)
                    .with_context(|| format!("无法打开 sled 数据库: {}", self.storage.path))?,
            ),
        };
        Ok(store)
    }

    /// 创建限流器（内置预设 + 配置覆盖）
    pub fn build_rate_limiter(&self, store: Option<SharedStore>, clock: SharedClock) -> RateLimiter {
        let mut presets = default_presets();
        presets.extend(self.rate_limit.presets.clone());

        let mut builder = RateLimiter::builder()
            .clock(clock)
            .default_config(self.rate_limit.default)
            .presets(presets)
            .sweep_probability(self.rate_limit.sweep_probability);
        if let Some(store) = store.filter(|_| self.rate_limit.persist_attempts) {
            builder = builder.store(store);
        }
        builder.build()
    }
}

fn validate_rate_limit(name: &str, config: &RateLimitConfig) -> Result<()> {
    if config.max_attempts == 0 {
        bail!("{}.max_attempts 必须大于 0", name);
    }
    if config.time_window_ms == 0 {
        bail!("{}.time_window_ms 必须大于 0", name);
    }
    Ok(())
}
