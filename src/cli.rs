use clap::{Parser, Subcommand};

use crate::config::StorageBackend;

// 确保 Parser trait 被使用
impl Cli {
    /// 解析命令行参数
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

/// authlink - 认证实时会话的客户端可靠性层
#[derive(Parser, Debug)]
#[command(name = "authlink")]
#[command(version)]
#[command(about = "限流配额查看、实时通道监听与会话撤销工具", long_about = None)]
pub struct Cli {
    /// 配置文件路径
    #[arg(long, value_name = "FILE", help = "指定配置文件路径", global = true)]
    pub config_file: Option<String>,

    /// REST 接口根地址
    #[arg(long, value_name = "URL", help = "服务端 REST 根地址", global = true)]
    pub base_url: Option<String>,

    /// WebSocket 根地址
    #[arg(long, value_name = "URL", help = "服务端 WebSocket 根地址", global = true)]
    pub ws_base_url: Option<String>,

    /// access token（也可通过 AUTHLINK_TOKEN 提供）
    #[arg(long, value_name = "TOKEN", help = "访问令牌", global = true)]
    pub token: Option<String>,

    /// 禁用实时通道，只使用轮询
    #[arg(long, help = "禁用实时通道", global = true)]
    pub no_realtime: bool,

    /// 存储后端
    #[arg(long, value_name = "BACKEND", value_parser = parse_backend, help = "存储后端: memory, file, sled", global = true)]
    pub storage_backend: Option<StorageBackend>,

    /// 存储路径
    #[arg(long, value_name = "PATH", help = "存储文件或目录路径", global = true)]
    pub storage_path: Option<String>,

    /// 日志级别
    #[arg(
        long,
        value_name = "LEVEL",
        help = "日志级别: trace, debug, info, warn, error",
        global = true
    )]
    pub log_level: Option<String>,

    /// 日志格式
    #[arg(long, value_name = "FORMAT", help = "日志格式: pretty, json, compact", global = true)]
    pub log_format: Option<String>,

    /// 日志文件路径
    #[arg(long, value_name = "PATH", help = "日志输出文件路径", global = true)]
    pub log_file: Option<String>,

    /// 监控端口
    #[arg(long, value_name = "PORT", help = "Prometheus 指标端口", global = true)]
    pub metrics_port: Option<u16>,

    /// 详细输出（可重复使用：-v, -vv, -vvv）
    #[arg(short, action = clap::ArgAction::Count, help = "详细输出级别", global = true)]
    pub verbose: u8,

    /// 静默模式
    #[arg(long, short = 'q', help = "静默模式（不输出日志）", global = true)]
    pub quiet: bool,

    /// 开发模式（等同于 --log-level debug --log-format pretty）
    #[arg(long, help = "启用开发模式", global = true)]
    pub dev: bool,

    /// 子命令
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 生成默认配置文件
    GenerateConfig {
        /// 输出文件路径
        #[arg(value_name = "PATH", default_value = "authlink.toml")]
        path: String,
    },
    /// 验证配置文件
    ValidateConfig {
        /// 配置文件路径
        #[arg(value_name = "PATH", default_value = "authlink.toml")]
        path: String,
    },
    /// 显示最终配置（合并后的配置）
    ShowConfig,
    /// 查看接口的服务端配额快照
    Quota {
        /// 接口地址（相对或绝对）
        #[arg(value_name = "URL")]
        url: String,
        /// 先请求一次接口以刷新快照
        #[arg(long)]
        fetch: bool,
    },
    /// 连接实时通道并打印收到的事件
    Listen {
        /// 连接管理员通道
        #[arg(long)]
        admin: bool,
    },
    /// 会话管理
    Sessions {
        #[command(subcommand)]
        action: SessionCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// 列出活跃会话
    List,
    /// 撤销指定会话
    Revoke {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },
    /// 退出其他所有设备
    RevokeOthers,
}

fn parse_backend(raw: &str) -> Result<StorageBackend, String> {
    raw.parse().map_err(|e: anyhow::Error| e.to_string())
}

impl Cli {
    /// 获取日志级别（考虑 verbose 和 quiet）
    pub fn get_log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }

        if self.dev {
            return Some("debug".to_string());
        }

        if let Some(level) = &self.log_level {
            return Some(level.clone());
        }

        // 根据 verbose 级别设置
        match self.verbose {
            0 => None, // 使用默认或配置文件
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// 获取日志格式
    pub fn get_log_format(&self) -> Option<String> {
        if self.dev {
            return Some("pretty".to_string());
        }
        self.log_format.clone()
    }
}
