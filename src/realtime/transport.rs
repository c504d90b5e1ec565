//! 传输层抽象
//!
//! `Connector` 负责建立一条双向文本帧链路；连接管理器只面向 `TransportLink`
//! 编程，测试中可以用内存实现替换真实的 WebSocket。

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::error::{LinkError, Result};

use super::state::CloseCode;

/// 从链路收到的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// 文本帧
    Text(String),
    /// 链路关闭（未收到关闭帧时以 1006 上报）
    Closed { code: CloseCode, reason: String },
}

/// 发往链路的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close { code: CloseCode, reason: String },
}

/// 一条已建立的链路
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

impl TransportLink {
    /// 创建一对互通的端点：返回 (客户端链路, 对端句柄)
    pub fn pair() -> (TransportLink, RemoteEnd) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            TransportLink {
                outbound: out_tx,
                inbound: in_rx,
            },
            RemoteEnd {
                sent: out_rx,
                events: in_tx,
            },
        )
    }
}

/// 链路的对端（内存连接器与测试使用）
pub struct RemoteEnd {
    /// 客户端发出的帧
    pub sent: mpsc::UnboundedReceiver<OutboundFrame>,
    /// 向客户端投递事件
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl RemoteEnd {
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.events.send(TransportEvent::Text(text.into())).is_ok()
    }

    pub fn close(&self, code: CloseCode, reason: impl Into<String>) -> bool {
        self.events
            .send(TransportEvent::Closed {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// 链路建立器
///
/// 握手被拒绝时返回 `Unauthorized` / `Forbidden`，其余失败返回可重试错误。
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<TransportLink>;
}

/// 基于 tokio-tungstenite 的 WebSocket 连接器
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    connect_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<TransportLink> {
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|e| LinkError::Configuration(format!("invalid websocket request: {}", e)))?;

        let (stream, _) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await??;
        debug!("🔌 WebSocket 握手完成: {}", redact(url));

        let (mut sink, mut source) = stream.split();
        let (link, remote) = TransportLink::pair();
        let RemoteEnd { mut sent, events } = remote;

        // 写任务：客户端帧 -> socket
        tokio::spawn(async move {
            while let Some(frame) = sent.recv().await {
                let message = match frame {
                    OutboundFrame::Text(text) => Message::Text(text.into()),
                    OutboundFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
                        code: WsCloseCode::from(code.0),
                        reason: reason.into(),
                    })),
                };
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    debug!("WebSocket 写入失败: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // 读任务：socket -> 客户端事件
        tokio::spawn(async move {
            let closed = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Text(text.as_str().to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if events.send(TransportEvent::Text(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => warn!("⚠️ 丢弃非 UTF-8 二进制帧 ({} bytes)", data.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) => TransportEvent::Closed {
                                code: CloseCode(u16::from(f.code)),
                                reason: f.reason.as_str().to_string(),
                            },
                            None => TransportEvent::Closed {
                                code: CloseCode::NORMAL,
                                reason: String::new(),
                            },
                        };
                    }
                    // tungstenite 自动回复 Ping
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        break TransportEvent::Closed {
                            code: CloseCode::ABNORMAL,
                            reason: e.to_string(),
                        }
                    }
                    None => {
                        break TransportEvent::Closed {
                            code: CloseCode::ABNORMAL,
                            reason: "stream ended".to_string(),
                        }
                    }
                }
            };
            let _ = events.send(closed);
        });

        Ok(link)
    }
}

/// 日志中隐藏查询参数里的凭证
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.query().is_some() {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, _)| (k.into_owned(), "***".to_string()))
            .collect();
        shown.query_pairs_mut().clear().extend_pairs(pairs);
    }
    shown.to_string()
}
