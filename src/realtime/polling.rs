//! 轮询降级
//!
//! 实时通道被禁用或重连耗尽（Failed）时，按固定间隔调用 `Poller`；
//! 通道恢复 Open 或被销毁后自动停止。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::infra::metrics;

use super::connection_manager::{delivery_mode_for, ConnectionManager, ConnectionOptions};
use super::state::{ConnectionSnapshot, DeliveryMode};

/// 一次轮询（例如重新拉取通知列表）
#[async_trait]
pub trait Poller: Send + Sync + 'static {
    async fn poll(&self) -> Result<()>;
}

/// 轮询降级任务句柄；丢弃时停止
pub struct PollingFallback {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl PollingFallback {
    pub fn spawn(manager: &ConnectionManager, poller: Arc<dyn Poller>) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(
            manager.watch(),
            manager.options().clone(),
            poller,
            cancel.clone(),
        ));
        Self { cancel, handle }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn current_interval(
    state: &watch::Receiver<ConnectionSnapshot>,
    options: &ConnectionOptions,
) -> Option<Duration> {
    match delivery_mode_for(&state.borrow(), options) {
        DeliveryMode::Polling { interval } => Some(interval),
        _ => None,
    }
}

async fn run(
    mut state: watch::Receiver<ConnectionSnapshot>,
    options: ConnectionOptions,
    poller: Arc<dyn Poller>,
    cancel: CancellationToken,
) {
    let channel = options.kind.as_str();
    loop {
        if state.borrow().disposed {
            debug!("通道已销毁，停止轮询: channel={}", channel);
            return;
        }

        let period = match current_interval(&state, &options) {
            Some(period) => period,
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            }
        };

        info!("📡 切换到轮询: channel={}, interval={}s", channel, period.as_secs());
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = state.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if current_interval(&state, &options) != Some(period) {
                        debug!("结束轮询: channel={}", channel);
                        break;
                    }
                }
                _ = ticker.tick() => {
                    metrics::record_fallback_poll(channel);
                    if let Err(e) = poller.poll().await {
                        warn!("⚠️ 轮询失败: channel={}, error={}", channel, e);
                    }
                }
            }
        }
    }
}
