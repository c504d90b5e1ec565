//! 实时通道状态机集成测试
//!
//! 使用内存连接器替代真实 WebSocket，时间在暂停模式下自动推进。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use url::Url;

use authlink::auth::StaticToken;
use authlink::realtime::{
    ChannelKind, CloseCode, ConnectionManager, ConnectionOptions, ConnectionSnapshot,
    ConnectionStatus, Connector, DeliveryMode, EventType, OutboundFrame, Poller,
    PollingFallback, RemoteEnd, TransportLink,
};
use authlink::{LinkError, Result};

#[derive(Debug, Clone, Copy)]
enum Plan {
    Accept,
    Refuse,
    Unauthorized,
    Forbidden,
    /// 握手一直挂起
    Hang,
}

/// 按脚本应答握手的连接器；脚本耗尽后一律拒绝
struct ScriptedConnector {
    plan: Mutex<VecDeque<Plan>>,
    attempts: AtomicUsize,
    urls: Mutex<Vec<Url>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl ScriptedConnector {
    fn new(plan: &[Plan]) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            plan: Mutex::new(plan.iter().copied().collect()),
            attempts: AtomicUsize::new(0),
            urls: Mutex::new(Vec::new()),
            remotes: tx,
        });
        (connector, rx)
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &Url) -> Result<TransportLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().push(url.clone());
        let step = self.plan.lock().pop_front().unwrap_or(Plan::Refuse);
        match step {
            Plan::Accept => {
                let (link, remote) = TransportLink::pair();
                let _ = self.remotes.send(remote);
                Ok(link)
            }
            Plan::Refuse => Err(LinkError::Transport("connection refused".to_string())),
            Plan::Unauthorized => Err(LinkError::Unauthorized("HTTP 401".to_string())),
            Plan::Forbidden => Err(LinkError::Forbidden("HTTP 403".to_string())),
            Plan::Hang => std::future::pending().await,
        }
    }
}

#[derive(Default)]
struct CountingPoller {
    polls: AtomicUsize,
}

#[async_trait]
impl Poller for CountingPoller {
    async fn poll(&self) -> Result<()> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn options() -> ConnectionOptions {
    let mut options = ConnectionOptions::new(
        ChannelKind::User,
        Url::parse("ws://localhost:8080/ws/notifications").unwrap(),
    );
    options.reconnect.base_delay = Duration::from_secs(5);
    options.reconnect.max_attempts = 3;
    options.poll_interval = Duration::from_secs(10);
    options
}

fn manager_with(
    options: ConnectionOptions,
    connector: &Arc<ScriptedConnector>,
    token: StaticToken,
) -> ConnectionManager {
    ConnectionManager::new(options, connector.clone(), Arc::new(token))
}

async fn wait_until<F>(manager: &ConnectionManager, mut predicate: F) -> ConnectionSnapshot
where
    F: FnMut(&ConnectionSnapshot) -> bool,
{
    let mut rx = manager.watch();
    let snapshot = tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|s| predicate(s)))
        .await
        .expect("state not reached in time")
        .expect("state channel closed")
        .clone();
    snapshot
}

async fn wait_status(manager: &ConnectionManager, status: ConnectionStatus) -> ConnectionSnapshot {
    wait_until(manager, |s| s.status == status).await
}

#[tokio::test(start_paused = true)]
async fn test_unauthenticated_never_opens_socket() {
    let (connector, _remotes) = ScriptedConnector::new(&[Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::none());

    manager.connect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(connector.attempts(), 0);
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(!snapshot.authenticated);
    assert_eq!(manager.delivery_mode(), DeliveryMode::Idle);

    // 未登录发送只记录警告
    assert!(manager.send_message("ping", Value::Null).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_send_before_connect_is_rejected_when_signed_in() {
    let (connector, _remotes) = ScriptedConnector::new(&[Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));

    assert!(!manager.snapshot().authenticated);
    assert!(matches!(
        manager.send_message("ping", Value::Null),
        Err(LinkError::NotConnected(_))
    ));
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_open_dispatches_events_in_order() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    manager.subscribe(EventType::Notification, move |event| {
        log.lock().push(format!("notification:{}", event.payload["id"]));
    });
    let log = seen.clone();
    manager.subscribe(EventType::Any, move |event| {
        log.lock().push(format!("any:{}", event.event_type));
    });

    manager.connect().await.unwrap();
    let snapshot = wait_status(&manager, ConnectionStatus::Open).await;
    assert!(snapshot.authenticated);
    assert_eq!(snapshot.stats.opened, 1);
    assert!(manager.is_connected());
    assert_eq!(manager.delivery_mode(), DeliveryMode::Realtime);

    let url = connector.urls.lock()[0].clone();
    assert_eq!(url.query(), Some("token=secret"));

    let mut remote = remotes.recv().await.unwrap();
    remote.push_text(r#"{"type":"notification","payload":{"id":1}}"#);
    remote.push_text("this is not json");
    remote.push_text(r#"{"payload":{"id":2}}"#);
    remote.push_text(r#"{"type":"case_updated","data":{"id":3}}"#);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        *seen.lock(),
        vec![
            "notification:1".to_string(),
            "any:notification".to_string(),
            "any:case_updated".to_string(),
        ]
    );
    assert_eq!(manager.status(), ConnectionStatus::Open);

    manager
        .send_message("mark_read", json!({"id": 1}))
        .unwrap();
    match remote.sent.recv().await.unwrap() {
        OutboundFrame::Text(text) => {
            let frame: Value = serde_json::from_str(&text).unwrap();
            assert_eq!(frame, json!({"type": "mark_read", "payload": {"id": 1}}));
        }
        other => panic!("unexpected frame: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_channel() {
    let (connector, _remotes) = ScriptedConnector::new(&[]);
    let mut opts = options();
    opts.enabled = false;
    let manager = manager_with(opts, &connector, StaticToken::new("secret"));

    manager.connect().await.unwrap();
    let snapshot = manager.snapshot();
    assert!(snapshot.authenticated);
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(connector.attempts(), 0);
    assert!(matches!(manager.delivery_mode(), DeliveryMode::Polling { .. }));

    let err = manager.send_message("ping", Value::Null).unwrap_err();
    assert!(matches!(err, LinkError::NotConnected(_)));
}

#[tokio::test(start_paused = true)]
async fn test_abnormal_close_reconnects() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept, Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    let remote = remotes.recv().await.unwrap();
    remote.close(CloseCode::ABNORMAL, "");

    let snapshot = wait_status(&manager, ConnectionStatus::Reconnecting).await;
    assert_eq!(snapshot.attempt, 1);
    assert_eq!(snapshot.last_close, Some(CloseCode::ABNORMAL));
    assert!(snapshot.last_error.is_some());
    assert_eq!(manager.delivery_mode(), DeliveryMode::Realtime);
    assert!(matches!(
        manager.send_message("ping", Value::Null),
        Err(LinkError::NotConnected(_))
    ));

    let snapshot = wait_status(&manager, ConnectionStatus::Open).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(snapshot.stats.opened, 2);
    assert_eq!(snapshot.stats.closed, 1);
    assert_eq!(snapshot.stats.reconnect_attempts, 1);
    assert_eq!(snapshot.attempt, 0);
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnects_fall_back_to_polling() {
    let (connector, _remotes) = ScriptedConnector::new(&[]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));
    let poller = Arc::new(CountingPoller::default());
    let fallback = PollingFallback::spawn(&manager, poller.clone());

    manager.connect().await.unwrap();
    let snapshot = wait_status(&manager, ConnectionStatus::Failed).await;

    // 首次连接 + 3 次重连
    assert_eq!(connector.attempts(), 4);
    assert_eq!(snapshot.attempt, 3);
    assert_eq!(snapshot.stats.reconnect_attempts, 3);
    assert_eq!(snapshot.last_close, Some(CloseCode::ABNORMAL));
    assert_eq!(
        manager.delivery_mode(),
        DeliveryMode::Polling {
            interval: Duration::from_secs(10)
        }
    );

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert!(poller.polls.load(Ordering::SeqCst) >= 2);
    assert_eq!(connector.attempts(), 4);

    manager.dispose();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(fallback.is_finished());
}

#[tokio::test(start_paused = true)]
async fn test_auth_close_signs_out_channel_without_retry() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept, Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    let remote = remotes.recv().await.unwrap();
    remote.close(CloseCode::AUTH_FAILED, "token expired");

    let snapshot = wait_until(&manager, |s| !s.authenticated).await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.last_close, Some(CloseCode::AUTH_FAILED));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(manager.delivery_mode(), DeliveryMode::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_new_attempt_forgets_previous_auth_close() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept, Plan::Hang, Plan::Hang, Plan::Hang]);
    let mut opts = options();
    opts.connect_timeout = Duration::from_secs(300);
    let manager = manager_with(opts, &connector, StaticToken::new("secret"));

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    remotes
        .recv()
        .await
        .unwrap()
        .close(CloseCode::AUTH_FAILED, "revoked");
    let snapshot = wait_until(&manager, |s| s.stats.auth_rejections == 1).await;
    assert_eq!(snapshot.last_close, Some(CloseCode::AUTH_FAILED));

    // 新的握手挂起期间主动断开
    manager.connect().await.unwrap();
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(snapshot.last_close, None);

    manager.disconnect();
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.last_close, None);
    assert_eq!(snapshot.stats.auth_rejections, 1);

    manager.reconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let snapshot = manager.snapshot();
    assert_eq!(snapshot.status, ConnectionStatus::Connecting);
    assert_eq!(snapshot.last_close, None);
    assert_eq!(snapshot.stats.auth_rejections, 1);
    assert!(connector.attempts() >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_forbidden_close_fails_without_retry() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept]);
    let mut opts = options();
    opts.kind = ChannelKind::Admin;
    let manager = manager_with(opts, &connector, StaticToken::new("secret"));

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    remotes
        .recv()
        .await
        .unwrap()
        .close(CloseCode::FORBIDDEN, "admin only");

    let snapshot = wait_status(&manager, ConnectionStatus::Failed).await;
    assert_eq!(snapshot.last_close, Some(CloseCode::FORBIDDEN));
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_handshake_rejections() {
    let (connector, _remotes) = ScriptedConnector::new(&[Plan::Unauthorized]);
    let manager = manager_with(options(), &connector, StaticToken::new("stale"));
    manager.connect().await.unwrap();
    let snapshot = wait_until(&manager, |s| !s.authenticated).await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.last_close, Some(CloseCode::AUTH_FAILED));

    let (connector, _remotes) = ScriptedConnector::new(&[Plan::Forbidden]);
    let manager = manager_with(options(), &connector, StaticToken::new("user"));
    manager.connect().await.unwrap();
    let snapshot = wait_status(&manager, ConnectionStatus::Failed).await;
    assert_eq!(snapshot.last_close, Some(CloseCode::FORBIDDEN));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_stays_disconnected() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept, Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    remotes
        .recv()
        .await
        .unwrap()
        .close(CloseCode::NORMAL, "bye");

    let snapshot = wait_until(&manager, |s| s.last_close == Some(CloseCode::NORMAL)).await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert!(snapshot.authenticated);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);

    // 可以再次连接
    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_while_reconnecting_stops_everything() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    manager.subscribe(EventType::Any, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    let remote = remotes.recv().await.unwrap();
    remote.close(CloseCode::ABNORMAL, "network");
    wait_status(&manager, ConnectionStatus::Reconnecting).await;

    manager.dispose();
    let snapshot = manager.snapshot();
    assert!(snapshot.disposed);
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(manager.subscriber_count(), 0);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    assert!(matches!(manager.connect().await, Err(LinkError::Disposed)));
    assert!(matches!(
        manager.send_message("ping", Value::Null),
        Err(LinkError::Disposed)
    ));
    // 重复销毁无副作用
    manager.dispose();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_sends_normal_close_and_keeps_subscribers() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept, Plan::Accept]);
    let manager = manager_with(options(), &connector, StaticToken::new("secret"));
    let subscription = manager.subscribe(EventType::Notification, |_| {});

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    let mut remote = remotes.recv().await.unwrap();

    manager.disconnect();
    assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    match remote.sent.recv().await.unwrap() {
        OutboundFrame::Close { code, .. } => assert_eq!(code, CloseCode::NORMAL),
        other => panic!("unexpected frame: {:?}", other),
    }
    assert_eq!(manager.subscriber_count(), 1);

    manager.reconnect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    assert_eq!(connector.attempts(), 2);

    assert!(manager.unsubscribe(&subscription));
    assert_eq!(manager.subscriber_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_pings_while_open() {
    let (connector, mut remotes) = ScriptedConnector::new(&[Plan::Accept]);
    let mut opts = options();
    opts.heartbeat_interval = Some(Duration::from_secs(30));
    let manager = manager_with(opts, &connector, StaticToken::new("secret"));

    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Open).await;
    let mut remote = remotes.recv().await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(31), remote.sent.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame, OutboundFrame::Text(r#"{"type":"ping"}"#.to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_exponential_backoff_timing() {
    let (connector, _remotes) = ScriptedConnector::new(&[]);
    let mut opts = options();
    opts.reconnect.strategy = authlink::realtime::BackoffStrategy::Exponential;
    opts.reconnect.base_delay = Duration::from_secs(1);
    opts.reconnect.max_delay = Duration::from_secs(3);
    opts.reconnect.max_attempts = 4;
    let manager = manager_with(opts, &connector, StaticToken::new("secret"));

    let started = tokio::time::Instant::now();
    manager.connect().await.unwrap();
    wait_status(&manager, ConnectionStatus::Failed).await;

    // 1 + 2 + 3 + 3 秒
    assert_eq!(started.elapsed().as_secs(), 9);
    assert_eq!(connector.attempts(), 5);
}
