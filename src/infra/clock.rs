use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// 时间源抽象
///
/// 限流窗口和配额 TTL 都基于毫秒时间戳计算，测试时注入 [`ManualClock`] 推进时间。
pub trait Clock: Send + Sync {
    /// 当前 Unix 毫秒时间戳
    fn now_ms(&self) -> i64;

    /// 当前 Unix 秒
    fn now_secs(&self) -> i64 {
        self.now_ms().div_euclid(1000)
    }
}

/// 系统时钟
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 手动推进的时钟（测试 / 回放用）
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// 共享时钟句柄
pub type SharedClock = Arc<dyn Clock>;

/// 默认系统时钟句柄
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
