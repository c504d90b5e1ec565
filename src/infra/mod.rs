// Infrastructure layer - 基础设施层
// 负责时间源、本地键值存储、事件总线与监控指标

pub mod clock;
pub mod event_bus;
pub mod kv_store;
pub mod metrics;

// 重新导出主要类型
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use event_bus::EventBus;
pub use kv_store::{FileStore, KeyValueStore, MemoryStore, SharedStore, SledStore};
