//! 滑动窗口限流集成测试

use std::sync::Arc;

use authlink::infra::{FileStore, ManualClock, MemoryStore, SharedClock, SharedStore};
use authlink::security::{RateLimitConfig, RateLimiter};

const START_MS: i64 = 1_700_000_000_000;

fn limiter(clock: &ManualClock, store: Option<SharedStore>) -> RateLimiter {
    let shared: SharedClock = Arc::new(clock.clone());
    let mut builder = RateLimiter::builder()
        .clock(shared)
        .default_config(RateLimitConfig::new(3, 60_000))
        .sweep_probability(0.0);
    if let Some(store) = store {
        builder = builder.store(store);
    }
    builder.build()
}

#[test]
fn test_window_exhausts_and_expires() {
    let clock = ManualClock::new(START_MS);
    let limiter = limiter(&clock, None);
    let config = RateLimitConfig::new(3, 60_000);

    for _ in 0..3 {
        assert!(!limiter.is_limited("login", Some("alice"), &config));
        limiter.record_attempt("login", Some("alice"), Some(&config));
        clock.advance_ms(1_000);
    }
    assert!(limiter.is_limited("login", Some("alice"), &config));

    let status = limiter.get_status("login", Some("alice"), Some(&config));
    assert!(!status.allowed);
    assert_eq!(status.remaining, 0);
    assert_eq!(status.reset_time, START_MS + 60_000);
    assert!(status.message.is_some());

    // 第一条记录滑出窗口后恢复一次额度
    clock.set_ms(START_MS + 60_001);
    assert!(!limiter.is_limited("login", Some("alice"), &config));
    let status = limiter.get_status("login", Some("alice"), Some(&config));
    assert!(status.allowed);
    assert_eq!(status.remaining, 1);
    assert_eq!(status.reset_time, START_MS + 1_000 + 60_000);
}

#[test]
fn test_get_status_never_records() {
    let clock = ManualClock::new(START_MS);
    let limiter = limiter(&clock, None);

    for _ in 0..10 {
        let status = limiter.get_status("signup", None, None);
        assert!(status.allowed);
        assert_eq!(status.remaining, 3);
        assert_eq!(status.reset_time, START_MS);
    }
    assert!(limiter.tracked_keys().is_empty());
}

#[test]
fn test_identifiers_are_isolated() {
    let clock = ManualClock::new(START_MS);
    let limiter = limiter(&clock, None);
    let config = RateLimitConfig::new(1, 60_000);

    limiter.record_attempt("login", Some("alice"), Some(&config));
    assert!(limiter.is_limited("login", Some("alice"), &config));
    assert!(!limiter.is_limited("login", Some("bob"), &config));
    assert!(!limiter.is_limited("login", None, &config));
    assert!(!limiter.is_limited("signup", Some("alice"), &config));

    // 空字符串与未提供 identifier 是两个桶
    limiter.record_attempt("login", Some(""), Some(&config));
    assert!(limiter.is_limited("login", Some(""), &config));
    assert!(!limiter.is_limited("login", None, &config));

    limiter.reset("login", Some("alice"));
    assert!(!limiter.is_limited("login", Some("alice"), &config));
    assert!(limiter.is_limited("login", Some(""), &config));
}

#[test]
fn test_presets_apply_per_action() {
    let clock = ManualClock::new(START_MS);
    let shared: SharedClock = Arc::new(clock.clone());
    let limiter = RateLimiter::builder()
        .clock(shared)
        .preset("passwordReset", RateLimitConfig::new(1, 3_600_000))
        .sweep_probability(0.0)
        .build();

    limiter.record_attempt("passwordReset", Some("a@example.com"), None);
    assert!(!limiter.get_status("passwordReset", Some("a@example.com"), None).allowed);

    limiter.record_attempt("comment", None, None);
    let status = limiter.get_status("comment", None, None);
    assert!(status.allowed);
    assert_eq!(status.remaining, 4);
}

#[test]
fn test_cleanup_expired_keeps_live_records() {
    let clock = ManualClock::new(START_MS);
    let limiter = limiter(&clock, None);

    limiter.record_attempt("old", None, None);
    clock.advance_ms(50_000);
    limiter.record_attempt("fresh", None, None);
    clock.advance_ms(20_000);

    assert_eq!(limiter.cleanup_expired(), 1);
    assert_eq!(limiter.tracked_keys(), vec!["fresh".to_string()]);
    assert_eq!(limiter.get_status("fresh", None, None).remaining, 2);
}

#[test]
fn test_always_sweeping_never_drops_live_timestamps() {
    let clock = ManualClock::new(START_MS);
    let shared: SharedClock = Arc::new(clock.clone());
    let limiter = RateLimiter::builder()
        .clock(shared)
        .default_config(RateLimitConfig::new(5, 10_000))
        .sweep_probability(1.0)
        .build();

    for i in 0..4 {
        limiter.record_attempt("a", None, None);
        limiter.record_attempt("b", Some(&i.to_string()), None);
        clock.advance_ms(1_000);
    }
    assert_eq!(limiter.get_status("a", None, None).remaining, 1);
}

#[test]
fn test_attempts_survive_restart_in_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let clock = ManualClock::new(START_MS);
    let config = RateLimitConfig::new(2, 60_000);

    {
        let store: SharedStore = Arc::new(FileStore::open(&path).unwrap());
        let limiter = limiter(&clock, Some(store));
        limiter.record_attempt("login", Some("alice"), Some(&config));
        limiter.record_attempt("login", Some("alice"), Some(&config));
        assert!(limiter.is_limited("login", Some("alice"), &config));
    }

    let store: SharedStore = Arc::new(FileStore::open(&path).unwrap());
    let limiter = limiter(&clock, Some(store.clone()));
    assert!(limiter.is_limited("login", Some("alice"), &config));

    limiter.reset("login", Some("alice"));
    assert!(store
        .keys_with_prefix("rate_limit_attempts_")
        .unwrap()
        .is_empty());
}

#[test]
fn test_store_failures_do_not_break_limiting() {
    let clock = ManualClock::new(START_MS);
    // 配额过小，任何写入都会失败
    let store: SharedStore = Arc::new(MemoryStore::with_quota(4));
    let limiter = limiter(&clock, Some(store));
    let config = RateLimitConfig::new(1, 60_000);

    limiter.record_attempt("login", None, Some(&config));
    assert!(limiter.is_limited("login", None, &config));
}

#[test]
fn test_legacy_window_alias() {
    let config: RateLimitConfig =
        serde_json::from_str(r#"{"maxAttempts": 4, "windowMs": 30000}"#).unwrap();
    assert_eq!(config, RateLimitConfig::new(4, 30_000));
    assert_eq!(
        serde_json::to_value(config).unwrap(),
        serde_json::json!({"maxAttempts": 4, "timeWindowMs": 30000})
    );
}

#[test]
fn test_wider_query_window_sees_earlier_attempts() {
    let clock = ManualClock::new(START_MS);
    let limiter = limiter(&clock, None);
    let short = RateLimitConfig::new(3, 10_000);
    let long = RateLimitConfig::new(3, 60_000);

    limiter.record_attempt("login", None, Some(&short));
    limiter.record_attempt("login", None, Some(&short));
    clock.advance_ms(20_000);
    limiter.record_attempt("login", None, Some(&short));

    // 短窗口内只有最后一次
    assert!(!limiter.is_limited("login", None, &short));
    assert!(limiter.is_limited("login", None, &long));
    assert_eq!(limiter.get_status("login", None, Some(&long)).remaining, 0);

    // 查询过的长窗口同样约束清扫
    clock.advance_ms(15_000);
    assert_eq!(limiter.cleanup_expired(), 0);
    assert!(limiter.is_limited("login", None, &long));
}
