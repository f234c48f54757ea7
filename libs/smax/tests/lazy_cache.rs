//! Lazy cache behavior against a live server.
//!
//! Need a running Redis with the SMA-X server scripts loaded; run with
//! `cargo test --package smax --test lazy_cache -- --ignored`

#![allow(clippy::disallowed_methods)]

use std::time::Duration;

use serial_test::serial;
use smax::{DataType, Smax, SmaxConfig};

const TEST_TABLE: &str = "_test_";

async fn open() -> Smax {
    let mut cfg = SmaxConfig::for_server("127.0.0.1");
    cfg.resilient_exit = false;
    Smax::connect(cfg).await.expect("connect to SMA-X")
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_lazy_pull_observes_update() {
    let smax = open().await;

    smax.share(TEST_TABLE, "lazy_v", 0i32).await.unwrap();

    // Prime the mirror; repeated polls are served locally.
    for _ in 0..50 {
        let v = smax
            .lazy_pull(TEST_TABLE, "lazy_v", DataType::Int, 1)
            .await
            .unwrap();
        assert_eq!(v.as_i32(), Some(0));
    }
    // No update notification arrived, so the mirror saw no traffic.
    assert_eq!(smax.lazy_update_count(TEST_TABLE, "lazy_v"), Some(0));

    smax.share(TEST_TABLE, "lazy_v", 1i32).await.unwrap();

    // The update must become visible within a notification dispatch.
    let mut seen = 0;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let v = smax
            .lazy_pull(TEST_TABLE, "lazy_v", DataType::Int, 1)
            .await
            .unwrap();
        if v.as_i32() == Some(1) {
            seen = 1;
            break;
        }
    }
    assert_eq!(seen, 1, "lazy mirror never saw the update");
    assert!(smax.lazy_update_count(TEST_TABLE, "lazy_v").unwrap() >= 1);

    smax.lazy_end(TEST_TABLE, "lazy_v").await.unwrap();
    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_lazy_flush_forgets_mirrors() {
    let smax = open().await;

    smax.share(TEST_TABLE, "lazy_a", 1i32).await.unwrap();
    smax.share(TEST_TABLE, "lazy_b", 2i32).await.unwrap();

    smax.lazy_pull(TEST_TABLE, "lazy_a", DataType::Int, 1)
        .await
        .unwrap();
    smax.lazy_pull(TEST_TABLE, "lazy_b", DataType::Int, 1)
        .await
        .unwrap();

    assert_eq!(smax.lazy_flush().await, 2);
    assert_eq!(smax.lazy_update_count(TEST_TABLE, "lazy_a"), None);

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_lazy_cached_background_refresh() {
    let smax = open().await;

    smax.share(TEST_TABLE, "cached_v", 10i32).await.unwrap();
    smax.lazy_cache(TEST_TABLE, "cached_v", DataType::Int)
        .await
        .unwrap();

    let v = smax
        .get_lazy_cached(TEST_TABLE, "cached_v", DataType::Int, 1)
        .await
        .unwrap();
    assert_eq!(v.as_i32(), Some(10));

    smax.share(TEST_TABLE, "cached_v", 11i32).await.unwrap();

    // The always-cache mirror refreshes itself in the background.
    let mut current = 10;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let v = smax
            .get_lazy_cached(TEST_TABLE, "cached_v", DataType::Int, 1)
            .await
            .unwrap();
        if v.as_i32() == Some(11) {
            current = 11;
            break;
        }
    }
    assert_eq!(current, 11);

    smax.lazy_end(TEST_TABLE, "cached_v").await.unwrap();
    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_lazy_string_needs_no_explicit_meta() {
    let smax = open().await;

    smax.share(TEST_TABLE, "lazy_s", "hello world").await.unwrap();

    let v = smax
        .lazy_pull(TEST_TABLE, "lazy_s", DataType::Str, 1)
        .await
        .unwrap();
    assert_eq!(v.as_str(), Some("hello world"));

    smax.lazy_end(TEST_TABLE, "lazy_s").await.unwrap();
    smax.disconnect().await;
}
