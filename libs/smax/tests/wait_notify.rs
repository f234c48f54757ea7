//! Update-notification waits against a live server.
//!
//! Need a running Redis with the SMA-X server scripts loaded; run with
//! `cargo test --package smax --test wait_notify -- --ignored`

#![allow(clippy::disallowed_methods)]

use std::time::Duration;

use serial_test::serial;
use smax::{Smax, SmaxConfig, SmaxError};

const TEST_TABLE: &str = "_test_";

async fn open() -> Smax {
    let mut cfg = SmaxConfig::for_server("127.0.0.1");
    cfg.resilient_exit = false;
    Smax::connect(cfg).await.expect("connect to SMA-X")
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_wait_on_group_sees_writer() {
    let smax = open().await;
    smax.subscribe(TEST_TABLE, "wv").await.unwrap();

    let writer = smax.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        writer.share(TEST_TABLE, "wv", 1i32).await.unwrap();
    });

    let key = smax
        .wait_on_subscribed_group(TEST_TABLE, Some(Duration::from_secs(3)))
        .await
        .unwrap();
    assert_eq!(key, "wv");

    smax.unsubscribe(TEST_TABLE, "wv").await.unwrap();
    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_wait_on_specific_variable() {
    let smax = open().await;
    smax.subscribe(TEST_TABLE, "specific").await.unwrap();

    let writer = smax.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        writer.share(TEST_TABLE, "specific", 5i32).await.unwrap();
    });

    smax.wait_on_subscribed(TEST_TABLE, "specific", Some(Duration::from_secs(3)))
        .await
        .unwrap();

    smax.unsubscribe(TEST_TABLE, "specific").await.unwrap();
    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_release_waits_interrupts() {
    let smax = open().await;
    smax.subscribe(TEST_TABLE, "never_written").await.unwrap();

    let releaser = smax.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        releaser.release_waits();
    });

    let err = smax
        .wait_on_any_subscribed(Some(Duration::from_secs(3)))
        .await
        .unwrap_err();
    assert_eq!(err, SmaxError::Interrupted);

    smax.unsubscribe(TEST_TABLE, "never_written").await.unwrap();
    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_wait_times_out() {
    let smax = open().await;
    smax.subscribe(TEST_TABLE, "quiet").await.unwrap();

    let err = smax
        .wait_on_subscribed(TEST_TABLE, "quiet", Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert_eq!(err, SmaxError::Timeout);

    smax.unsubscribe(TEST_TABLE, "quiet").await.unwrap();
    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_program_message_roundtrip() {
    let smax = open().await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let id = smax
        .add_message_processor(None, None, Some("info"), move |m| {
            let _ = tx.send((m.prog.clone(), m.text.clone()));
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    smax.send_info("hello out there").await.unwrap();

    let (_, text) = tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("message delivery timed out")
        .expect("channel closed");
    assert_eq!(text, "hello out there");

    smax.remove_message_processor(id).await.unwrap();
    smax.disconnect().await;
}
