//! Share/pull round-trips against a live server.
//!
//! These tests need a running Redis with the SMA-X server scripts loaded,
//! and are ignored by default. Run with:
//! `cargo test --package smax --test roundtrip -- --ignored`

#![allow(clippy::disallowed_methods)]

use serial_test::serial;
use smax::{DataType, Shape, Smax, SmaxConfig, SmaxField, SmaxStruct, SmaxValue};

const TEST_TABLE: &str = "_test_";

async fn open() -> Smax {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let mut cfg = SmaxConfig::for_server("127.0.0.1");
    cfg.resilient_exit = false;
    Smax::connect(cfg).await.expect("connect to SMA-X")
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_scalar_roundtrip_with_meta() {
    let smax = open().await;

    smax.share(TEST_TABLE, "my_value", 2022i32).await.unwrap();

    let (value, meta) = smax
        .pull_with_meta(TEST_TABLE, "my_value", DataType::Int, 1)
        .await
        .unwrap();
    assert_eq!(value.as_i32(), Some(2022));
    assert_eq!(meta.store_type, DataType::Int);
    assert_eq!(meta.shape.sizes(), &[1]);
    assert!(meta.serial >= 1);
    assert!(meta.origin.contains(':'));

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_array_roundtrip() {
    let smax = open().await;

    smax.share(TEST_TABLE, "my_ints", vec![1i32, 2, 3])
        .await
        .unwrap();

    let value = smax
        .pull(TEST_TABLE, "my_ints", DataType::Int, 3)
        .await
        .unwrap();
    assert_eq!(value, SmaxValue::Int(vec![1, 2, 3]));

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_double_and_string_roundtrip() {
    let smax = open().await;

    smax.share(TEST_TABLE, "my_double", 3.14159265f64)
        .await
        .unwrap();
    let value = smax
        .pull(TEST_TABLE, "my_double", DataType::Double, 1)
        .await
        .unwrap();
    assert_eq!(value.as_f64(), Some(3.14159265));

    let strings = vec!["one two".to_string(), String::new(), "three".to_string()];
    smax.share(TEST_TABLE, "my_strings", strings.clone())
        .await
        .unwrap();
    let value = smax
        .pull(TEST_TABLE, "my_strings", DataType::Str, 3)
        .await
        .unwrap();
    assert_eq!(value, SmaxValue::Str(strings));

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_repeated_share_bumps_serial_not_value() {
    let smax = open().await;

    smax.share(TEST_TABLE, "stable", 11i32).await.unwrap();
    let (_, before) = smax
        .pull_with_meta(TEST_TABLE, "stable", DataType::Int, 1)
        .await
        .unwrap();

    smax.share(TEST_TABLE, "stable", 11i32).await.unwrap();
    let (value, after) = smax
        .pull_with_meta(TEST_TABLE, "stable", DataType::Int, 1)
        .await
        .unwrap();

    assert_eq!(value.as_i32(), Some(11));
    assert_eq!(after.serial, before.serial + 1);

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_missing_key_zero_fills() {
    let smax = open().await;

    let (value, meta) = smax
        .pull_with_meta(TEST_TABLE, "no_such_key_xyzzy", DataType::Int, 4)
        .await
        .unwrap();
    assert_eq!(value, SmaxValue::Int(vec![0; 4]));
    assert_eq!(meta.serial, 0);

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_multidimensional_share() {
    let smax = open().await;

    let shape = Shape::of(&[2, 3]).unwrap();
    smax.share_array(
        TEST_TABLE,
        "matrix",
        vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0],
        shape.clone(),
    )
    .await
    .unwrap();

    let (value, meta) = smax
        .pull_with_meta(TEST_TABLE, "matrix", DataType::Double, 6)
        .await
        .unwrap();
    assert_eq!(
        value,
        SmaxValue::Double(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
    );
    assert_eq!(meta.shape, shape);

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_struct_share_and_pull() {
    let smax = open().await;

    let mut sub = SmaxStruct::new();
    sub.set(SmaxField::new("leaf", 2.5f64));
    sub.set(SmaxField::new("flag", true));

    let mut top = SmaxStruct::new();
    top.set(SmaxField::new("count", 42i32));
    top.set(SmaxField::new("sub", SmaxValue::Struct(sub)));

    smax.share_struct("_test_struct", &top).await.unwrap();

    let (back, meta) = smax.pull_struct("_test_struct").await.unwrap();
    assert_eq!(back.field("count").unwrap().value.as_i32(), Some(42));

    let sub = back.field("sub").unwrap().value.as_struct().unwrap();
    assert_eq!(sub.field("leaf").unwrap().value.as_f64(), Some(2.5));
    assert_eq!(sub.field("flag").unwrap().value.as_bool(), Some(true));

    assert!(meta.timestamp.seconds > 0);

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_script_sha1_lookup() {
    let smax = open().await;

    let sha = smax.script_sha1("HGetWithMeta").await.unwrap();
    assert_eq!(sha.len(), 40);
    assert!(sha.chars().all(|c| c.is_ascii_hexdigit()));

    let err = smax.script_sha1("NoSuchScriptXyzzy").await.unwrap_err();
    assert!(matches!(err, smax::SmaxError::ScriptMissing(_)));

    smax.disconnect().await;
}

#[tokio::test]
#[serial]
#[ignore = "requires Redis with SMA-X scripts"]
async fn test_static_metadata() {
    let smax = open().await;

    smax.share(TEST_TABLE, "power", 1.0f64).await.unwrap();
    smax.set_units(TEST_TABLE, "power", "W").await.unwrap();
    smax.set_description(TEST_TABLE, "power", "forward power")
        .await
        .unwrap();

    assert_eq!(
        smax.get_units(TEST_TABLE, "power").await.unwrap().as_deref(),
        Some("W")
    );
    assert_eq!(
        smax.get_description(TEST_TABLE, "power")
            .await
            .unwrap()
            .as_deref(),
        Some("forward power")
    );

    let (ty, shape) = smax.pull_type_dimension(TEST_TABLE, "power").await.unwrap();
    assert_eq!(ty, DataType::Double);
    assert_eq!(shape.element_count(), 1);

    smax.disconnect().await;
}
