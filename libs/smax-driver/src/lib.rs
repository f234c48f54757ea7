//! Redis channel plumbing for the SMA-X client.
//!
//! Provides the connection layer the higher-level `smax` crate builds on:
//! a lockable interactive request/response channel, a dedicated pipeline
//! connection for bulk reads, and a pub/sub task that fans incoming
//! messages out to registered subscriber callbacks.

pub mod client;
pub mod config;
pub mod error;
pub mod pubsub;

pub use client::{Driver, InteractiveGuard};
pub use config::{DriverConfig, RedisServer, TlsOptions};
pub use error::{DriverError, Result};
pub use pubsub::SubscriberCall;
