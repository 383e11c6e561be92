//! # jobcast
//!
//! Message-driven job tracker over a publish/subscribe transport.
//!
//! Inbound TOML messages become uniquely identified jobs. The engine guards
//! against duplicate and concurrent re-processing, hands each job to a
//! caller-supplied [`engine::Processor`], and publishes the result. Jobs live
//! in a bounded in-memory store with age- and capacity-based eviction.

pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod policy;
pub mod store;
pub mod telemetry;
pub mod transport;
