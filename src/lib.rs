// src/lib.rs
pub mod types;
pub mod config;
pub mod retry;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod providers;
pub mod feed;
pub mod chain;
pub mod tx;
pub mod report_log;
pub mod scheduler;
pub mod reporter;
pub mod service;
