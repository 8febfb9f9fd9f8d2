// src/providers/mod.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::retry::RetryPolicy;
use crate::types::{DataPoint, FeedQuery};

pub mod coingecko;
pub mod fixed;
pub mod json;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unparseable response: {0}")]
    Parse(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Parse(_))
    }

    pub(crate) fn from_http(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(timeout)
        } else if e.is_decode() {
            SourceError::Parse(e.to_string())
        } else {
            SourceError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    fn id(&self) -> &str;

    /// One normalized data point for `query`, or why there is none.
    async fn fetch(&self, query: &FeedQuery, timeout: Duration) -> Result<DataPoint, SourceError>;
}

/// Closed set of providers a query can be configured with.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    Coingecko {
        id: String,
        #[serde(default)] vs: Option<String>,
        #[serde(default = "coingecko::d_base_url")] base_url: String,
    },
    Json {
        name: String,
        /// `{asset}` and `{currency}` are substituted from the query.
        url: String,
        pointer: String,
        #[serde(default)] timestamp_pointer: Option<String>,
        #[serde(default = "d_scale")] scale: f64,
    },
    Fixed { name: String, value: f64 },
}
fn d_scale() -> f64 { 1.0 }

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(flatten)]  pub kind: SourceKind,
    #[serde(default)]  pub weight: Option<f64>,
    #[serde(default)]  pub retry: Option<RetryPolicy>,
}

impl SourceConfig {
    pub fn id(&self) -> &str {
        match &self.kind {
            SourceKind::Coingecko { .. } => "coingecko",
            SourceKind::Json { name, .. } | SourceKind::Fixed { name, .. } => name,
        }
    }

    /// Provider client wrapped in its own retry policy.
    pub fn build(&self, http: &reqwest::Client, default_retry: &RetryPolicy) -> Arc<dyn SourceClient> {
        let inner: Arc<dyn SourceClient> = match &self.kind {
            SourceKind::Coingecko { id, vs, base_url } => Arc::new(coingecko::CoinGecko {
                http: http.clone(),
                base_url: base_url.clone(),
                coin_id: id.clone(),
                vs: vs.clone(),
                weight: self.weight,
            }),
            SourceKind::Json { name, url, pointer, timestamp_pointer, scale } => Arc::new(json::JsonSource {
                http: http.clone(),
                name: name.clone(),
                url: url.clone(),
                pointer: pointer.clone(),
                timestamp_pointer: timestamp_pointer.clone(),
                scale: *scale,
                weight: self.weight,
            }),
            SourceKind::Fixed { name, value } => Arc::new(fixed::FixedSource::new(name.clone(), *value)),
        };
        Arc::new(Retrying { inner, policy: self.retry.unwrap_or(*default_retry) })
    }
}

/// Applies a per-source retry policy and a per-attempt timeout.
pub struct Retrying {
    pub inner: Arc<dyn SourceClient>,
    pub policy: RetryPolicy,
}

#[async_trait]
impl SourceClient for Retrying {
    fn id(&self) -> &str { self.inner.id() }

    async fn fetch(&self, query: &FeedQuery, timeout: Duration) -> Result<DataPoint, SourceError> {
        let inner = &self.inner;
        let attempt = move || async move {
            match tokio::time::timeout(timeout, inner.fetch(query, timeout)).await {
                Ok(res) => res,
                Err(_) => Err(SourceError::Timeout(timeout)),
            }
        };
        self.policy.run(self.inner.id(), attempt, SourceError::is_transient).await
    }
}

/// Parse a JSON number or numeric string.
pub(crate) fn as_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Unix timestamps in seconds or milliseconds.
pub(crate) fn as_timestamp(v: &serde_json::Value) -> Option<chrono::DateTime<chrono::Utc>> {
    let raw = as_f64(v)?;
    let ms = if raw > 1e12 { raw } else { raw * 1000.0 };
    chrono::DateTime::from_timestamp_millis(ms as i64)
}
