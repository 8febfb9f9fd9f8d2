// src/providers/json.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{as_f64, as_timestamp, SourceClient, SourceError};
use crate::types::{DataPoint, FeedQuery};

/// Any HTTP endpoint returning JSON. The value is located with a JSON pointer
/// (RFC 6901) and multiplied by `scale` to bring provider units (cents, 1e-8
/// fixed point) to the canonical unit.
pub struct JsonSource {
    pub http: reqwest::Client,
    pub name: String,
    pub url: String,
    pub pointer: String,
    pub timestamp_pointer: Option<String>,
    pub scale: f64,
    pub weight: Option<f64>,
}

impl JsonSource {
    fn url_for(&self, query: &FeedQuery) -> String {
        self.url.replace("{asset}", &query.asset).replace("{currency}", &query.currency)
    }
}

#[async_trait]
impl SourceClient for JsonSource {
    fn id(&self) -> &str { &self.name }

    async fn fetch(&self, query: &FeedQuery, timeout: Duration) -> Result<DataPoint, SourceError> {
        let resp = self
            .http
            .get(self.url_for(query))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SourceError::from_http(e, timeout))?;
        if !resp.status().is_success() {
            return Err(SourceError::Unavailable(format!("{} status {}", self.name, resp.status())));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| SourceError::from_http(e, timeout))?;

        let raw = body
            .pointer(&self.pointer)
            .and_then(as_f64)
            .ok_or_else(|| SourceError::Parse(format!("{}: nothing numeric at {}", self.name, self.pointer)))?;
        let value = raw * self.scale;
        if !value.is_finite() {
            return Err(SourceError::Parse(format!("{}: non-finite value {value}", self.name)));
        }
        let observed_at = match &self.timestamp_pointer {
            Some(ptr) => body
                .pointer(ptr)
                .and_then(as_timestamp)
                .ok_or_else(|| SourceError::Parse(format!("{}: no timestamp at {ptr}", self.name)))?,
            None => Utc::now(),
        };

        Ok(DataPoint::new(self.name.clone(), value, observed_at).with_confidence(self.weight))
    }
}
