// src/providers/fixed.rs
use std::time::Duration;

use async_trait::async_trait;

use super::{SourceClient, SourceError};
use crate::types::{DataPoint, FeedQuery};

/// Constant value, e.g. a pegged asset or a manual feed.
pub struct FixedSource {
    name: String,
    value: f64,
}

impl FixedSource {
    pub fn new(name: String, value: f64) -> Self { Self { name, value } }
}

#[async_trait]
impl SourceClient for FixedSource {
    fn id(&self) -> &str { &self.name }

    async fn fetch(&self, _query: &FeedQuery, _timeout: Duration) -> Result<DataPoint, SourceError> {
        Ok(DataPoint::new(self.name.clone(), self.value, chrono::Utc::now()))
    }
}
