// src/providers/coingecko.rs
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{as_f64, as_timestamp, SourceClient, SourceError};
use crate::types::{DataPoint, FeedQuery};

pub(crate) fn d_base_url() -> String { "https://api.coingecko.com/api/v3".into() }

/// CoinGecko `simple/price`, one coin against one quote currency.
pub struct CoinGecko {
    pub http: reqwest::Client,
    pub base_url: String,
    pub coin_id: String,
    /// Quote currency; the query's currency when unset.
    pub vs: Option<String>,
    pub weight: Option<f64>,
}

#[async_trait]
impl SourceClient for CoinGecko {
    fn id(&self) -> &str { "coingecko" }

    async fn fetch(&self, query: &FeedQuery, timeout: Duration) -> Result<DataPoint, SourceError> {
        let vs = self.vs.clone().unwrap_or_else(|| query.currency.clone()).to_lowercase();
        let url = format!("{}/simple/price", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(url)
            .query(&[
                ("ids", self.coin_id.as_str()),
                ("vs_currencies", vs.as_str()),
                ("include_last_updated_at", "true"),
            ])
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SourceError::from_http(e, timeout))?;
        if !resp.status().is_success() {
            return Err(SourceError::Unavailable(format!("coingecko status {}", resp.status())));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| SourceError::from_http(e, timeout))?;

        let coin = body
            .get(&self.coin_id)
            .ok_or_else(|| SourceError::Parse(format!("no entry for {}", self.coin_id)))?;
        let price = coin
            .get(&vs)
            .and_then(as_f64)
            .ok_or_else(|| SourceError::Parse(format!("no {vs} price for {}", self.coin_id)))?;
        let observed_at = coin.get("last_updated_at").and_then(as_timestamp).unwrap_or_else(Utc::now);

        Ok(DataPoint::new(self.id(), price, observed_at).with_confidence(self.weight))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer) -> CoinGecko {
        CoinGecko {
            http: reqwest::Client::new(),
            base_url: server.base_url(),
            coin_id: "ethereum".into(),
            vs: None,
            weight: None,
        }
    }

    #[tokio::test]
    async fn test_reads_price_and_update_time() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/simple/price")
                    .query_param("ids", "ethereum")
                    .query_param("vs_currencies", "usd");
                then.status(200).json_body(json!({"ethereum": {"usd": 3150.25, "last_updated_at": 1_700_000_000}}));
            })
            .await;

        let q = FeedQuery::spot_price("eth-usd", "eth", "usd", 18);
        let p = client(&server).fetch(&q, Duration::from_secs(2)).await.unwrap();
        m.assert_async().await;
        assert_eq!(p.source_id, "coingecko");
        assert_eq!(p.value, 3150.25);
        assert_eq!(p.observed_at.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_missing_coin_is_parse_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/simple/price");
                then.status(200).json_body(json!({}));
            })
            .await;
        let q = FeedQuery::spot_price("eth-usd", "eth", "usd", 18);
        let err = client(&server).fetch(&q, Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, SourceError::Parse(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_is_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/simple/price");
                then.status(429);
            })
            .await;
        let q = FeedQuery::spot_price("eth-usd", "eth", "usd", 18);
        let err = client(&server).fetch(&q, Duration::from_secs(2)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
