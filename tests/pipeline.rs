// tests/pipeline.rs
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use httpmock::prelude::*;
use serde_json::json;

use feedwright::chain::{Chain, ChainError, FeeEstimate, OnChainValue, ReceiptStatus, ReportTx, StakeInfo};
use feedwright::config::ReporterConfig;
use feedwright::feed::{AggregateError, FeedAggregator};
use feedwright::report_log::{MemoryReportLog, ReportLog};
use feedwright::scheduler::SubmissionScheduler;
use feedwright::types::{AttemptStatus, NewAttempt};

/// Read-only chain: staked, otherwise unreachable.
struct Staked;

#[async_trait]
impl Chain for Staked {
    fn address(&self) -> Address { Address::ZERO }
    async fn sign_and_send(&self, _tx: &ReportTx) -> Result<B256, ChainError> { Err(ChainError::Network("offline".into())) }
    async fn receipt(&self, _hash: B256) -> Result<ReceiptStatus, ChainError> { Ok(ReceiptStatus::Pending) }
    async fn pending_nonce(&self) -> Result<u64, ChainError> { Ok(0) }
    async fn block_number(&self) -> Result<u64, ChainError> { Ok(0) }
    async fn fee_estimate(&self) -> Result<FeeEstimate, ChainError> { Ok(FeeEstimate { base_fee: 1, priority_fee: 1 }) }
    async fn native_balance(&self) -> Result<U256, ChainError> { Ok(U256::ZERO) }
    async fn stake_info(&self) -> Result<StakeInfo, ChainError> {
        Ok(StakeInfo { staked: U256::from(10u128.pow(20)), locked: U256::ZERO })
    }
    async fn report_count(&self, _query_id: B256) -> Result<U256, ChainError> { Ok(U256::ZERO) }
    async fn latest_value(&self, _query_id: B256) -> Result<Option<OnChainValue>, ChainError> { Ok(None) }
}

fn config(base: &str) -> ReporterConfig {
    let raw = format!(
        r#"
        [chain]
        rpc_url = "http://localhost:8545"
        chain_id = 1
        oracle_address = "0x8cFc184c877154a8F9ffE0fe75649dbe5e2DBEbf"

        [reporting]
        reporting_interval_seconds = 300
        min_quorum = 3
        max_divergence_percent = 1.0
        min_stake_tokens = 100
        source_retry = {{ max_attempts = 2, base_delay_ms = 1, max_delay_ms = 2 }}

        [[queries]]
        name = "btc-usd"
        asset = "BTC"
        currency = "USD"

        [[queries.sources]]
        kind = "json"
        name = "alpha"
        url = "{base}/alpha/{{asset}}-{{currency}}"
        pointer = "/data/price"

        [[queries.sources]]
        kind = "json"
        name = "beta"
        url = "{base}/beta?pair={{asset}}{{currency}}"
        pointer = "/last_cents"
        scale = 0.01

        [[queries.sources]]
        kind = "json"
        name = "gamma"
        url = "{base}/gamma"
        pointer = "/result/0/px"

        [[queries.sources]]
        kind = "fixed"
        name = "manual"
        value = 60010
        "#
    );
    ReporterConfig::from_toml_str(&raw).unwrap()
}

#[tokio::test]
async fn test_sources_to_gated_report() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/alpha/btc-usd");
            then.status(200).json_body(json!({ "data": { "price": "60000.5" } }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/beta").query_param("pair", "btcusd");
            then.status(200).json_body(json!({ "last_cents": 6_002_000 }));
        })
        .await;
    // a broken exchange quoting far off the market
    server
        .mock_async(|when, then| {
            when.method(GET).path("/gamma");
            then.status(200).json_body(json!({ "result": [{ "px": 91000.0 }] }));
        })
        .await;

    let cfg = config(&server.base_url());
    let q = cfg.query("btc-usd").unwrap();
    let query = q.feed_query();
    let http = reqwest::Client::new();

    let mut points = Vec::new();
    for src in &q.sources {
        let client = src.build(&http, &cfg.reporting.source_retry);
        points.push(client.fetch(&query, Duration::from_secs(2)).await.unwrap());
    }
    assert_eq!(points.len(), 4);

    let now = Utc::now();
    let agg = FeedAggregator::new(q.policy(&cfg.reporting)).aggregate(&points, now).unwrap();
    assert!(!agg.contributing_source_ids.contains("gamma"));
    assert_eq!(agg.contributing_source_ids.len(), 3);
    assert!((agg.value - 60010.0).abs() < 1e-6);

    let log: Arc<dyn ReportLog> = Arc::new(MemoryReportLog::new());
    let scheduler =
        SubmissionScheduler::new(log.clone(), Arc::new(Staked), q.interval(&cfg.reporting), cfg.reporting.min_stake());
    assert!(scheduler.check_eligibility(query.id, now).await.unwrap().eligible);

    log.append(NewAttempt {
        query_id: query.id,
        query_name: query.name.clone(),
        value: agg,
        submitted_at: now,
        status: AttemptStatus::DryRun,
    })
    .await
    .unwrap();
    let e = scheduler.check_eligibility(query.id, now + chrono::Duration::seconds(10)).await.unwrap();
    assert!(!e.eligible);
    assert_eq!(e.next_eligible_at, now + chrono::Duration::seconds(300));
}

#[tokio::test]
async fn test_outage_below_quorum_aborts() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/alpha/btc-usd");
            then.status(200).json_body(json!({ "data": { "price": 60000.0 } }));
        })
        .await;
    let beta = server
        .mock_async(|when, then| {
            when.method(GET).path("/beta");
            then.status(503);
        })
        .await;
    let gamma = server
        .mock_async(|when, then| {
            when.method(GET).path("/gamma");
            then.status(503);
        })
        .await;

    let cfg = config(&server.base_url());
    let q = cfg.query("btc-usd").unwrap();
    let query = q.feed_query();
    let http = reqwest::Client::new();

    let mut points = Vec::new();
    for src in q.sources.iter().filter(|s| s.id() != "manual") {
        if let Ok(p) = src.build(&http, &cfg.reporting.source_retry).fetch(&query, Duration::from_secs(2)).await {
            points.push(p);
        }
    }
    assert_eq!(points.len(), 1);
    // each failing source is tried twice before it is excluded
    beta.assert_hits_async(2).await;
    gamma.assert_hits_async(2).await;

    let err = FeedAggregator::new(q.policy(&cfg.reporting)).aggregate(&points, Utc::now()).unwrap_err();
    assert_eq!(err, AggregateError::InsufficientQuorum { have: 1, need: 3 });
}
