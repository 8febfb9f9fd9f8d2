// src/config.rs
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use serde::Deserialize;

use crate::chain::TxType;
use crate::feed::{AggregationPolicy, OutlierRule};
use crate::providers::SourceConfig;
use crate::retry::RetryPolicy;
use crate::types::{AggregationMethod, FeedQuery};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReporterConfig {
    pub chain: ChainConfig,
    #[serde(default)] pub reporting: ReportingConfig,
    #[serde(default)] pub gas: GasConfig,
    #[serde(default)] pub storage: StorageConfig,
    pub queries: Vec<QueryConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub oracle_address: String,
    /// Environment variable holding the hex signing key.
    #[serde(default = "d_key_env")] pub key_env: String,
}
fn d_key_env() -> String { "REPORTER_PRIVATE_KEY".into() }

impl ChainConfig {
    pub fn oracle(&self) -> Result<Address, ConfigError> {
        Address::from_str(self.oracle_address.trim())
            .map_err(|e| ConfigError::Invalid(format!("oracle_address {:?}: {e}", self.oracle_address)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    #[serde(default = "d_interval")]        pub reporting_interval_seconds: u64,
    #[serde(default = "d_quorum")]          pub min_quorum: usize,
    #[serde(default = "d_divergence")]      pub max_divergence_percent: f64,
    #[serde(default = "d_staleness")]       pub staleness_window_seconds: u64,
    #[serde(default = "d_escalation")]      pub gas_escalation_multiplier: f64,
    #[serde(default = "d_submit_retries")]  pub max_submit_retries: u32,
    #[serde(default = "d_fetch_timeout")]   pub fetch_timeout_ms: u64,
    #[serde(default = "d_fetch_deadline")]  pub fetch_deadline_ms: u64,
    #[serde(default)]                       pub aggregation: AggregationMethod,
    #[serde(default)]                       pub outlier: OutlierRule,
    #[serde(default)]                       pub min_stake_tokens: f64,
    #[serde(default = "d_receipt_poll")]    pub receipt_poll_ms: u64,
    #[serde(default = "d_drop_blocks")]     pub drop_after_blocks: u64,
    #[serde(default = "d_drop_secs")]       pub drop_after_seconds: u64,
    #[serde(default)]                       pub source_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::network")] pub network_retry: RetryPolicy,
    #[serde(default)]                       pub dry_run: bool,
}
fn d_interval() -> u64 { 60 }
fn d_quorum() -> usize { 2 }
fn d_divergence() -> f64 { 2.0 }
fn d_staleness() -> u64 { 120 }
fn d_escalation() -> f64 { 1.125 }
fn d_submit_retries() -> u32 { 5 }
fn d_fetch_timeout() -> u64 { 5_000 }
fn d_fetch_deadline() -> u64 { 12_000 }
fn d_receipt_poll() -> u64 { 2_000 }
fn d_drop_blocks() -> u64 { 25 }
fn d_drop_secs() -> u64 { 300 }

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            reporting_interval_seconds: d_interval(),
            min_quorum: d_quorum(),
            max_divergence_percent: d_divergence(),
            staleness_window_seconds: d_staleness(),
            gas_escalation_multiplier: d_escalation(),
            max_submit_retries: d_submit_retries(),
            fetch_timeout_ms: d_fetch_timeout(),
            fetch_deadline_ms: d_fetch_deadline(),
            aggregation: AggregationMethod::default(),
            outlier: OutlierRule::default(),
            min_stake_tokens: 0.0,
            receipt_poll_ms: d_receipt_poll(),
            drop_after_blocks: d_drop_blocks(),
            drop_after_seconds: d_drop_secs(),
            source_retry: RetryPolicy::default(),
            network_retry: RetryPolicy::network(),
            dry_run: false,
        }
    }
}

impl ReportingConfig {
    /// Stake threshold in wei (18-decimal token).
    pub fn min_stake(&self) -> U256 {
        crate::types::scale_to_fixed(self.min_stake_tokens.max(0.0), 18).unwrap_or(U256::ZERO)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    #[serde(default)]                 pub tx_type: TxType,
    #[serde(default = "d_gas_limit")] pub gas_limit: u64,
    /// Overrides the node's base fee estimate.
    #[serde(default)]                 pub base_fee_gwei: Option<f64>,
    /// Overrides the node's priority fee suggestion.
    #[serde(default)]                 pub priority_fee_gwei: Option<f64>,
    /// Escalation never goes beyond this.
    #[serde(default = "d_fee_cap")]   pub fee_cap_gwei: f64,
}
fn d_gas_limit() -> u64 { 350_000 }
fn d_fee_cap() -> f64 { 500.0 }

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            tx_type: TxType::default(),
            gas_limit: d_gas_limit(),
            base_fee_gwei: None,
            priority_fee_gwei: None,
            fee_cap_gwei: d_fee_cap(),
        }
    }
}

#[inline]
pub fn gwei(g: f64) -> u128 { (g.max(0.0) * 1e9).round() as u128 }

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "d_database_url")] pub database_url: String,
}
fn d_database_url() -> String { "sqlite://reports.db?mode=rwc".into() }

impl Default for StorageConfig {
    fn default() -> Self { Self { database_url: d_database_url() } }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    pub name: String,
    pub asset: String,
    pub currency: String,
    #[serde(default = "d_decimals")] pub decimals: u8,
    pub sources: Vec<SourceConfig>,
    /// Stop after this many cycles.
    #[serde(default)] pub report_count: Option<u32>,
    /// Backup mode: only report when the on-chain value is older than this...
    #[serde(default)] pub stale_timeout_seconds: Option<u64>,
    /// ...or has moved by more than this many percent.
    #[serde(default = "d_price_change")] pub max_price_change_percent: f64,
    #[serde(default)] pub reporting_interval_seconds: Option<u64>,
    #[serde(default)] pub min_quorum: Option<usize>,
    #[serde(default)] pub max_divergence_percent: Option<f64>,
}
fn d_decimals() -> u8 { 18 }
fn d_price_change() -> f64 { 0.5 }

impl QueryConfig {
    pub fn feed_query(&self) -> FeedQuery {
        FeedQuery::spot_price(self.name.clone(), &self.asset, &self.currency, self.decimals)
    }

    pub fn interval(&self, r: &ReportingConfig) -> Duration {
        Duration::from_secs(self.reporting_interval_seconds.unwrap_or(r.reporting_interval_seconds))
    }

    pub fn policy(&self, r: &ReportingConfig) -> AggregationPolicy {
        AggregationPolicy {
            method: r.aggregation,
            min_quorum: self.min_quorum.unwrap_or(r.min_quorum),
            max_divergence_percent: self.max_divergence_percent.unwrap_or(r.max_divergence_percent),
            staleness_window: Duration::from_secs(r.staleness_window_seconds),
            outlier: r.outlier,
        }
    }
}

impl ReporterConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let cfg: ReporterConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn query(&self, name: &str) -> Option<&QueryConfig> {
        self.queries.iter().find(|q| q.name == name)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |msg: String| Err(ConfigError::Invalid(msg));
        self.chain.oracle()?;
        let r = &self.reporting;
        if r.gas_escalation_multiplier <= 1.0 || !r.gas_escalation_multiplier.is_finite() {
            return bad(format!("gas_escalation_multiplier must be > 1, got {}", r.gas_escalation_multiplier));
        }
        if r.max_submit_retries == 0 {
            return bad("max_submit_retries must be at least 1".into());
        }
        if r.staleness_window_seconds == 0 || r.reporting_interval_seconds == 0 {
            return bad("staleness_window_seconds and reporting_interval_seconds must be positive".into());
        }
        if r.source_retry.max_attempts == 0 || r.network_retry.max_attempts == 0 {
            return bad("retry policies need at least one attempt".into());
        }
        if let AggregationMethod::TrimmedMean { trim_fraction } = r.aggregation {
            if !(0.0..0.5).contains(&trim_fraction) {
                return bad(format!("trim_fraction must be in [0, 0.5), got {trim_fraction}"));
            }
        }
        match r.outlier {
            OutlierRule::Percent { threshold } if threshold <= 0.0 => return bad("outlier threshold must be positive".into()),
            OutlierRule::Mad { k } if k <= 0.0 => return bad("outlier k must be positive".into()),
            _ => {}
        }
        if self.gas.fee_cap_gwei <= 0.0 {
            return bad("fee_cap_gwei must be positive".into());
        }
        if self.queries.is_empty() {
            return bad("no queries configured".into());
        }
        let mut seen = HashSet::new();
        for q in &self.queries {
            if !seen.insert(q.name.as_str()) {
                return bad(format!("duplicate query name {:?}", q.name));
            }
            let quorum = q.min_quorum.unwrap_or(r.min_quorum);
            if quorum == 0 {
                return bad(format!("{}: min_quorum must be at least 1", q.name));
            }
            if quorum > q.sources.len() {
                return bad(format!("{}: min_quorum {} exceeds {} configured sources", q.name, quorum, q.sources.len()));
            }
            let mut ids = HashSet::new();
            for s in &q.sources {
                if !ids.insert(s.id()) {
                    return bad(format!("{}: duplicate source id {:?}", q.name, s.id()));
                }
            }
        }
        Ok(())
    }
}
