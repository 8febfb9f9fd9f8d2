// src/types.rs
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use alloy::primitives::{keccak256, Bytes, B256, U256};
use alloy::sol_types::SolValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observation from one source, already normalized to the canonical unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub source_id: String,
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    pub confidence: Option<f64>, // optional weight, 1.0 when absent
}

impl DataPoint {
    pub fn new<S: Into<String>>(source_id: S, value: f64, observed_at: DateTime<Utc>) -> Self {
        Self { source_id: source_id.into(), value, observed_at, confidence: None }
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn weight(&self) -> f64 {
        match self.confidence {
            Some(w) if w.is_finite() && w > 0.0 => w,
            Some(_) => 0.0,
            None => 1.0,
        }
    }
}

/// Central-tendency statistic used by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AggregationMethod {
    Median,
    /// Drop `trim_fraction` of the sorted points from each end, average the rest.
    TrimmedMean { trim_fraction: f64 },
    /// Median where each point counts with its `confidence` weight.
    WeightedMedian,
}

impl Default for AggregationMethod {
    fn default() -> Self { AggregationMethod::Median }
}

impl fmt::Display for AggregationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregationMethod::Median => write!(f, "median"),
            AggregationMethod::TrimmedMean { trim_fraction } => write!(f, "trimmed_mean({trim_fraction})"),
            AggregationMethod::WeightedMedian => write!(f, "weighted_median"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedValue {
    pub value: f64,
    pub method: AggregationMethod,
    pub contributing_source_ids: BTreeSet<String>,
    pub computed_at: DateTime<Utc>,
    pub spread: f64, // (max-min)/value over contributors, in percent
}

/// A spot-price query as understood by the oracle contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedQuery {
    pub name: String,
    pub asset: String,
    pub currency: String,
    pub decimals: u8,
    pub id: B256,
    pub data: Bytes,
}

impl FeedQuery {
    /// `abi.encode("SpotPrice", abi.encode(asset, currency))`, id is its keccak256.
    pub fn spot_price<S: Into<String>>(name: S, asset: &str, currency: &str, decimals: u8) -> Self {
        let asset = asset.to_lowercase();
        let currency = currency.to_lowercase();
        let params = Bytes::from((asset.clone(), currency.clone()).abi_encode_params());
        let data = Bytes::from(("SpotPrice".to_string(), params).abi_encode_params());
        Self { name: name.into(), id: keccak256(&data), data, asset, currency, decimals }
    }

    pub fn encode_value(&self, value: f64) -> Result<Bytes, ValueError> {
        Ok(Bytes::from(scale_to_fixed(value, self.decimals)?.abi_encode()))
    }

    pub fn decode_value(&self, raw: &[u8]) -> Result<f64, ValueError> {
        let fixed = U256::abi_decode(raw, true).map_err(|e| ValueError::Decode(e.to_string()))?;
        from_fixed(fixed, self.decimals)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("invalid value {0}")]
    Invalid(f64),
    #[error("value {0} overflows fixed-point encoding")]
    Overflow(f64),
    #[error("cannot decode on-chain value: {0}")]
    Decode(String),
}

/// Fixed-point scaling of a canonical value, e.g. 1.5 with 18 decimals.
#[inline]
pub fn scale_to_fixed(value: f64, decimals: u8) -> Result<U256, ValueError> {
    if !value.is_finite() || value < 0.0 { return Err(ValueError::Invalid(value)); }
    // decimal formatting keeps the scaling exact for the printed digits
    let digits: String = format!("{:.*}", decimals as usize, value).chars().filter(|c| *c != '.').collect();
    U256::from_str_radix(&digits, 10).map_err(|_| ValueError::Overflow(value))
}

#[inline]
pub fn from_fixed(fixed: U256, decimals: u8) -> Result<f64, ValueError> {
    let raw: f64 = fixed.to_string().parse().map_err(|_| ValueError::Decode(fixed.to_string()))?;
    Ok(raw / 10f64.powi(decimals as i32))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptStatus {
    Pending,   // recorded, not yet accepted by the chain
    Submitted,
    Confirmed,
    Dropped,
    Failed,
    DryRun,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Submitted => "submitted",
            AttemptStatus::Confirmed => "confirmed",
            AttemptStatus::Dropped => "dropped",
            AttemptStatus::Failed => "failed",
            AttemptStatus::DryRun => "dry_run",
        }
    }

    /// Attempts that count as a report for interval gating.
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptStatus::Confirmed | AttemptStatus::DryRun)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptStatus::Pending | AttemptStatus::Submitted)
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for AttemptStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => AttemptStatus::Pending,
            "submitted" => AttemptStatus::Submitted,
            "confirmed" => AttemptStatus::Confirmed,
            "dropped" => AttemptStatus::Dropped,
            "failed" => AttemptStatus::Failed,
            "dry_run" => AttemptStatus::DryRun,
            other => return Err(format!("unknown attempt status {other:?}")),
        })
    }
}

/// What the loop hands to the log before anything touches the chain.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub query_id: B256,
    pub query_name: String,
    pub value: AggregatedValue,
    pub submitted_at: DateTime<Utc>,
    pub status: AttemptStatus,
}

/// Append-only log entry. Only `status`, `tx_hash` (once), `nonce`,
/// `replaced_hashes` and `error` change after insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportAttempt {
    pub id: u64,
    pub query_id: B256,
    pub query_name: String,
    pub value: AggregatedValue,
    pub submitted_at: DateTime<Utc>,
    pub tx_hash: Option<B256>,
    pub nonce: Option<u64>,
    pub replaced_hashes: Vec<B256>,
    pub status: AttemptStatus,
    pub error: Option<String>,
}
