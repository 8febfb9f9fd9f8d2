// src/chain/mod.rs
use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub mod evm;
#[cfg(test)]
pub mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Legacy,
    #[default]
    Eip1559,
}

/// Fee fields attached to one signed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fees {
    Legacy { gas_price: u128 },
    Eip1559 { max_fee: u128, priority_fee: u128 },
}

impl Fees {
    /// The number the network compares replacements on.
    pub fn ceiling(&self) -> u128 {
        match *self {
            Fees::Legacy { gas_price } => gas_price,
            Fees::Eip1559 { max_fee, .. } => max_fee,
        }
    }
}

/// `submitValue(queryId, value, nonce, queryData)` plus everything needed to sign it.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportTx {
    pub query_id: B256,
    pub value: Bytes,
    pub report_nonce: U256,
    pub query_data: Bytes,
    pub nonce: u64,
    pub gas_limit: u64,
    pub fees: Fees,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Pending,
    Confirmed { block: u64 },
    Failed { block: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub base_fee: u128,
    pub priority_fee: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeInfo {
    pub staked: U256,
    pub locked: U256,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnChainValue {
    pub value: Bytes,
    pub reported_at: DateTime<Utc>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ChainError {
    #[error("transaction underpriced: {0}")]
    Underpriced(String),
    #[error("replacement transaction underpriced: {0}")]
    ReplacementUnderpriced(String),
    #[error("nonce too low: {0}")]
    NonceTooLow(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("execution reverted: {0}")]
    Reverted(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("rpc error: {0}")]
    Rpc(String),
}

impl ChainError {
    /// Map a node's error message onto the taxonomy the transaction manager acts on.
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        let msg = message.to_string();
        if m.contains("replacement transaction underpriced") || m.contains("replacement fee too low") {
            ChainError::ReplacementUnderpriced(msg)
        } else if m.contains("underpriced") || m.contains("fee too low") || m.contains("less than block base fee") {
            ChainError::Underpriced(msg)
        } else if m.contains("nonce too low") || m.contains("nonce has already been used") {
            ChainError::NonceTooLow(msg)
        } else if m.contains("insufficient funds") {
            ChainError::InsufficientFunds(msg)
        } else if m.contains("revert") {
            ChainError::Reverted(msg)
        } else if m.contains("timeout") || m.contains("timed out") || m.contains("connection") || m.contains("rate limit") {
            ChainError::Network(msg)
        } else {
            ChainError::Rpc(msg)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Network(_))
    }

    pub fn is_underpriced(&self) -> bool {
        matches!(self, ChainError::Underpriced(_) | ChainError::ReplacementUnderpriced(_))
    }
}

/// Everything the reporter needs from one signing account on one chain.
#[async_trait]
pub trait Chain: Send + Sync {
    fn address(&self) -> Address;

    /// Sign with the account key and broadcast; the hash is known before the node answers.
    async fn sign_and_send(&self, tx: &ReportTx) -> Result<B256, ChainError>;
    async fn receipt(&self, hash: B256) -> Result<ReceiptStatus, ChainError>;

    async fn pending_nonce(&self) -> Result<u64, ChainError>;
    async fn block_number(&self) -> Result<u64, ChainError>;
    async fn fee_estimate(&self) -> Result<FeeEstimate, ChainError>;
    async fn native_balance(&self) -> Result<U256, ChainError>;

    async fn stake_info(&self) -> Result<StakeInfo, ChainError>;
    /// Number of values reported so far for `query_id`; passed as the report nonce.
    async fn report_count(&self, query_id: B256) -> Result<U256, ChainError>;
    async fn latest_value(&self, query_id: B256) -> Result<Option<OnChainValue>, ChainError>;
}
