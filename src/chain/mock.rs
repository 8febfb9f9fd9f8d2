// src/chain/mock.rs
//! Scripted in-memory chain for tests.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256, U256};
use async_trait::async_trait;

use super::{Chain, ChainError, FeeEstimate, OnChainValue, ReceiptStatus, ReportTx, StakeInfo};

pub struct MockState {
    pub pending_nonce: u64,
    /// Consumed front to back by `sign_and_send`; an empty script accepts.
    pub send_script: VecDeque<ChainError>,
    pub sent: Vec<(B256, ReportTx)>,
    /// Every transaction handed to `sign_and_send`, accepted or not.
    pub attempts: Vec<ReportTx>,
    /// Pending polls before a receipt appears; `None` never mines anything.
    pub mine_after_polls: Option<u32>,
    /// Only sends with at least this index get mined.
    pub mine_from_send: usize,
    pub revert: bool,
    polls: HashMap<B256, u32>,
    pub block: u64,
    pub blocks_per_call: u64,
    pub fee: FeeEstimate,
    pub balance: U256,
    pub stake: StakeInfo,
    pub report_count: U256,
    pub latest: Option<OnChainValue>,
    pub send_delay: Duration,
}

pub struct MockChain {
    pub address: Address,
    pub state: Mutex<MockState>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            address: Address::repeat_byte(0x11),
            state: Mutex::new(MockState {
                pending_nonce: 7,
                send_script: VecDeque::new(),
                sent: Vec::new(),
                attempts: Vec::new(),
                mine_after_polls: Some(1),
                mine_from_send: 0,
                revert: false,
                polls: HashMap::new(),
                block: 100,
                blocks_per_call: 1,
                fee: FeeEstimate { base_fee: 10_000_000_000, priority_fee: 1_000_000_000 },
                balance: U256::from(10u128.pow(18)),
                stake: StakeInfo { staked: U256::from(10u128.pow(20)), locked: U256::ZERO },
                report_count: U256::from(3),
                latest: None,
                send_delay: Duration::ZERO,
            }),
        }
    }

    pub fn with<F: FnOnce(&mut MockState)>(self, f: F) -> Self {
        f(&mut self.state.lock().unwrap());
        self
    }

    pub fn sent(&self) -> Vec<(B256, ReportTx)> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn attempts(&self) -> Vec<ReportTx> {
        self.state.lock().unwrap().attempts.clone()
    }
}

#[async_trait]
impl Chain for MockChain {
    fn address(&self) -> Address { self.address }

    async fn sign_and_send(&self, tx: &ReportTx) -> Result<B256, ChainError> {
        let delay = self.state.lock().unwrap().send_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut s = self.state.lock().unwrap();
        s.attempts.push(tx.clone());
        if let Some(err) = s.send_script.pop_front() {
            return Err(err);
        }
        let hash = keccak256(format!("{}:{}:{}", tx.nonce, tx.fees.ceiling(), s.sent.len()));
        s.pending_nonce = s.pending_nonce.max(tx.nonce + 1);
        s.sent.push((hash, tx.clone()));
        Ok(hash)
    }

    async fn receipt(&self, hash: B256) -> Result<ReceiptStatus, ChainError> {
        let mut s = self.state.lock().unwrap();
        let index = s.sent.iter().position(|(h, _)| *h == hash);
        let Some(index) = index else { return Ok(ReceiptStatus::Pending) };
        let Some(after) = s.mine_after_polls else { return Ok(ReceiptStatus::Pending) };
        if index < s.mine_from_send {
            return Ok(ReceiptStatus::Pending);
        }
        let polls = s.polls.entry(hash).or_insert(0);
        *polls += 1;
        if *polls <= after {
            return Ok(ReceiptStatus::Pending);
        }
        let block = s.block;
        Ok(if s.revert { ReceiptStatus::Failed { block } } else { ReceiptStatus::Confirmed { block } })
    }

    async fn pending_nonce(&self) -> Result<u64, ChainError> {
        Ok(self.state.lock().unwrap().pending_nonce)
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let mut s = self.state.lock().unwrap();
        s.block += s.blocks_per_call;
        Ok(s.block)
    }

    async fn fee_estimate(&self) -> Result<FeeEstimate, ChainError> {
        Ok(self.state.lock().unwrap().fee)
    }

    async fn native_balance(&self) -> Result<U256, ChainError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn stake_info(&self) -> Result<StakeInfo, ChainError> {
        Ok(self.state.lock().unwrap().stake)
    }

    async fn report_count(&self, _query_id: B256) -> Result<U256, ChainError> {
        Ok(self.state.lock().unwrap().report_count)
    }

    async fn latest_value(&self, _query_id: B256) -> Result<Option<OnChainValue>, ChainError> {
        Ok(self.state.lock().unwrap().latest.clone())
    }
}
