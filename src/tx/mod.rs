// src/tx/mod.rs
//! Report transaction lifecycle:
//! `Built -> Signed -> Submitted -> {Confirmed | Replaced | Dropped | Failed}`.
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy::primitives::{Bytes, B256, U256};
use tracing::{debug, info, warn};

use crate::chain::{Chain, ChainError, ReceiptStatus, ReportTx};
use crate::config::{GasConfig, ReporterConfig};
use crate::retry::RetryPolicy;

pub mod gas;
pub mod nonce;

pub use gas::GasStrategy;
pub use nonce::{AccountState, NonceLease};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Built,
    Signed,
    Submitted,
    Confirmed,
    Replaced,
    Dropped,
    Failed,
}

impl TxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxState::Built => "built",
            TxState::Signed => "signed",
            TxState::Submitted => "submitted",
            TxState::Confirmed => "confirmed",
            TxState::Replaced => "replaced",
            TxState::Dropped => "dropped",
            TxState::Failed => "failed",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum TxError {
    #[error("account halted: {0}")]
    AccountHalted(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("rejected by contract: {0}")]
    Reverted(String),
    #[error("fee cap of {0} wei reached")]
    FeeCapReached(u128),
    #[error("gave up after {0} submissions: {1}")]
    RetriesExhausted(u32, ChainError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl TxError {
    /// Errors that stop every loop sharing the account.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TxError::AccountHalted(_) | TxError::InsufficientFunds(_))
    }
}

/// Contract call arguments for one report.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportPayload {
    pub query_id: B256,
    pub value: Bytes,
    pub report_nonce: U256,
    pub query_data: Bytes,
}

/// A transaction the network has accepted.
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub hash: B256,
    pub nonce: u64,
    pub tx: ReportTx,
    pub gas: GasStrategy,
    /// Earlier hashes for the same nonce, oldest first.
    pub replaced: Vec<B256>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TxOutcome {
    Confirmed { hash: B256, nonce: u64, block: u64, replaced: Vec<B256> },
    /// Mined but reverted. The nonce is spent.
    Failed { hash: B256, nonce: u64, block: u64, replaced: Vec<B256> },
    /// Never mined within the deadline, even after one escalated resubmission.
    Dropped { hash: B256, nonce: u64, replaced: Vec<B256> },
}

impl TxOutcome {
    pub fn state(&self) -> TxState {
        match self {
            TxOutcome::Confirmed { .. } => TxState::Confirmed,
            TxOutcome::Failed { .. } => TxState::Failed,
            TxOutcome::Dropped { .. } => TxState::Dropped,
        }
    }

    pub fn hash(&self) -> B256 {
        match self {
            TxOutcome::Confirmed { hash, .. } | TxOutcome::Failed { hash, .. } | TxOutcome::Dropped { hash, .. } => *hash,
        }
    }

    pub fn nonce(&self) -> u64 {
        match self {
            TxOutcome::Confirmed { nonce, .. } | TxOutcome::Failed { nonce, .. } | TxOutcome::Dropped { nonce, .. } => *nonce,
        }
    }

    pub fn replaced(&self) -> &[B256] {
        match self {
            TxOutcome::Confirmed { replaced, .. }
            | TxOutcome::Failed { replaced, .. }
            | TxOutcome::Dropped { replaced, .. } => replaced,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TxSettings {
    pub gas: GasConfig,
    pub escalation_multiplier: f64,
    pub max_submit_retries: u32,
    pub receipt_poll: Duration,
    pub drop_after_blocks: u64,
    pub drop_after: Duration,
    pub network_retry: RetryPolicy,
}

impl TxSettings {
    pub fn from_config(cfg: &ReporterConfig) -> Self {
        let r = &cfg.reporting;
        Self {
            gas: cfg.gas.clone(),
            escalation_multiplier: r.gas_escalation_multiplier,
            max_submit_retries: r.max_submit_retries,
            receipt_poll: Duration::from_millis(r.receipt_poll_ms),
            drop_after_blocks: r.drop_after_blocks,
            drop_after: Duration::from_secs(r.drop_after_seconds),
            network_retry: r.network_retry,
        }
    }
}

/// Drives report transactions for one account from build to a terminal state.
pub struct TransactionManager {
    chain: Arc<dyn Chain>,
    account: Arc<AccountState>,
    settings: TxSettings,
}

impl TransactionManager {
    pub fn new(chain: Arc<dyn Chain>, account: Arc<AccountState>, settings: TxSettings) -> Self {
        Self { chain, account, settings }
    }

    pub fn account(&self) -> &Arc<AccountState> { &self.account }

    pub fn chain(&self) -> &Arc<dyn Chain> { &self.chain }

    async fn network<T, F, Fut>(&self, label: &str, op: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        self.settings.network_retry.run(label, op, ChainError::is_transient).await
    }

    /// The oracle's report counter for `query_id`, passed along as `_nonce`.
    pub async fn report_nonce(&self, query_id: B256) -> Result<U256, TxError> {
        let chain = self.chain.as_ref();
        Ok(self.network("report_count", move || chain.report_count(query_id)).await?)
    }

    /// Sign and broadcast `payload` until the network accepts it.
    ///
    /// Underpriced rejections are resubmitted with escalated fees on the same
    /// nonce; a stale nonce is resynced from the chain. At most
    /// `max_submit_retries` broadcasts are made. On any error the reserved
    /// nonce goes back to the account untouched.
    pub async fn send(&self, payload: &ReportPayload) -> Result<SubmittedTx, TxError> {
        if let Some(reason) = self.account.halted() {
            return Err(TxError::AccountHalted(reason));
        }
        let chain = self.chain.as_ref();

        let estimate = self.network("fee_estimate", move || chain.fee_estimate()).await?;
        let mut gas = GasStrategy::from_estimate(estimate, &self.settings.gas, self.settings.escalation_multiplier);

        let balance = self.network("native_balance", move || chain.native_balance()).await?;
        if balance.is_zero() {
            let reason = format!("{} has no native balance", self.account.address());
            self.account.halt(reason.clone());
            return Err(TxError::InsufficientFunds(reason));
        }

        let mut lease = self.account.reserve(chain).await?;
        let mut tx = ReportTx {
            query_id: payload.query_id,
            value: payload.value.clone(),
            report_nonce: payload.report_nonce,
            query_data: payload.query_data.clone(),
            nonce: lease.nonce(),
            gas_limit: self.settings.gas.gas_limit,
            fees: gas.fees(),
        };
        debug!(nonce = tx.nonce, fees = ?tx.fees, state = TxState::Built.as_str(), "report transaction built");

        let mut sends = 0u32;
        loop {
            sends += 1;
            let pending = &tx;
            let result = self.network("sign_and_send", move || chain.sign_and_send(pending)).await;
            let err = match result {
                Ok(hash) => {
                    let nonce = lease.commit(hash);
                    info!(%hash, nonce, fees = ?tx.fees, state = TxState::Submitted.as_str(), "report transaction submitted");
                    return Ok(SubmittedTx { hash, nonce, tx, gas, replaced: Vec::new() });
                }
                Err(e) => e,
            };

            match err {
                ChainError::InsufficientFunds(msg) => {
                    self.account.halt(format!("insufficient funds: {msg}"));
                    return Err(TxError::InsufficientFunds(msg));
                }
                ChainError::Reverted(msg) => {
                    warn!(nonce = tx.nonce, state = TxState::Failed.as_str(), "report rejected before broadcast: {msg}");
                    return Err(TxError::Reverted(msg));
                }
                e if sends >= self.settings.max_submit_retries => {
                    warn!(nonce = tx.nonce, sends, "submission retries exhausted: {e}");
                    return Err(TxError::RetriesExhausted(sends, e));
                }
                e if e.is_underpriced() => {
                    tx.fees = gas.escalate().ok_or(TxError::FeeCapReached(gas.fee_cap))?;
                    warn!(nonce = tx.nonce, fees = ?tx.fees, "{e}; resubmitting with escalated fees");
                }
                ChainError::NonceTooLow(msg) => {
                    let chain_nonce = self.network("pending_nonce", move || chain.pending_nonce()).await?;
                    tx.nonce = lease.resync(chain_nonce);
                    warn!(nonce = tx.nonce, "nonce too low ({msg}); resubmitting");
                }
                e => return Err(TxError::Chain(e)),
            }
        }
    }

    /// Poll for a receipt until the transaction is terminal.
    ///
    /// The deadline is `drop_after_blocks` blocks or `drop_after`, whichever
    /// comes first. The first time it passes the transaction is rebroadcast
    /// once with escalated fees on the same nonce; the second time it is
    /// declared dropped and its nonce released.
    pub async fn track(&self, mut sub: SubmittedTx) -> TxOutcome {
        let chain = self.chain.as_ref();
        let mut started = Instant::now();
        let mut first_block = chain.block_number().await.ok();
        let mut resubmitted = false;

        loop {
            let hashes: Vec<B256> = std::iter::once(sub.hash).chain(sub.replaced.iter().rev().copied()).collect();
            for hash in hashes {
                let status = match self.network("receipt", move || chain.receipt(hash)).await {
                    Ok(status) => status,
                    Err(e) => {
                        warn!(%hash, "receipt lookup failed: {e}");
                        continue;
                    }
                };
                let replaced = || -> Vec<B256> {
                    std::iter::once(sub.hash).chain(sub.replaced.iter().copied()).filter(|h| *h != hash).collect()
                };
                match status {
                    ReceiptStatus::Pending => {}
                    ReceiptStatus::Confirmed { block } => {
                        self.account.confirm(sub.nonce).await;
                        info!(%hash, nonce = sub.nonce, block, state = TxState::Confirmed.as_str(), "report confirmed");
                        return TxOutcome::Confirmed { hash, nonce: sub.nonce, block, replaced: replaced() };
                    }
                    ReceiptStatus::Failed { block } => {
                        self.account.consume(sub.nonce).await;
                        warn!(%hash, nonce = sub.nonce, block, state = TxState::Failed.as_str(), "report reverted on chain");
                        return TxOutcome::Failed { hash, nonce: sub.nonce, block, replaced: replaced() };
                    }
                }
            }

            let current = chain.block_number().await.ok();
            if first_block.is_none() {
                first_block = current;
            }
            let blocks = match (first_block, current) {
                (Some(a), Some(b)) => b.saturating_sub(a),
                _ => 0,
            };
            if blocks >= self.settings.drop_after_blocks || started.elapsed() >= self.settings.drop_after {
                if !resubmitted {
                    resubmitted = true;
                    if self.resubmit(&mut sub).await {
                        started = Instant::now();
                        first_block = current;
                        continue;
                    }
                }
                self.account.release(sub.nonce).await;
                warn!(hash = %sub.hash, nonce = sub.nonce, blocks, state = TxState::Dropped.as_str(), "report dropped");
                return TxOutcome::Dropped { hash: sub.hash, nonce: sub.nonce, replaced: sub.replaced };
            }
            tokio::time::sleep(self.settings.receipt_poll).await;
        }
    }

    /// One escalated rebroadcast on the same nonce. `true` if tracking should continue.
    async fn resubmit(&self, sub: &mut SubmittedTx) -> bool {
        let Some(fees) = sub.gas.escalate() else {
            warn!(nonce = sub.nonce, "fee cap reached; not resubmitting");
            return false;
        };
        sub.tx.fees = fees;
        let chain = self.chain.as_ref();
        let pending = &sub.tx;
        match self.network("sign_and_send", move || chain.sign_and_send(pending)).await {
            Ok(hash) => {
                info!(old = %sub.hash, new = %hash, nonce = sub.nonce, fees = ?fees, state = TxState::Replaced.as_str(), "stuck report replaced");
                sub.replaced.push(sub.hash);
                sub.hash = hash;
                self.account.replace_hash(sub.nonce, hash).await;
                true
            }
            // an earlier broadcast got mined in the meantime
            Err(ChainError::NonceTooLow(_)) => true,
            Err(e) => {
                warn!(nonce = sub.nonce, "resubmission failed: {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChain;
    use crate::chain::{Fees, TxType};

    fn settings() -> TxSettings {
        TxSettings {
            gas: GasConfig { tx_type: TxType::Eip1559, ..Default::default() },
            escalation_multiplier: 1.125,
            max_submit_retries: 5,
            receipt_poll: Duration::from_millis(1),
            drop_after_blocks: 5,
            drop_after: Duration::from_secs(30),
            network_retry: RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(2)),
        }
    }

    fn payload() -> ReportPayload {
        ReportPayload {
            query_id: B256::repeat_byte(0xaa),
            value: Bytes::from(vec![1u8; 32]),
            report_nonce: U256::from(3),
            query_data: Bytes::from(vec![2u8; 64]),
        }
    }

    fn manager(chain: MockChain) -> (Arc<MockChain>, TransactionManager) {
        let chain = Arc::new(chain);
        let account = Arc::new(AccountState::new(chain.address));
        let mgr = TransactionManager::new(chain.clone(), account, settings());
        (chain, mgr)
    }

    #[tokio::test]
    async fn test_underpriced_escalates_on_same_nonce() {
        let (chain, mgr) = manager(MockChain::new().with(|s| {
            s.send_script.extend((0..3).map(|_| ChainError::Underpriced("transaction underpriced".into())));
        }));
        let sub = mgr.send(&payload()).await.unwrap();

        let attempts = chain.attempts();
        assert_eq!(attempts.len(), 4);
        assert!(attempts.iter().all(|t| t.nonce == 7));
        for w in attempts.windows(2) {
            assert!(w[1].fees.ceiling() > w[0].fees.ceiling());
        }
        assert_eq!(sub.nonce, 7);
        assert_eq!(sub.tx.fees, attempts[3].fees);
    }

    #[tokio::test]
    async fn test_submit_retries_are_capped() {
        let (chain, mgr) = manager(MockChain::new().with(|s| {
            s.send_script.extend((0..10).map(|_| ChainError::ReplacementUnderpriced("replacement transaction underpriced".into())));
        }));
        let err = mgr.send(&payload()).await.unwrap_err();
        assert!(matches!(err, TxError::RetriesExhausted(5, _)));
        assert_eq!(chain.attempts().len(), 5);
        // never accepted, so the nonce is still free
        assert_eq!(mgr.account().peek().await, Some(7));
    }

    #[tokio::test]
    async fn test_nonce_too_low_resyncs_from_chain() {
        let (chain, mgr) = manager(MockChain::new().with(|s| {
            s.send_script.push_back(ChainError::NonceTooLow("nonce too low".into()));
        }));
        // first reservation syncs at 7; the chain then moves on without us
        let lease = mgr.account().reserve(chain.as_ref()).await.unwrap();
        drop(lease);
        chain.state.lock().unwrap().pending_nonce = 11;

        let sub = mgr.send(&payload()).await.unwrap();
        let attempts = chain.attempts();
        assert_eq!(attempts[0].nonce, 7);
        assert_eq!(attempts[1].nonce, 11);
        assert_eq!(sub.nonce, 11);
        assert_eq!(mgr.account().peek().await, Some(12));
    }

    #[tokio::test]
    async fn test_insufficient_funds_halts_account_without_consuming_nonce() {
        let (_chain, mgr) = manager(MockChain::new().with(|s| {
            s.send_script.push_back(ChainError::InsufficientFunds("insufficient funds for gas * price + value".into()));
        }));
        let err = mgr.send(&payload()).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(mgr.account().halted().is_some());
        assert_eq!(mgr.account().peek().await, Some(7));

        assert!(matches!(mgr.send(&payload()).await, Err(TxError::AccountHalted(_))));
    }

    #[tokio::test]
    async fn test_zero_balance_halts_before_reserving() {
        let (chain, mgr) = manager(MockChain::new().with(|s| s.balance = U256::ZERO));
        assert!(matches!(mgr.send(&payload()).await, Err(TxError::InsufficientFunds(_))));
        assert!(chain.attempts().is_empty());
        assert!(mgr.account().halted().is_some());
    }

    #[tokio::test]
    async fn test_confirmed_receipt_settles_nonce() {
        let (_chain, mgr) = manager(MockChain::new());
        let sub = mgr.send(&payload()).await.unwrap();
        assert_eq!(mgr.account().in_flight().await, vec![(7, sub.hash)]);

        let outcome = mgr.track(sub.clone()).await;
        assert_eq!(outcome.state(), TxState::Confirmed);
        assert_eq!(outcome.hash(), sub.hash);
        assert!(mgr.account().in_flight().await.is_empty());
        assert_eq!(mgr.account().peek().await, Some(8));
    }

    #[tokio::test]
    async fn test_reverted_receipt_consumes_nonce() {
        let (_chain, mgr) = manager(MockChain::new().with(|s| s.revert = true));
        let sub = mgr.send(&payload()).await.unwrap();
        let outcome = mgr.track(sub).await;
        assert!(matches!(outcome, TxOutcome::Failed { nonce: 7, .. }));
        assert_eq!(mgr.account().peek().await, Some(8));
    }

    #[tokio::test]
    async fn test_stuck_transaction_is_replaced_once_then_dropped() {
        let (chain, mgr) = manager(MockChain::new().with(|s| s.mine_after_polls = None));
        let sub = mgr.send(&payload()).await.unwrap();
        let first = sub.hash;

        let outcome = mgr.track(sub).await;
        let TxOutcome::Dropped { nonce, replaced, hash } = outcome else { panic!("expected drop, got {outcome:?}") };
        assert_eq!(nonce, 7);
        assert_eq!(replaced, vec![first]);
        assert_ne!(hash, first);

        let sent = chain.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].1.nonce, 7);
        assert!(sent[1].1.fees.ceiling() > sent[0].1.fees.ceiling());

        // released nonce is the next one handed out
        assert_eq!(mgr.account().peek().await, Some(7));
        chain.state.lock().unwrap().mine_after_polls = Some(0);
        let again = mgr.send(&payload()).await.unwrap();
        assert_eq!(again.nonce, 7);
    }

    #[tokio::test]
    async fn test_replacement_can_confirm() {
        let (_chain, mgr) = manager(MockChain::new().with(|s| s.mine_from_send = 1));
        let sub = mgr.send(&payload()).await.unwrap();
        let first = sub.hash;
        let outcome = mgr.track(sub).await;
        let TxOutcome::Confirmed { replaced, hash, nonce, .. } = outcome else { panic!("expected confirm, got {outcome:?}") };
        assert_eq!(nonce, 7);
        assert_eq!(replaced, vec![first]);
        assert_ne!(hash, first);
        assert!(mgr.account().in_flight().await.is_empty());
    }

    #[tokio::test]
    async fn test_legacy_fees_are_used_when_configured() {
        let chain = Arc::new(MockChain::new());
        let account = Arc::new(AccountState::new(chain.address));
        let mut s = settings();
        s.gas.tx_type = TxType::Legacy;
        let mgr = TransactionManager::new(chain.clone(), account, s);
        let sub = mgr.send(&payload()).await.unwrap();
        assert_eq!(sub.tx.fees, Fees::Legacy { gas_price: 11_000_000_000 });
    }
}
