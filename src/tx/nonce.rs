// src/tx/nonce.rs
//! Per-account nonce sequencing.
//!
//! Every submission path goes through [`AccountState::reserve`]. The returned
//! [`NonceLease`] holds the account lock until the transaction has been
//! accepted by the network, so two attempts can never be handed the same
//! nonce. A lease dropped before `commit` leaves the book untouched: the chain
//! never saw that nonce, so the next attempt gets it again.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex as SyncMutex};

use alloy::primitives::{Address, B256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::chain::{Chain, ChainError};

#[derive(Debug, Default)]
struct NonceBook {
    /// Lowest never-used nonce; `None` until first synced from the chain.
    next: Option<u64>,
    /// Nonces given back after a drop, reissued lowest first.
    released: BTreeSet<u64>,
    /// Accepted by the network, no terminal outcome yet.
    in_flight: BTreeMap<u64, B256>,
}

impl NonceBook {
    fn pick(&self) -> Option<(u64, bool)> {
        if let Some(n) = self.released.first() {
            return Some((*n, true));
        }
        self.next.map(|n| (n, false))
    }
}

pub struct AccountState {
    address: Address,
    book: Arc<Mutex<NonceBook>>,
    halted: SyncMutex<Option<String>>,
}

impl AccountState {
    pub fn new(address: Address) -> Self {
        Self { address, book: Arc::new(Mutex::new(NonceBook::default())), halted: SyncMutex::new(None) }
    }

    pub fn address(&self) -> Address { self.address }

    /// Wait for exclusive use of the account and take the next nonce.
    pub async fn reserve(&self, chain: &dyn Chain) -> Result<NonceLease, ChainError> {
        let mut book = self.book.clone().lock_owned().await;
        if book.next.is_none() {
            let n = chain.pending_nonce().await?;
            debug!(account = %self.address, nonce = n, "synced nonce from chain");
            book.next = Some(n);
        }
        let (nonce, from_released) = book.pick().ok_or_else(|| ChainError::Rpc("nonce book not synced".into()))?;
        Ok(NonceLease { book, nonce, from_released })
    }

    /// Terminal success for an in-flight nonce.
    pub async fn confirm(&self, nonce: u64) {
        self.book.lock().await.in_flight.remove(&nonce);
    }

    /// The chain used the nonce even though the report itself failed.
    pub async fn consume(&self, nonce: u64) {
        self.book.lock().await.in_flight.remove(&nonce);
    }

    /// Give a dropped transaction's nonce back for reuse.
    pub async fn release(&self, nonce: u64) {
        let mut book = self.book.lock().await;
        book.in_flight.remove(&nonce);
        if book.next.map_or(true, |next| nonce < next) {
            book.released.insert(nonce);
        }
        info!(account = %self.address, nonce, "nonce released");
    }

    pub async fn replace_hash(&self, nonce: u64, hash: B256) {
        if let Some(h) = self.book.lock().await.in_flight.get_mut(&nonce) {
            *h = hash;
        }
    }

    pub async fn in_flight(&self) -> Vec<(u64, B256)> {
        self.book.lock().await.in_flight.iter().map(|(n, h)| (*n, *h)).collect()
    }

    /// Next nonce a fresh reservation would get, if known.
    pub async fn peek(&self) -> Option<u64> {
        self.book.lock().await.pick().map(|(n, _)| n)
    }

    /// Stop all submissions for this account until an operator resumes it.
    pub fn halt(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(account = %self.address, %reason, "account halted");
        *self.halted.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
    }

    pub fn resume(&self) {
        if self.halted.lock().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            info!(account = %self.address, "account resumed");
        }
    }

    pub fn halted(&self) -> Option<String> {
        self.halted.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Exclusive claim on one nonce, held from Built until Submitted.
pub struct NonceLease {
    book: OwnedMutexGuard<NonceBook>,
    nonce: u64,
    from_released: bool,
}

impl NonceLease {
    pub fn nonce(&self) -> u64 { self.nonce }

    /// The chain reported our nonce as used: move past it and pick again.
    pub fn resync(&mut self, chain_nonce: u64) -> u64 {
        let floor = chain_nonce.max(self.nonce + 1);
        let book = &mut *self.book;
        book.released.retain(|n| *n >= floor);
        book.next = Some(book.next.map_or(floor, |n| n.max(floor)));
        let (nonce, from_released) = book.pick().unwrap_or((floor, false));
        debug!(old = self.nonce, new = nonce, chain_nonce, "nonce resynced");
        self.nonce = nonce;
        self.from_released = from_released;
        nonce
    }

    /// The network accepted `hash`; the nonce is now in flight and the account unlocks.
    pub fn commit(mut self, hash: B256) -> u64 {
        let nonce = self.nonce;
        let book = &mut *self.book;
        if self.from_released {
            book.released.remove(&nonce);
        } else {
            book.next = Some(nonce + 1);
        }
        book.in_flight.insert(nonce, hash);
        nonce
    }
}
