// src/tx/gas.rs
use crate::chain::{FeeEstimate, Fees, TxType};
use crate::config::{gwei, GasConfig};

/// Fee parameters for one transaction and how to bump them on rejection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasStrategy {
    pub tx_type: TxType,
    pub base_fee: u128,
    pub priority_fee: u128,
    pub escalation_multiplier: f64,
    pub fee_cap: u128,
}

impl GasStrategy {
    /// Node estimate with configured overrides applied.
    pub fn from_estimate(estimate: FeeEstimate, cfg: &GasConfig, escalation_multiplier: f64) -> Self {
        Self {
            tx_type: cfg.tx_type,
            base_fee: cfg.base_fee_gwei.map(gwei).unwrap_or(estimate.base_fee),
            priority_fee: cfg.priority_fee_gwei.map(gwei).unwrap_or(estimate.priority_fee),
            escalation_multiplier,
            fee_cap: gwei(cfg.fee_cap_gwei),
        }
    }

    pub fn fees(&self) -> Fees {
        match self.tx_type {
            TxType::Legacy => Fees::Legacy {
                gas_price: self.base_fee.saturating_add(self.priority_fee).min(self.fee_cap),
            },
            TxType::Eip1559 => {
                let max_fee = self
                    .base_fee
                    .saturating_mul(2)
                    .saturating_add(self.priority_fee)
                    .min(self.fee_cap);
                Fees::Eip1559 { max_fee, priority_fee: self.priority_fee.min(max_fee) }
            }
        }
    }

    /// Bump both components by the multiplier. `None` once the cap stops the
    /// fee ceiling from rising, in which case nothing changes.
    pub fn escalate(&mut self) -> Option<Fees> {
        let before = self.fees();
        let bumped = Self {
            base_fee: bump(self.base_fee, self.escalation_multiplier),
            priority_fee: bump(self.priority_fee, self.escalation_multiplier),
            ..*self
        };
        let after = bumped.fees();
        if after.ceiling() <= before.ceiling() {
            return None;
        }
        *self = bumped;
        Some(after)
    }
}

fn bump(x: u128, m: f64) -> u128 {
    let scaled = (x as f64 * m).ceil();
    let scaled = if scaled >= u128::MAX as f64 { u128::MAX } else { scaled as u128 };
    scaled.max(x.saturating_add(1))
}
