// src/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{B256, U256};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::chain::{Chain, ChainError};
use crate::report_log::{LogError, ReportLog};
use crate::types::FeedQuery;

#[derive(Debug, Clone, PartialEq)]
pub enum Ineligible {
    /// Minimum interval since the last successful report has not elapsed.
    IntervalNotElapsed { last: DateTime<Utc> },
    /// Account stake below the configured minimum. Not retried within the cycle.
    StakeTooLow { staked: U256, required: U256 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Eligibility {
    pub eligible: bool,
    pub next_eligible_at: DateTime<Utc>,
    pub reason: Option<Ineligible>,
}

#[derive(thiserror::Error, Debug)]
pub enum ScheduleError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Decides whether a query may report now. Read-only: never submits.
pub struct SubmissionScheduler {
    log: Arc<dyn ReportLog>,
    chain: Arc<dyn Chain>,
    interval: Duration,
    min_stake: U256,
}

impl SubmissionScheduler {
    pub fn new(log: Arc<dyn ReportLog>, chain: Arc<dyn Chain>, interval: Duration, min_stake: U256) -> Self {
        Self { log, chain, interval, min_stake }
    }

    pub async fn check_eligibility(&self, query_id: B256, now: DateTime<Utc>) -> Result<Eligibility, ScheduleError> {
        let interval = chrono_dur(self.interval);

        if let Some(last) = self.log.last_success(query_id).await? {
            let next = last + interval;
            if now < next {
                return Ok(Eligibility {
                    eligible: false,
                    next_eligible_at: next,
                    reason: Some(Ineligible::IntervalNotElapsed { last }),
                });
            }
        }

        if !self.min_stake.is_zero() {
            let stake = self.chain.stake_info().await?;
            if stake.staked < self.min_stake {
                return Ok(Eligibility {
                    eligible: false,
                    next_eligible_at: now + interval,
                    reason: Some(Ineligible::StakeTooLow { staked: stake.staked, required: self.min_stake }),
                });
            }
        }

        Ok(Eligibility { eligible: true, next_eligible_at: now, reason: None })
    }
}

/// Backup-reporter gate: only report when the on-chain value is missing, older
/// than `stale_timeout`, or off from the fresh value by more than
/// `max_change_percent`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReportCondition {
    pub stale_timeout: Duration,
    pub max_change_percent: f64,
}

impl ReportCondition {
    /// Why a report is needed, or `None` when the on-chain value is fine as is.
    pub async fn reason_to_report(
        &self,
        chain: &dyn Chain,
        query: &FeedQuery,
        fresh: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, ChainError> {
        let Some(current) = chain.latest_value(query.id).await? else {
            return Ok(Some("no value on chain".into()));
        };
        let age = now - current.reported_at;
        if age > chrono_dur(self.stale_timeout) {
            return Ok(Some(format!("on-chain value is {}s old", age.num_seconds())));
        }
        let old = match query.decode_value(&current.value) {
            Ok(v) => v,
            Err(e) => return Ok(Some(format!("on-chain value unreadable: {e}"))),
        };
        if old > 0.0 {
            let change = (fresh - old).abs() / old * 100.0;
            if change > self.max_change_percent {
                return Ok(Some(format!("price moved {change:.3}% since last report")));
            }
        }
        debug!(query = %query.name, old, fresh, "on-chain value recent enough");
        Ok(None)
    }
}
