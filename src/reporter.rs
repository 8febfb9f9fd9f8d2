// src/reporter.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{QueryConfig, ReportingConfig};
use crate::feed::FeedAggregator;
use crate::providers::SourceClient;
use crate::report_log::{AttemptUpdate, ReportLog};
use crate::scheduler::{ReportCondition, SubmissionScheduler};
use crate::tx::{ReportPayload, TransactionManager, TxError, TxOutcome};
use crate::types::{AggregatedValue, AttemptStatus, DataPoint, FeedQuery, NewAttempt};

/// Errors that end a loop. Everything else fails only the current cycle.
#[derive(thiserror::Error, Debug)]
pub enum ReporterError {
    #[error("fatal transaction error: {0}")]
    Fatal(#[from] TxError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Reported { attempt_id: u64, status: AttemptStatus },
    /// Not eligible, or the on-chain value did not need an update.
    Skipped(String),
    /// Quorum, divergence or a transient error; retried next interval.
    Aborted(String),
    Cancelled,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Reported { .. } => "reported",
            CycleOutcome::Skipped(_) => "skipped",
            CycleOutcome::Aborted(_) => "aborted",
            CycleOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub outcome: CycleOutcome,
    /// Earliest time the next cycle should start.
    pub next_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    pub interval: Duration,
    pub fetch_timeout: Duration,
    /// Stragglers still outstanding after this are abandoned.
    pub fetch_deadline: Duration,
    pub report_count: Option<u32>,
    pub dry_run: bool,
}

impl ReporterSettings {
    pub fn from_config(q: &QueryConfig, r: &ReportingConfig) -> Self {
        Self {
            interval: q.interval(r),
            fetch_timeout: Duration::from_millis(r.fetch_timeout_ms),
            fetch_deadline: Duration::from_millis(r.fetch_deadline_ms),
            report_count: q.report_count,
            dry_run: r.dry_run,
        }
    }
}

/// One query's reporting loop: fetch, aggregate, gate, submit, record, sleep.
pub struct Reporter {
    pub query: FeedQuery,
    sources: Vec<Arc<dyn SourceClient>>,
    aggregator: FeedAggregator,
    scheduler: SubmissionScheduler,
    condition: Option<ReportCondition>,
    tx: Arc<TransactionManager>,
    log: Arc<dyn ReportLog>,
    settings: ReporterSettings,
}

impl Reporter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query: FeedQuery,
        sources: Vec<Arc<dyn SourceClient>>,
        aggregator: FeedAggregator,
        condition: Option<ReportCondition>,
        tx: Arc<TransactionManager>,
        log: Arc<dyn ReportLog>,
        min_stake: alloy::primitives::U256,
        settings: ReporterSettings,
    ) -> Self {
        let scheduler = SubmissionScheduler::new(log.clone(), tx.chain().clone(), settings.interval, min_stake);
        Self { query, sources, aggregator, scheduler, condition, tx, log, settings }
    }

    pub fn from_config(
        q: &QueryConfig,
        r: &ReportingConfig,
        http: &reqwest::Client,
        tx: Arc<TransactionManager>,
        log: Arc<dyn ReportLog>,
    ) -> Self {
        let sources = q.sources.iter().map(|s| s.build(http, &r.source_retry)).collect();
        let condition = q.stale_timeout_seconds.map(|secs| ReportCondition {
            stale_timeout: Duration::from_secs(secs),
            max_change_percent: q.max_price_change_percent,
        });
        Self::new(
            q.feed_query(),
            sources,
            FeedAggregator::new(q.policy(r)),
            condition,
            tx,
            log,
            r.min_stake(),
            ReporterSettings::from_config(q, r),
        )
    }

    /// Run cycles until cancelled, `report_count` is reached, or a fatal error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ReporterError> {
        let name = self.query.name.as_str();
        info!(query = name, id = %self.query.id, sources = self.sources.len(), "reporter started");
        let mut cycles = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let cycle = match self.run_once(&cancel).await {
                Ok(c) => c,
                Err(e) => {
                    error!(query = name, "reporter stopped: {e}");
                    #[cfg(feature = "metrics")]
                    crate::metrics::cycle("fatal");
                    return Err(e);
                }
            };
            #[cfg(feature = "metrics")]
            crate::metrics::cycle(cycle.outcome.label());
            if cycle.outcome == CycleOutcome::Cancelled {
                break;
            }

            cycles += 1;
            if self.settings.report_count.is_some_and(|limit| cycles >= limit) {
                info!(query = name, cycles, "report count reached");
                return Ok(());
            }

            if cancel.is_cancelled() {
                break;
            }
            let wait = (cycle.next_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            debug!(query = name, wait_ms = wait.as_millis() as u64, "sleeping until next cycle");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        info!(query = name, cycles, "reporter cancelled");
        Ok(())
    }

    /// One cycle. Cancellation is honoured before fetching and before
    /// submitting; once a transaction is built it is followed to a terminal state.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<Cycle, ReporterError> {
        let name = self.query.name.as_str();
        if let Some(reason) = self.tx.account().halted() {
            return Err(TxError::AccountHalted(reason).into());
        }
        if cancel.is_cancelled() {
            return Ok(Cycle { outcome: CycleOutcome::Cancelled, next_at: Utc::now() });
        }

        let started = Utc::now();
        let floor = started + chrono::Duration::from_std(self.settings.interval).unwrap_or_else(|_| chrono::Duration::days(1));
        let aborted = |why: String| {
            warn!(query = name, "cycle aborted: {why}");
            Ok(Cycle { outcome: CycleOutcome::Aborted(why), next_at: floor })
        };

        let points = self.collect().await;
        let now = Utc::now();
        let value = match self.aggregator.aggregate(&points, now) {
            Ok(v) => v,
            Err(e) => return aborted(e.to_string()),
        };
        #[cfg(feature = "metrics")]
        crate::metrics::spread(value.spread);
        debug!(query = name, value = value.value, spread = value.spread, sources = ?value.contributing_source_ids, "aggregated");

        let eligibility = match self.scheduler.check_eligibility(self.query.id, now).await {
            Ok(e) => e,
            Err(e) => return aborted(format!("eligibility check failed: {e}")),
        };
        if !eligibility.eligible {
            let why = format!("{:?}", eligibility.reason);
            info!(query = name, next = %eligibility.next_eligible_at, "not eligible: {why}");
            return Ok(Cycle { outcome: CycleOutcome::Skipped(why), next_at: eligibility.next_eligible_at.max(floor) });
        }

        if let Some(cond) = &self.condition {
            match cond.reason_to_report(self.tx.chain().as_ref(), &self.query, value.value, now).await {
                Ok(Some(why)) => info!(query = name, "reporting: {why}"),
                Ok(None) => {
                    return Ok(Cycle { outcome: CycleOutcome::Skipped("on-chain value is current".into()), next_at: floor });
                }
                Err(e) => return aborted(format!("on-chain value lookup failed: {e}")),
            }
        }

        if cancel.is_cancelled() {
            return Ok(Cycle { outcome: CycleOutcome::Cancelled, next_at: floor });
        }
        let outcome = self.submit(value).await?;
        if let CycleOutcome::Aborted(why) = &outcome {
            warn!(query = name, "cycle aborted: {why}");
        }
        Ok(Cycle { outcome, next_at: floor })
    }

    /// Fan out to all sources. Stop once the points in hand aggregate cleanly,
    /// when every source has answered, or at the deadline.
    async fn collect(&self) -> Vec<DataPoint> {
        let name = self.query.name.as_str();
        let quorum = self.aggregator.policy.min_quorum.max(1);
        let timeout = self.settings.fetch_timeout;
        let query = &self.query;

        let mut pending: FuturesUnordered<_> = self
            .sources
            .iter()
            .map(|src| async move { (src.id(), src.fetch(query, timeout).await) })
            .collect();
        let deadline = tokio::time::sleep(self.settings.fetch_deadline);
        tokio::pin!(deadline);

        let mut out = Vec::with_capacity(self.sources.len());
        loop {
            tokio::select! {
                next = pending.next() => match next {
                    Some((_, Ok(p))) => {
                        out.push(p);
                        // an outlier among the early answers costs quorum; keep waiting
                        if out.len() >= quorum && self.aggregator.aggregate(&out, Utc::now()).is_ok() {
                            break;
                        }
                    }
                    Some((id, Err(e))) => warn!(query = name, source = id, "source excluded from cycle: {e}"),
                    None => break,
                },
                _ = &mut deadline => {
                    warn!(query = name, have = out.len(), outstanding = pending.len(), "fetch deadline passed");
                    break;
                }
            }
        }
        out
    }

    async fn submit(&self, value: AggregatedValue) -> Result<CycleOutcome, ReporterError> {
        let name = self.query.name.as_str();
        let encoded = match self.query.encode_value(value.value) {
            Ok(b) => b,
            Err(e) => return Ok(CycleOutcome::Aborted(format!("cannot encode {}: {e}", value.value))),
        };
        let new_attempt = |status| NewAttempt {
            query_id: self.query.id,
            query_name: self.query.name.clone(),
            value: value.clone(),
            submitted_at: Utc::now(),
            status,
        };

        if self.settings.dry_run {
            return Ok(match self.log.append(new_attempt(AttemptStatus::DryRun)).await {
                Ok(a) => {
                    info!(query = name, value = value.value, "dry run: would report");
                    CycleOutcome::Reported { attempt_id: a.id, status: AttemptStatus::DryRun }
                }
                Err(e) => CycleOutcome::Aborted(format!("report log unavailable: {e}")),
            });
        }

        let report_nonce = match self.tx.report_nonce(self.query.id).await {
            Ok(n) => n,
            Err(e) => return Ok(CycleOutcome::Aborted(format!("report count lookup failed: {e}"))),
        };
        let attempt = match self.log.append(new_attempt(AttemptStatus::Pending)).await {
            Ok(a) => a,
            Err(e) => return Ok(CycleOutcome::Aborted(format!("report log unavailable: {e}"))),
        };
        let payload = ReportPayload {
            query_id: self.query.id,
            value: encoded,
            report_nonce,
            query_data: self.query.data.clone(),
        };

        let submitted = match self.tx.send(&payload).await {
            Ok(s) => s,
            Err(e) => {
                if let Err(le) = self.log.update(attempt.id, AttemptUpdate::failed(e.to_string())).await {
                    warn!(query = name, attempt = attempt.id, "could not record failure: {le}");
                }
                #[cfg(feature = "metrics")]
                crate::metrics::transaction("failed");
                if e.is_fatal() {
                    return Err(e.into());
                }
                return Ok(CycleOutcome::Aborted(e.to_string()));
            }
        };
        let first = submitted.hash;
        if let Err(e) = self.log.assign_hash(attempt.id, first, submitted.nonce).await {
            warn!(query = name, attempt = attempt.id, tx = %first, "could not record hash: {e}");
        }

        let outcome = self.tx.track(submitted).await;
        #[cfg(feature = "metrics")]
        crate::metrics::transaction(outcome.state().as_str());
        let replaced: Vec<_> = outcome
            .replaced()
            .iter()
            .copied()
            .chain(std::iter::once(outcome.hash()))
            .filter(|h| *h != first)
            .collect();
        let (status, error) = match &outcome {
            TxOutcome::Confirmed { .. } => (AttemptStatus::Confirmed, None),
            TxOutcome::Failed { block, .. } => (AttemptStatus::Failed, Some(format!("reverted in block {block}"))),
            TxOutcome::Dropped { .. } => (AttemptStatus::Dropped, Some("not mined before deadline".to_string())),
        };
        if let Err(e) = self.log.update(attempt.id, AttemptUpdate { status, replaced_hashes: replaced, error }).await {
            warn!(query = name, attempt = attempt.id, "could not record outcome: {e}");
        }
        info!(query = name, value = value.value, tx = %outcome.hash(), nonce = outcome.nonce(), status = %status, "cycle finished");
        Ok(CycleOutcome::Reported { attempt_id: attempt.id, status })
    }
}
