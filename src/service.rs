// src/service.rs
//! `Start(query)` / `Stop(query)` surface over the per-query reporting loops.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chain::Chain;
use crate::config::ReporterConfig;
use crate::report_log::{LogError, ReportLog};
use crate::reporter::{Reporter, ReporterError};
use crate::tx::{AccountState, TransactionManager, TxSettings};
use crate::types::ReportAttempt;

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("no query named {0:?} in config")]
    UnknownQuery(String),
    #[error("{0:?} is already running")]
    AlreadyRunning(String),
    #[error("{0:?} is not running")]
    NotRunning(String),
    #[error("{name:?} stopped: {source}")]
    Stopped { name: String, source: ReporterError },
    #[error("{name:?} task panicked: {reason}")]
    Panicked { name: String, reason: String },
    #[error(transparent)]
    Log(#[from] LogError),
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), ReporterError>>,
}

/// Owns one signing account and every loop reporting through it.
pub struct ReporterHub {
    cfg: ReporterConfig,
    http: reqwest::Client,
    tx: Arc<TransactionManager>,
    log: Arc<dyn ReportLog>,
    loops: Mutex<HashMap<String, Running>>,
}

impl ReporterHub {
    pub fn new(cfg: ReporterConfig, chain: Arc<dyn Chain>, log: Arc<dyn ReportLog>) -> Self {
        let account = Arc::new(AccountState::new(chain.address()));
        let tx = Arc::new(TransactionManager::new(chain, account, TxSettings::from_config(&cfg)));
        Self { cfg, http: reqwest::Client::new(), tx, log, loops: Mutex::new(HashMap::new()) }
    }

    pub fn account(&self) -> &Arc<AccountState> { self.tx.account() }

    pub async fn start(&self, name: &str) -> Result<(), HubError> {
        let q = self.cfg.query(name).ok_or_else(|| HubError::UnknownQuery(name.to_string()))?;
        let mut loops = self.loops.lock().await;
        if let Some(r) = loops.get(name) {
            if !r.handle.is_finished() {
                return Err(HubError::AlreadyRunning(name.to_string()));
            }
        }

        let reporter = Reporter::from_config(q, &self.cfg.reporting, &self.http, self.tx.clone(), self.log.clone());
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { reporter.run(token).await });
        loops.insert(name.to_string(), Running { cancel, handle });
        info!(query = name, "loop started");
        Ok(())
    }

    /// Cancel the loop and wait for it. An in-flight transaction finishes first.
    pub async fn stop(&self, name: &str) -> Result<(), HubError> {
        let running = self.loops.lock().await.remove(name).ok_or_else(|| HubError::NotRunning(name.to_string()))?;
        running.cancel.cancel();
        let res = match running.handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(HubError::Stopped { name: name.to_string(), source }),
            Err(e) => Err(HubError::Panicked { name: name.to_string(), reason: e.to_string() }),
        };
        info!(query = name, "loop stopped");
        res
    }

    pub async fn stop_all(&self) -> Vec<(String, Result<(), HubError>)> {
        let names: Vec<String> = self.loops.lock().await.keys().cloned().collect();
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let res = self.stop(&name).await;
            if let Err(e) = &res {
                warn!(query = %name, "{e}");
            }
            out.push((name, res));
        }
        out
    }

    /// Names of loops still running.
    pub async fn running(&self) -> Vec<String> {
        let loops = self.loops.lock().await;
        let mut names: Vec<String> = loops.iter().filter(|(_, r)| !r.handle.is_finished()).map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    /// Resolves once every started loop has exited on its own.
    pub async fn finished(&self) {
        loop {
            if self.running().await.is_empty() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    /// Attempt log, optionally for one configured query.
    pub async fn attempts(&self, name: Option<&str>) -> Result<Vec<ReportAttempt>, HubError> {
        let query_id = match name {
            Some(n) => Some(self.cfg.query(n).ok_or_else(|| HubError::UnknownQuery(n.to_string()))?.feed_query().id),
            None => None,
        };
        Ok(self.log.attempts(query_id).await?)
    }

    /// Operator acknowledgement after a fatal account error; stopped loops must be started again.
    pub fn resume_account(&self) {
        self.tx.account().resume();
    }
}
