// src/bin/reporter_daemon.rs
use std::path::PathBuf;
use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use feedwright::chain::evm;
use feedwright::config::ReporterConfig;
use feedwright::report_log::{ReportLog, SqliteReportLog};
use feedwright::service::ReporterHub;

#[derive(Parser, Debug)]
#[command(name = "reporter_daemon", about = "Aggregate price sources and report them on chain")]
struct Args {
    #[arg(short, long, default_value = "reporter.toml")]
    config: PathBuf,
    /// Query to report; repeat for several. Defaults to every configured query.
    #[arg(short, long = "query")]
    queries: Vec<String>,
    /// Aggregate and gate as usual but never send a transaction.
    #[arg(long)]
    dry_run: bool,
}

fn signer(cfg: &ReporterConfig) -> anyhow::Result<PrivateKeySigner> {
    match std::env::var(&cfg.chain.key_env) {
        Ok(key) => key.trim().parse().context("signing key is not a valid private key"),
        Err(_) if cfg.reporting.dry_run => {
            warn!(var = %cfg.chain.key_env, "no signing key set; dry run uses a throwaway account");
            Ok(PrivateKeySigner::random())
        }
        Err(_) => anyhow::bail!("{} is not set", cfg.chain.key_env),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut cfg = ReporterConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if args.dry_run {
        cfg.reporting.dry_run = true;
    }

    let signer = signer(&cfg)?;
    let account = signer.address();
    let chain = evm::connect(&cfg.chain.rpc_url, signer, cfg.chain.oracle()?, cfg.chain.chain_id)?;
    let log: Arc<dyn ReportLog> = Arc::new(
        SqliteReportLog::connect(&cfg.storage.database_url)
            .await
            .with_context(|| format!("opening {}", cfg.storage.database_url))?,
    );

    let names: Vec<String> = if args.queries.is_empty() {
        cfg.queries.iter().map(|q| q.name.clone()).collect()
    } else {
        args.queries.clone()
    };
    info!(%account, queries = ?names, dry_run = cfg.reporting.dry_run, "starting reporter");

    let hub = ReporterHub::new(cfg, Arc::new(chain), log);
    for name in &names {
        hub.start(name).await?;
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested; waiting for in-flight reports"),
        _ = hub.finished() => info!("all loops finished"),
    }

    let mut failed = 0;
    for (name, res) in hub.stop_all().await {
        if let Err(e) = res {
            error!(query = %name, "{e}");
            failed += 1;
        }
    }

    for a in hub.attempts(None).await? {
        let tx = a.tx_hash.map(|h| h.to_string()).unwrap_or_else(|| "-".into());
        println!(
            "{:>5} {} {:<12} value={:<14} sources={} tx={} status={}{}",
            a.id,
            a.submitted_at.format("%Y-%m-%d %H:%M:%S"),
            a.query_name,
            a.value.value,
            a.value.contributing_source_ids.len(),
            tx,
            a.status,
            a.error.map(|e| format!(" ({e})")).unwrap_or_default(),
        );
    }

    #[cfg(feature = "metrics")]
    {
        use prometheus::Encoder;
        let mut buf = Vec::new();
        prometheus::TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
        eprint!("{}", String::from_utf8_lossy(&buf));
    }

    if failed > 0 {
        anyhow::bail!("{failed} loop(s) stopped on a fatal error");
    }
    Ok(())
}
