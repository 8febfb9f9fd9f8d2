// src/bin/source_probe.rs
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;

use feedwright::config::ReporterConfig;
use feedwright::feed::FeedAggregator;

#[derive(Parser, Debug)]
#[command(name = "source_probe", about = "Fetch every source of one query once and print the consensus")]
struct Args {
    #[arg(short, long, default_value = "reporter.toml")]
    config: PathBuf,
    query: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = ReporterConfig::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?;
    let q = cfg.query(&args.query).with_context(|| format!("no query named {:?}", args.query))?;
    let query = q.feed_query();
    let http = reqwest::Client::new();
    let timeout = Duration::from_millis(cfg.reporting.fetch_timeout_ms);

    println!("{} query_id={}", query.name, query.id);
    let mut points = Vec::new();
    for src in &q.sources {
        let client = src.build(&http, &cfg.reporting.source_retry);
        match client.fetch(&query, timeout).await {
            Ok(p) => {
                println!("  {:<12} {:>14} at {}", p.source_id, p.value, p.observed_at);
                points.push(p);
            }
            Err(e) => println!("  {:<12} error: {e}", src.id()),
        }
    }

    match FeedAggregator::new(q.policy(&cfg.reporting)).aggregate(&points, Utc::now()) {
        Ok(v) => println!(
            "{} = {} ({}, spread {:.4}%, from {:?})",
            query.name, v.value, v.method, v.spread, v.contributing_source_ids
        ),
        Err(e) => println!("{}: no consensus: {e}", query.name),
    }
    Ok(())
}
