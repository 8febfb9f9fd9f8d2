// src/metrics.rs
use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter_vec, Histogram, IntCounterVec};

pub static CYCLES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "reporter_cycles_total", "Reporting cycles by outcome", &["outcome"] // reported|skipped|aborted|cancelled
    ).unwrap()
});

pub static TRANSACTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "reporter_transactions_total", "Report transactions by terminal state", &["state"]
    ).unwrap()
});

pub static AGGREGATE_SPREAD: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "reporter_aggregate_spread_percent",
        "Spread across contributing sources",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]
    ).unwrap()
});

pub fn cycle(outcome: &str) {
    CYCLES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn transaction(state: &str) {
    TRANSACTIONS_TOTAL.with_label_values(&[state]).inc();
}

pub fn spread(percent: f64) {
    AGGREGATE_SPREAD.observe(percent);
}
