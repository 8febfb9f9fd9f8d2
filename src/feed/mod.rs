// src/feed/mod.rs
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::Deserialize;

use crate::types::{AggregatedValue, AggregationMethod, DataPoint};

pub mod stats;

/// Source clocks may run this far ahead of ours before a point is discarded.
const MAX_FUTURE_SKEW_SECS: i64 = 5;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AggregateError {
    #[error("insufficient quorum: {have} usable sources, need {need}")]
    InsufficientQuorum { have: usize, need: usize },
    #[error("sources diverge by {spread:.3}% (max {max:.3}%)")]
    ValueDivergence { spread: f64, max: f64 },
}

/// When a point is too far from the central value to be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum OutlierRule {
    /// Relative deviation from the central value, in percent.
    Percent { threshold: f64 },
    /// Multiples of the scaled median absolute deviation.
    Mad { k: f64 },
}

impl Default for OutlierRule {
    fn default() -> Self { OutlierRule::Percent { threshold: 5.0 } }
}

impl OutlierRule {
    fn rejects(&self, value: f64, center: f64, mad: f64) -> bool {
        let dev = (value - center).abs();
        match *self {
            OutlierRule::Percent { threshold } => dev / center * 100.0 > threshold,
            OutlierRule::Mad { k } => dev > k * mad,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPolicy {
    pub method: AggregationMethod,
    pub min_quorum: usize,
    pub max_divergence_percent: f64,
    pub staleness_window: Duration,
    pub outlier: OutlierRule,
}

/// Robust consensus over one cycle's data points:
/// 1) staleness and clock-skew filter, newest point per source
/// 2) central value with the configured method
/// 3) one round of outlier rejection, then recompute
/// 4) divergence ceiling over the survivors
pub struct FeedAggregator {
    pub policy: AggregationPolicy,
}

impl FeedAggregator {
    pub fn new(policy: AggregationPolicy) -> Self { Self { policy } }

    /// `now` is both the staleness reference and the `computed_at` stamp, so equal inputs
    /// always give equal outputs.
    pub fn aggregate(&self, points: &[DataPoint], now: DateTime<Utc>) -> Result<AggregatedValue, AggregateError> {
        let need = self.policy.min_quorum.max(1);
        let window = chrono::Duration::from_std(self.policy.staleness_window).unwrap_or_else(|_| chrono::Duration::days(36_500));

        let skew = chrono::Duration::seconds(MAX_FUTURE_SKEW_SECS);
        let mut latest: BTreeMap<&str, &DataPoint> = BTreeMap::new();
        for p in points {
            let age = now - p.observed_at;
            if !p.value.is_finite() || p.value <= 0.0 || age > window || -age > skew {
                continue;
            }
            match latest.entry(p.source_id.as_str()) {
                Entry::Vacant(e) => { e.insert(p); }
                Entry::Occupied(mut e) => {
                    let cur = e.get();
                    if (p.observed_at, OrderedFloat(p.value)) > (cur.observed_at, OrderedFloat(cur.value)) {
                        e.insert(p);
                    }
                }
            }
        }

        let mut fresh: Vec<&DataPoint> = latest.into_values().collect();
        if fresh.len() < need {
            return Err(AggregateError::InsufficientQuorum { have: fresh.len(), need });
        }
        fresh.sort_by(|a, b| {
            OrderedFloat(a.value).cmp(&OrderedFloat(b.value)).then_with(|| a.source_id.cmp(&b.source_id))
        });

        let anchor = self.central(&fresh);
        let values: Vec<f64> = fresh.iter().map(|p| p.value).collect();
        let mad = stats::mad(&values, anchor);
        let kept: Vec<&DataPoint> = fresh
            .into_iter()
            .filter(|p| !self.policy.outlier.rejects(p.value, anchor, mad))
            .collect();
        if kept.len() < need {
            return Err(AggregateError::InsufficientQuorum { have: kept.len(), need });
        }

        let value = self.central(&kept);
        let sorted: Vec<f64> = kept.iter().map(|p| p.value).collect();
        let spread = stats::spread_percent(&sorted, value);
        if spread > self.policy.max_divergence_percent {
            return Err(AggregateError::ValueDivergence { spread, max: self.policy.max_divergence_percent });
        }

        Ok(AggregatedValue {
            value,
            method: self.policy.method,
            contributing_source_ids: kept.iter().map(|p| p.source_id.clone()).collect(),
            computed_at: now,
            spread,
        })
    }

    fn central(&self, sorted: &[&DataPoint]) -> f64 {
        match self.policy.method {
            AggregationMethod::Median => {
                let vs: Vec<f64> = sorted.iter().map(|p| p.value).collect();
                stats::median(&vs)
            }
            AggregationMethod::TrimmedMean { trim_fraction } => {
                let vs: Vec<f64> = sorted.iter().map(|p| p.value).collect();
                stats::trimmed_mean(&vs, trim_fraction)
            }
            AggregationMethod::WeightedMedian => {
                let vw: Vec<(f64, f64)> = sorted.iter().map(|p| (p.value, p.weight())).collect();
                stats::weighted_median(&vw)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> { Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap() }

    fn policy(min_quorum: usize, max_div: f64) -> AggregationPolicy {
        AggregationPolicy {
            method: AggregationMethod::Median,
            min_quorum,
            max_divergence_percent: max_div,
            staleness_window: Duration::from_secs(60),
            outlier: OutlierRule::Percent { threshold: 5.0 },
        }
    }

    fn pts(values: &[f64]) -> Vec<DataPoint> {
        values.iter().enumerate().map(|(i, v)| DataPoint::new(format!("s{i}"), *v, at(0))).collect()
    }

    #[test]
    fn test_outlier_is_discarded() {
        let agg = FeedAggregator::new(policy(3, 3.0));
        let out = agg.aggregate(&pts(&[100.0, 101.0, 99.0, 5000.0]), at(5)).unwrap();
        assert_eq!(out.value, 100.0);
        assert_eq!(out.contributing_source_ids.len(), 3);
        assert!(!out.contributing_source_ids.contains("s3"));
        assert!((out.spread - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_mad_rule_also_discards_outlier() {
        let mut p = policy(3, 3.0);
        p.outlier = OutlierRule::Mad { k: 3.5 };
        let out = FeedAggregator::new(p).aggregate(&pts(&[100.0, 101.0, 99.0, 5000.0]), at(5)).unwrap();
        assert_eq!(out.value, 100.0);
    }

    #[test]
    fn test_quorum_law() {
        let agg = FeedAggregator::new(policy(3, 5.0));
        let err = agg.aggregate(&pts(&[100.0, 100.5]), at(1)).unwrap_err();
        assert_eq!(err, AggregateError::InsufficientQuorum { have: 2, need: 3 });

        // duplicates from one source count once
        let mut dup = pts(&[100.0, 100.5]);
        dup.push(DataPoint::new("s1", 100.2, at(1)));
        assert!(matches!(agg.aggregate(&dup, at(2)), Err(AggregateError::InsufficientQuorum { .. })));
    }

    #[test]
    fn test_future_dated_points_do_not_count() {
        let agg = FeedAggregator::new(policy(2, 5.0));
        let mut points = pts(&[100.0]);
        points.push(DataPoint::new("ahead", 100.0, at(3600)));
        let err = agg.aggregate(&points, at(0)).unwrap_err();
        assert_eq!(err, AggregateError::InsufficientQuorum { have: 1, need: 2 });

        // small skew is tolerated
        points.push(DataPoint::new("close", 100.2, at(2)));
        assert_eq!(agg.aggregate(&points, at(0)).unwrap().contributing_source_ids.len(), 2);
    }

    #[test]
    fn test_stale_points_do_not_count() {
        let agg = FeedAggregator::new(policy(2, 5.0));
        let mut points = pts(&[100.0]);
        points.push(DataPoint::new("old", 100.0, at(-120)));
        let err = agg.aggregate(&points, at(0)).unwrap_err();
        assert_eq!(err, AggregateError::InsufficientQuorum { have: 1, need: 2 });
    }

    #[test]
    fn test_quorum_rechecked_after_rejection() {
        let agg = FeedAggregator::new(policy(3, 5.0));
        let err = agg.aggregate(&pts(&[100.0, 100.0, 300.0]), at(0)).unwrap_err();
        assert_eq!(err, AggregateError::InsufficientQuorum { have: 2, need: 3 });
    }

    #[test]
    fn test_divergence_after_rejection_fails() {
        let mut p = policy(2, 1.0);
        p.outlier = OutlierRule::Percent { threshold: 10.0 };
        let err = FeedAggregator::new(p).aggregate(&pts(&[100.0, 104.0, 96.0]), at(0)).unwrap_err();
        assert!(matches!(err, AggregateError::ValueDivergence { spread, .. } if (spread - 8.0).abs() < 1e-9));
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let agg = FeedAggregator::new(policy(2, 5.0));
        let a = pts(&[100.0, 100.4, 99.8, 100.1]);
        let mut b = a.clone();
        b.reverse();
        let first = agg.aggregate(&a, at(3)).unwrap();
        for _ in 0..5 {
            assert_eq!(agg.aggregate(&a, at(3)).unwrap(), first);
        }
        assert_eq!(agg.aggregate(&b, at(3)).unwrap(), first);
    }

    #[test]
    fn test_newest_point_per_source_wins() {
        let agg = FeedAggregator::new(policy(2, 5.0));
        let points = vec![
            DataPoint::new("a", 90.0, at(0)),
            DataPoint::new("a", 100.0, at(10)),
            DataPoint::new("b", 100.0, at(10)),
        ];
        assert_eq!(agg.aggregate(&points, at(11)).unwrap().value, 100.0);
    }

    #[test]
    fn test_weighted_median_uses_confidence() {
        let mut p = policy(3, 50.0);
        p.method = AggregationMethod::WeightedMedian;
        p.outlier = OutlierRule::Percent { threshold: 50.0 };
        let points = vec![
            DataPoint::new("a", 100.0, at(0)),
            DataPoint::new("b", 101.0, at(0)),
            DataPoint::new("c", 110.0, at(0)).with_confidence(Some(5.0)),
        ];
        let out = FeedAggregator::new(p).aggregate(&points, at(1)).unwrap();
        assert_eq!(out.value, 110.0);
        assert_eq!(out.method, AggregationMethod::WeightedMedian);
    }

    #[test]
    fn test_non_positive_values_are_ignored() {
        let agg = FeedAggregator::new(policy(2, 5.0));
        let err = agg.aggregate(&pts(&[100.0, 0.0, f64::NAN]), at(0)).unwrap_err();
        assert_eq!(err, AggregateError::InsufficientQuorum { have: 1, need: 2 });
    }
}
