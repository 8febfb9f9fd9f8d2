// src/feed/stats.rs
//! Order statistics over slices that are already sorted ascending.

/// Middle value; mean of the two middle values for even lengths.
pub fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 { sorted[n / 2] } else { 0.5 * (sorted[n / 2 - 1] + sorted[n / 2]) }
}

/// Scaled median absolute deviation around `center`.
pub fn mad(values: &[f64], center: f64) -> f64 {
    let mut devs: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    devs.sort_by(f64::total_cmp);
    (1.4826 * median(&devs)).max(center.abs() * 1e-12) // consistent MAD
}

pub fn trimmed_mean(sorted: &[f64], trim_fraction: f64) -> f64 {
    let n = sorted.len();
    let mut cut = (n as f64 * trim_fraction).floor() as usize;
    if 2 * cut >= n { cut = (n - 1) / 2; }
    let kept = &sorted[cut..n - cut];
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Lower weighted median: first value whose cumulative weight reaches half the total.
/// Falls back to the plain median when no point carries weight.
pub fn weighted_median(sorted: &[(f64, f64)]) -> f64 {
    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        let vs: Vec<f64> = sorted.iter().map(|(v, _)| *v).collect();
        return median(&vs);
    }
    let half = total / 2.0;
    let mut acc = 0.0;
    for (v, w) in sorted {
        acc += w;
        if acc >= half { return *v; }
    }
    sorted[sorted.len() - 1].0
}

/// (max - min) / center, in percent.
pub fn spread_percent(sorted: &[f64], center: f64) -> f64 {
    match (sorted.first(), sorted.last()) {
        (Some(lo), Some(hi)) if center > 0.0 => (hi - lo) / center * 100.0,
        _ => 0.0,
    }
}
