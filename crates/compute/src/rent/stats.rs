//! Small statistics helpers for rent combination.

use super::types::RentComp;

const DEFAULT_DISTANCE_KM: f64 = 1.0;
const DEFAULT_DAYS_OLD: f64 = 30.0;
/// Shrinkage never trusts comps more than this.
pub const MAX_ALPHA: f64 = 0.7;

/// `1/(1+distance_km) * 1/(1+days_old/30)`; closer and fresher weighs more.
pub fn comp_weight(comp: &RentComp) -> f64 {
    let distance = comp.distance_km.unwrap_or(DEFAULT_DISTANCE_KM).max(0.0);
    let days = comp.days_old.unwrap_or(DEFAULT_DAYS_OLD).max(0.0);
    1.0 / (1.0 + distance) * (1.0 / (1.0 + days / 30.0))
}

/// Value at which the cumulative weight, in value order, first reaches half
/// the total.
pub fn weighted_median(points: &[(f64, f64)]) -> Option<f64> {
    if points.is_empty() {
        return None;
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return None;
    }
    let half = total / 2.0;
    let mut cumulative = 0.0;
    for (value, weight) in &sorted {
        cumulative += weight;
        if cumulative >= half {
            return Some(*value);
        }
    }
    sorted.last().map(|(v, _)| *v)
}

/// Linear-interpolated percentile; `sorted` must be ascending, `q` in [0, 1].
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
        }
    }
}

/// Sample standard deviation (n-1 denominator).
pub fn sample_stdev(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    Some(var.sqrt())
}

/// `min(0.7, n/10)`
pub fn shrinkage_alpha(comp_count: usize) -> f64 {
    (comp_count as f64 / 10.0).min(MAX_ALPHA)
}
