use super::stats::{comp_weight, percentile, sample_stdev, shrinkage_alpha, weighted_median};
use super::types::{EstimateMethod, RentComp, RentEstimate, RentPriors};

/// Combine priors and comps into one estimate.
///
/// Returns `None` when there is nothing to estimate from: no usable comps
/// and no priors. Comps with a non-finite or non-positive rent are ignored.
pub fn combine(
    priors: Option<&RentPriors>,
    comps: &[RentComp],
    max_stored_comps: usize,
) -> Option<RentEstimate> {
    let priors = priors.filter(|p| !p.is_empty());
    let usable: Vec<&RentComp> = comps
        .iter()
        .filter(|c| c.rent.is_finite() && c.rent > 0.0)
        .collect();

    if usable.is_empty() {
        let priors = priors?;
        return Some(RentEstimate {
            method: EstimateMethod::Priors,
            p25: priors.p25,
            p50: priors.p50,
            p75: priors.p75,
            stdev: None,
            comp_count: 0,
            alpha: 0.0,
            comps: Vec::new(),
        });
    }

    let weighted: Vec<(f64, f64)> = usable.iter().map(|c| (c.rent, comp_weight(c))).collect();
    let mut rents: Vec<f64> = usable.iter().map(|c| c.rent).collect();
    rents.sort_by(f64::total_cmp);

    let comp_p50 = weighted_median(&weighted);
    let comp_p25 = percentile(&rents, 0.25);
    let comp_p75 = percentile(&rents, 0.75);

    let alpha = shrinkage_alpha(usable.len());
    let blend = |comp: Option<f64>, prior: Option<f64>| match (comp, prior) {
        (Some(c), Some(p)) => Some(alpha * c + (1.0 - alpha) * p),
        (c, _) => c,
    };
    let prior = priors.copied().unwrap_or_default();

    Some(RentEstimate {
        method: EstimateMethod::Comps,
        p25: blend(comp_p25, prior.p25),
        p50: blend(comp_p50, prior.p50),
        p75: blend(comp_p75, prior.p75),
        stdev: sample_stdev(&rents),
        comp_count: usable.len(),
        alpha,
        comps: usable.into_iter().take(max_stored_comps).cloned().collect(),
    })
}
