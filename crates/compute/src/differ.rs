//! Material-change detection between the stored and recomputed artifact.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use rentflow_core::artifact::COMPUTED_AT_FIELD;
use rentflow_core::DerivedArtifact;

pub trait Differ<P>: Send + Sync {
    /// `true` when `next` should replace `previous` and be announced downstream.
    /// A missing previous artifact always counts as changed.
    fn has_changed(&self, previous: Option<&DerivedArtifact<P>>, next: &DerivedArtifact<P>) -> bool;
}

/// Deep equality on the JSON form with volatile keys stripped at every depth.
#[derive(Debug, Clone)]
pub struct StructuralDiffer {
    volatile: BTreeSet<String>,
}

impl StructuralDiffer {
    pub fn new<I, S>(volatile: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            volatile: volatile.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for StructuralDiffer {
    fn default() -> Self {
        Self::new([COMPUTED_AT_FIELD])
    }
}

/// Remove every object key in `volatile`, recursively.
pub fn strip_volatile(value: &mut Value, volatile: &BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            map.retain(|k, _| !volatile.contains(k));
            for v in map.values_mut() {
                strip_volatile(v, volatile);
            }
        }
        Value::Array(items) => {
            for v in items {
                strip_volatile(v, volatile);
            }
        }
        _ => {}
    }
}

impl<P: Serialize> Differ<P> for StructuralDiffer {
    fn has_changed(&self, previous: Option<&DerivedArtifact<P>>, next: &DerivedArtifact<P>) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        match (serde_json::to_value(previous), serde_json::to_value(next)) {
            (Ok(mut prev), Ok(mut next)) => {
                strip_volatile(&mut prev, &self.volatile);
                strip_volatile(&mut next, &self.volatile);
                prev != next
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(entity_id = %next.entity_id, error = %e, "artifact not serializable, treating as changed");
                true
            }
        }
    }
}

/// Payloads that expose a central value for tolerance comparison.
pub trait HasMedian {
    fn median(&self) -> Option<f64>;
}

/// Changed iff the median moved by at least `threshold` relative to the
/// previous median (inclusive).
#[derive(Debug, Clone, Copy)]
pub struct ToleranceDiffer {
    threshold: f64,
}

impl ToleranceDiffer {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for ToleranceDiffer {
    fn default() -> Self {
        Self::new(0.03)
    }
}

impl<P: HasMedian> Differ<P> for ToleranceDiffer {
    fn has_changed(&self, previous: Option<&DerivedArtifact<P>>, next: &DerivedArtifact<P>) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        match (previous.payload.median(), next.payload.median()) {
            (None, None) => false,
            (Some(_), None) | (None, Some(_)) => true,
            (Some(prev), Some(next)) if prev == 0.0 => next != prev,
            (Some(prev), Some(next)) => ((next - prev) / prev).abs() >= self.threshold,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn artifact<P>(payload: P, minutes: i64) -> DerivedArtifact<P> {
        DerivedArtifact {
            entity_id: "L1".into(),
            input_version: "v1".into(),
            schema_version: 1,
            computed_at: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes),
            payload,
        }
    }

    struct Median(Option<f64>);

    impl HasMedian for Median {
        fn median(&self) -> Option<f64> {
            self.0
        }
    }

    #[test]
    fn structural_ignores_computed_at_at_any_depth() {
        let differ = StructuralDiffer::default();
        let prev = artifact(json!({"score": 7, "inner": {"computed_at": "a"}}), 0);
        let next = artifact(json!({"score": 7, "inner": {"computed_at": "b"}}), 5);
        assert!(!differ.has_changed(Some(&prev), &next));
    }

    #[test]
    fn structural_detects_payload_change() {
        let differ = StructuralDiffer::default();
        let prev = artifact(json!({"photos": [1, 2]}), 0);
        let next = artifact(json!({"photos": [1, 2, 3]}), 0);
        assert!(differ.has_changed(Some(&prev), &next));
        assert!(differ.has_changed(None, &next));
    }

    #[test]
    fn strip_volatile_walks_arrays() {
        let volatile: BTreeSet<String> = ["computed_at".to_string()].into();
        let mut value = json!([{"computed_at": 1, "k": 2}, {"nested": [{"computed_at": 3}]}]);
        strip_volatile(&mut value, &volatile);
        assert_eq!(value, json!([{"k": 2}, {"nested": [{}]}]));
    }

    #[test]
    fn tolerance_threshold_is_inclusive() {
        let differ = ToleranceDiffer::new(0.03);
        let prev = artifact(Median(Some(3000.0)), 0);
        assert!(differ.has_changed(Some(&prev), &artifact(Median(Some(3090.0)), 0)));
        assert!(!differ.has_changed(Some(&prev), &artifact(Median(Some(3089.0)), 0)));
        assert!(differ.has_changed(Some(&prev), &artifact(Median(Some(2910.0)), 0)));
    }

    #[test]
    fn tolerance_missing_values() {
        let differ = ToleranceDiffer::default();
        let some = artifact(Median(Some(2000.0)), 0);
        let none = artifact(Median(None), 0);
        assert!(differ.has_changed(None, &some));
        assert!(differ.has_changed(Some(&none), &some));
        assert!(differ.has_changed(Some(&some), &none));
        assert!(!differ.has_changed(Some(&none), &artifact(Median(None), 1)));
    }

    #[test]
    fn tolerance_zero_previous() {
        let differ = ToleranceDiffer::default();
        let zero = artifact(Median(Some(0.0)), 0);
        assert!(!differ.has_changed(Some(&zero), &artifact(Median(Some(0.0)), 0)));
        assert!(differ.has_changed(Some(&zero), &artifact(Median(Some(1.0)), 0)));
    }
}
