//! Cross-validated score aggregation.
//!
//! Estimator fit tasks leave a scalar score (or nothing) in each fold
//! artifact. Assembly collects them as ordered `(composite key, score)`
//! pairs; this module reduces those pairs to one `(mean, std)` per estimator
//! display name.

use crate::layer::CaseTag;
use std::collections::HashMap;

/// The composite key an estimator artifact's score is recorded under:
/// `{case}___{instance}__{fold}` for fold fits, with an empty case part for
/// the unnamed case and no fold tag on full-data fits.
pub fn composite_key(tag: &CaseTag, name: &str) -> String {
    let case_part = match (&tag.case, tag.fold) {
        (None, _) => String::new(),
        (Some(case), None) => case.clone(),
        (Some(case), Some(fold)) => format!("{case}__{fold}"),
    };
    let instance_part = match tag.fold {
        Some(fold) => format!("{name}__{fold}"),
        None => name.to_string(),
    };
    format!("{case_part}___{instance_part}")
}

/// Reduce ordered score pairs to a `(mean, std)` per estimator.
///
/// The first `n_pred` pairs are the full-data fits; they carry no usable
/// score but name every estimator, seeding the result so an estimator with
/// no fold scores still appears — with `(NaN, NaN)`, the degenerate but
/// defined value of an empty reduction. The remaining pairs are fold fits:
/// the fold tag is stripped from the instance name, the case name keeps only
/// its first `__`-delimited segment, and present scores accumulate under the
/// resulting display name.
pub fn build_scores(
    pairs: &[(String, Option<f64>)],
    n_pred: usize,
) -> HashMap<String, (f64, f64)> {
    let n_pred = n_pred.min(pairs.len());
    let mut collected: HashMap<String, Vec<f64>> = HashMap::new();

    for (key, _) in &pairs[..n_pred] {
        let (case, instance) = split_composite(key);
        collected.entry(display_name(case, instance)).or_default();
    }

    for (key, score) in &pairs[n_pred..] {
        let (case, instance) = split_composite(key);
        let instance = strip_fold_tag(instance);
        let case = case.split("__").next().unwrap_or("");
        let scores = collected.entry(display_name(case, instance)).or_default();
        if let Some(score) = score {
            scores.push(*score);
        }
    }

    collected
        .into_iter()
        .map(|(name, scores)| (name, mean_std(&scores)))
        .collect()
}

fn split_composite(key: &str) -> (&str, &str) {
    key.split_once("___").unwrap_or(("", key))
}

fn strip_fold_tag(instance: &str) -> &str {
    match instance.rfind("__") {
        Some(cut) => &instance[..cut],
        None => instance,
    }
}

fn display_name(case: &str, instance: &str) -> String {
    if case.is_empty() {
        instance.to_string()
    } else {
        format!("{case}__{instance}")
    }
}

fn mean_std(scores: &[f64]) -> (f64, f64) {
    if scores.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = scores.len() as f64;
    let mean = scores.iter().sum::<f64>() / n;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn unnamed_case_aggregates_under_the_bare_instance_name() {
        let pairs = vec![
            ("___svc".to_string(), None),
            ("___svc__0".to_string(), Some(0.8)),
            ("___svc__1".to_string(), Some(0.9)),
            ("___svc__2".to_string(), Some(1.0)),
        ];
        let scores = build_scores(&pairs, 1);
        let (mean, std) = scores["svc"];
        assert_abs_diff_eq!(mean, 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(std, (0.02f64 / 3.0).sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn named_case_truncates_to_the_first_segment() {
        let pairs = vec![
            ("pre___ridge".to_string(), None),
            ("pre__0___ridge__0".to_string(), Some(0.5)),
            ("pre__1___ridge__1".to_string(), Some(0.7)),
        ];
        let scores = build_scores(&pairs, 1);
        let (mean, _) = scores["pre__ridge"];
        assert_abs_diff_eq!(mean, 0.6, epsilon = 1e-12);
    }

    #[test]
    fn missing_fold_scores_yield_nan() {
        let pairs = vec![
            ("___svc".to_string(), None),
            ("___svc__0".to_string(), None),
        ];
        let scores = build_scores(&pairs, 1);
        let (mean, std) = scores["svc"];
        assert!(mean.is_nan());
        assert!(std.is_nan());
    }

    #[test]
    fn composite_keys_round_trip_through_aggregation() {
        let full = composite_key(&CaseTag::new(Some("pre".to_string()), None), "svc");
        assert_eq!(full, "pre___svc");
        let fold = composite_key(&CaseTag::new(Some("pre".to_string()), Some(2)), "svc");
        assert_eq!(fold, "pre__2___svc__2");
        let unnamed = composite_key(&CaseTag::new(None, Some(1)), "svc");
        assert_eq!(unnamed, "___svc__1");

        let pairs = vec![(full, None), (fold, Some(1.0)), (unnamed, Some(0.0))];
        let scores = build_scores(&pairs, 1);
        assert_eq!(scores["pre__svc"].0, 1.0);
        // The unnamed entry was never seeded but still lands under "svc".
        assert_eq!(scores["svc"].0, 0.0);
    }
}
