//! Impact vector arithmetic.
//!
//! Raw vectors come back from the LCA engine with some phenomena split into
//! twin sub-scores; `merge_twin_indicators` folds those into one reported
//! code. `substitute` is the marginal-swap formula for derived processes.

use std::collections::BTreeMap;

/// Indicator code -> score. Ordered map so serialization and iteration are
/// deterministic.
pub type ImpactVector = BTreeMap<String, f64>;

/// Twin sub-scores merged into one reported indicator: (a, b) -> merged.
/// These mirror the split freshwater-ecotoxicity and human-toxicity scores
/// of the upstream method set.
pub const TWIN_INDICATORS: &[(&str, &str, &str)] = &[
    ("etf-o1", "etf-o2", "etf-o"),
    ("etf1", "etf2", "etf"),
];

/// Sum each twin pair into its merged code and drop the source codes.
/// Running this twice is a no-op since the source codes are gone after the
/// first pass.
pub fn merge_twin_indicators(impacts: &mut ImpactVector) {
    for (a, b, merged) in TWIN_INDICATORS {
        let left = impacts.remove(*a);
        let right = impacts.remove(*b);
        if left.is_some() || right.is_some() {
            impacts.insert(
                (*merged).to_string(),
                left.unwrap_or(0.0) + right.unwrap_or(0.0),
            );
        }
    }
}

/// Expand a reported indicator code into the codes the engine actually
/// returns: merged codes are queried through their twin source codes.
pub fn source_codes(code: &str) -> Vec<String> {
    for (a, b, merged) in TWIN_INDICATORS {
        if *merged == code {
            return vec![(*a).to_string(), (*b).to_string()];
        }
    }
    vec![code.to_string()]
}

/// Derived-process substitution: for every indicator of the base,
/// `base + ratio * (variant - base)`.
///
/// The ratio is the quantity of the variant input needed per unit of the
/// derived output (1.16 kg of wheat per kg of flour gives ratio = 1.16).
/// Returns the composed vector plus any indicator codes missing from the
/// variant; those contribute zero and are reported to the caller.
pub fn substitute(
    base: &ImpactVector,
    variant: &ImpactVector,
    ratio: f64,
) -> (ImpactVector, Vec<String>) {
    let mut composed = ImpactVector::new();
    let mut missing = Vec::new();
    for (code, base_score) in base {
        let variant_score = match variant.get(code) {
            Some(score) => *score,
            None => {
                missing.push(code.clone());
                0.0
            }
        };
        composed.insert(code.clone(), base_score + ratio * (variant_score - base_score));
    }
    (composed, missing)
}
