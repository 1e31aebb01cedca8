//! Indicator definitions and the weighted-correction step.
//!
//! The definition file is keyed by reported indicator code; an entry may
//! carry a `correction`, a weighted fold of raw sub-indicators into that
//! reported code.

use crate::error::{BuildError, Result};
use crate::impact::{source_codes, ImpactVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionTerm {
    #[serde(rename = "sub-impact")]
    pub sub_impact: String,
    pub weighting: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndicatorDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Weighted fold of sub-indicators into this reported indicator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<Vec<CorrectionTerm>>,
}

#[derive(Debug)]
pub struct IndicatorSet {
    definitions: BTreeMap<String, IndicatorDef>,
}

impl IndicatorSet {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let definitions: BTreeMap<String, IndicatorDef> = serde_json::from_str(&content)
            .map_err(|e| BuildError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        Self::from_definitions(definitions)
    }

    pub fn from_definitions(definitions: BTreeMap<String, IndicatorDef>) -> Result<Self> {
        for (code, def) in &definitions {
            if let Some(correction) = &def.correction {
                if correction.is_empty() {
                    return Err(BuildError::Config(format!(
                        "Correction for indicator '{}' has no weighting entries",
                        code
                    )));
                }
            }
        }
        Ok(Self { definitions })
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Indicator codes to request from the impact source. Merged twin codes
    /// are replaced by the codes the engine actually returns.
    pub fn requested_codes(&self) -> Vec<String> {
        let mut codes = Vec::new();
        for code in self.definitions.keys() {
            for source_code in source_codes(code) {
                if !codes.contains(&source_code) {
                    codes.push(source_code);
                }
            }
        }
        codes
    }

    /// Fold sub-indicators into their reported indicator and drop them.
    ///
    /// A listed sub-indicator missing from the raw vector contributes zero;
    /// indicators no correction mentions pass through untouched. Corrections
    /// never reference each other's outputs, so application order does not
    /// matter.
    pub fn apply_corrections(&self, entity_id: &str, raw: &ImpactVector) -> ImpactVector {
        let mut corrected = raw.clone();
        for (reported, def) in &self.definitions {
            let Some(terms) = &def.correction else {
                continue;
            };
            let mut score = 0.0;
            for term in terms {
                match corrected.remove(&term.sub_impact) {
                    Some(sub_score) => score += sub_score * term.weighting,
                    None => warn!(
                        "Missing sub-indicator '{}' for '{}' while correcting '{}', counting zero",
                        term.sub_impact, entity_id, reported
                    ),
                }
            }
            corrected.insert(reported.clone(), score);
        }
        corrected
    }
}
