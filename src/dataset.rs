//! Published dataset files: the process dataset, the ingredient listing,
//! and the previous-run loader the change reporter diffs against.

use crate::catalog::Catalog;
use crate::composer::ComposedProcess;
use crate::error::Result;
use crate::impact::ImpactVector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub name: String,
    pub unit: String,
    pub identifier: String,
    pub system_description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category_tags: Vec<String>,
    pub impacts: ImpactVector,
}

/// Entity id -> published entry. BTreeMap so the serialized key order never
/// depends on how composition was scheduled.
pub type Dataset = BTreeMap<String, ProcessEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientEntry {
    pub id: String,
    pub name: String,
    /// Identifier of the process backing this ingredient by default.
    pub default: String,
    pub categories: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

/// Load the previously published dataset. A missing file is not an error,
/// the change report then shows every process as added.
pub fn load_previous(path: impl AsRef<Path>) -> Result<Option<Dataset>> {
    let path = path.as_ref();
    if !path.exists() {
        info!(
            "No previous dataset at {}, reporting everything as added",
            path.display()
        );
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

/// Write pretty-printed JSON with a trailing newline so editors that add
/// one do not produce a spurious diff.
pub fn write_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut payload = serde_json::to_string_pretty(value)?;
    payload.push('\n');
    std::fs::write(path, payload)?;
    Ok(())
}

/// Ingredient listing for catalog entries flagged as ingredients, built
/// from their composed processes. Entries whose process never resolved are
/// skipped; the failure is already on the run summary.
pub fn ingredient_entries(
    catalog: &Catalog,
    composed: &BTreeMap<String, ComposedProcess>,
) -> Vec<IngredientEntry> {
    catalog
        .entities
        .iter()
        .filter(|entity| entity.ingredient)
        .filter_map(|entity| {
            let process = composed.get(&entity.id)?;
            Some(IngredientEntry {
                id: entity.id.clone(),
                name: process.name.clone(),
                default: process.identifier.clone(),
                categories: entity
                    .categories
                    .iter()
                    .filter(|c| c.as_str() != "ingredient")
                    .cloned()
                    .collect(),
                default_origin: entity.default_origin.clone(),
                density: entity.density,
                visible: entity.visible,
            })
        })
        .collect()
}
