use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// How a process gets its impacts: straight from the engine, or derived
/// from two other catalog entries via a ratio-weighted substitution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    Simple,
    Complex {
        base: String,
        variant: String,
        ratio: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    /// Opaque descriptor handed to the impact source.
    pub search: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(flatten)]
    pub kind: EntityKind,
    /// Entities flagged as ingredients are exported to the ingredient listing.
    #[serde(default)]
    pub ingredient: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub density: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
}

impl Entity {
    pub fn is_complex(&self) -> bool {
        matches!(self.kind, EntityKind::Complex { .. })
    }

    /// Ids of the catalog entries this entity depends on (empty for simple).
    pub fn references(&self) -> Vec<&str> {
        match &self.kind {
            EntityKind::Simple => Vec::new(),
            EntityKind::Complex { base, variant, .. } => vec![base.as_str(), variant.as_str()],
        }
    }
}

/// The full entity catalog, loaded once per run and read-only afterwards.
#[derive(Debug)]
pub struct Catalog {
    pub entities: Vec<Entity>,
    pub by_id: HashMap<String, Entity>,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let entities: Vec<Entity> = serde_json::from_str(&content)
            .map_err(|e| BuildError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        Self::from_entities(entities)
    }

    pub fn from_entities(entities: Vec<Entity>) -> Result<Self> {
        let mut seen = HashSet::new();
        for entity in &entities {
            if entity.id.trim().is_empty() {
                return Err(BuildError::Config("Entity with an empty id".to_string()));
            }
            if entity.search.trim().is_empty() {
                return Err(BuildError::Config(format!(
                    "Entity '{}' has an empty search key",
                    entity.id
                )));
            }
            if !seen.insert(entity.id.clone()) {
                return Err(BuildError::Config(format!(
                    "Duplicate entity id '{}'",
                    entity.id
                )));
            }
            if let EntityKind::Complex { base, variant, ratio } = &entity.kind {
                if *ratio <= 0.0 {
                    return Err(BuildError::Config(format!(
                        "Entity '{}' has a non-positive ratio {}",
                        entity.id, ratio
                    )));
                }
                if base == &entity.id || variant == &entity.id {
                    return Err(BuildError::Config(format!(
                        "Entity '{}' references itself",
                        entity.id
                    )));
                }
            }
        }

        let by_id = entities
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();

        Ok(Catalog { entities, by_id })
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.by_id.get(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
