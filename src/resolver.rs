//! Evaluation ordering over the entity catalog.
//!
//! Derived processes reference other catalog entries, so the catalog forms a
//! reference graph. The resolver orders every reference before its
//! dependents and rejects unknown references and cycles up front instead of
//! letting them surface mid-computation.

use crate::catalog::Catalog;
use crate::error::{BuildError, Result};
use itertools::Itertools;
use std::collections::HashMap;

#[derive(Debug)]
pub struct DependencyGraph {
    /// Entity id -> ids that must complete first.
    dependencies: HashMap<String, Vec<String>>,
    /// Entity id -> ids waiting on it.
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Build the reference graph, failing on references outside the catalog.
    pub fn from_catalog(catalog: &Catalog) -> Result<Self> {
        let mut dependencies: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for entity in &catalog.entities {
            let references = entity.references();
            for reference in &references {
                if catalog.get(reference).is_none() {
                    return Err(BuildError::UnresolvedReference {
                        entity: entity.id.clone(),
                        reference: (*reference).to_string(),
                    });
                }
                dependents
                    .entry((*reference).to_string())
                    .or_default()
                    .push(entity.id.clone());
            }
            dependencies.insert(
                entity.id.clone(),
                references.iter().map(|r| (*r).to_string()).collect(),
            );
            dependents.entry(entity.id.clone()).or_default();
        }

        Ok(Self {
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.dependencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    pub fn dependencies(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Initial pending-dependency count per entity, for ready-queue
    /// scheduling during composition.
    pub fn pending_counts(&self) -> HashMap<String, usize> {
        self.dependencies
            .iter()
            .map(|(id, deps)| (id.clone(), deps.len()))
            .collect()
    }

    /// Kahn's algorithm: every reference appears before its dependents.
    /// A non-empty residue after processing means the reference graph is
    /// cyclic.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.len()))
            .collect();

        // Sorted seed so runs produce the same order.
        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(id, _)| *id)
            .collect();
        queue.sort_unstable();
        queue.reverse();

        let mut order = Vec::with_capacity(self.dependencies.len());
        while let Some(id) = queue.pop() {
            order.push(id.to_string());
            if let Some(dependents) = self.dependents.get(id) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push(dependent.as_str());
                        }
                    }
                }
            }
        }

        if order.len() != self.dependencies.len() {
            let mut residue: Vec<&str> = in_degree
                .iter()
                .filter(|(_, &degree)| degree > 0)
                .map(|(id, _)| *id)
                .collect();
            residue.sort_unstable();
            return Err(BuildError::CycleDetected(residue.iter().join(", ")));
        }

        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Entity, EntityKind};

    fn simple(id: &str) -> Entity {
        Entity {
            id: id.to_string(),
            search: format!("{} FR", id),
            categories: Vec::new(),
            kind: EntityKind::Simple,
            ingredient: false,
            default_origin: None,
            density: None,
            visible: None,
        }
    }

    fn complex(id: &str, base: &str, variant: &str) -> Entity {
        Entity {
            kind: EntityKind::Complex {
                base: base.to_string(),
                variant: variant.to_string(),
                ratio: 1.0,
            },
            ..simple(id)
        }
    }

    #[test]
    fn test_references_come_before_dependents() {
        let catalog = Catalog::from_entities(vec![
            complex("bread", "flour", "flour-organic"),
            complex("flour", "wheat", "wheat-organic"),
            complex("flour-organic", "wheat", "wheat-organic"),
            simple("wheat"),
            simple("wheat-organic"),
        ])
        .unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();
        let order = graph.topological_sort().unwrap();

        let position = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert_eq!(order.len(), 5);
        assert!(position("wheat") < position("flour"));
        assert!(position("wheat-organic") < position("flour"));
        assert!(position("flour") < position("bread"));
        assert!(position("flour-organic") < position("bread"));
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let catalog =
            Catalog::from_entities(vec![simple("wheat"), complex("flour", "wheat", "barley")])
                .unwrap();
        let err = DependencyGraph::from_catalog(&catalog).unwrap_err();
        match err {
            BuildError::UnresolvedReference { entity, reference } => {
                assert_eq!(entity, "flour");
                assert_eq!(reference, "barley");
            }
            other => panic!("expected UnresolvedReference, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_is_detected() {
        let catalog = Catalog::from_entities(vec![
            simple("wheat"),
            complex("a", "b", "wheat"),
            complex("b", "a", "wheat"),
        ])
        .unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();
        let err = graph.topological_sort().unwrap_err();
        match err {
            BuildError::CycleDetected(residue) => {
                assert!(residue.contains('a'));
                assert!(residue.contains('b'));
            }
            other => panic!("expected CycleDetected, got {:?}", other),
        }
    }

    #[test]
    fn test_pending_counts() {
        let catalog = Catalog::from_entities(vec![
            simple("wheat"),
            simple("wheat-organic"),
            complex("flour", "wheat", "wheat-organic"),
        ])
        .unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();
        let pending = graph.pending_counts();

        assert_eq!(pending["wheat"], 0);
        assert_eq!(pending["wheat-organic"], 0);
        assert_eq!(pending["flour"], 2);
        assert_eq!(graph.dependents("wheat"), ["flour".to_string()]);
    }
}
