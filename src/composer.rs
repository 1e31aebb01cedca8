//! Per-entity impact composition.
//!
//! Simple processes fan out to the impact source through a bounded worker
//! pool. Derived processes are composed from their references' results as
//! soon as both are available: a ready queue keyed by pending-dependency
//! count, no level barriers. Each entity writes only its own slot in the
//! results map, so concurrent completions never contend.

use crate::catalog::{Catalog, Entity, EntityKind};
use crate::impact::{merge_twin_indicators, substitute, ImpactVector};
use crate::resolver::DependencyGraph;
use crate::source::{EntityHandle, ImpactSource, SourceError};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

/// Attempts per source call; transient failures back off in between.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// System description stamped on constructed (derived) processes.
pub const CONSTRUCTED_BY: &str = "ecodata";

/// A fully composed process, ready for correction.
#[derive(Debug, Clone)]
pub struct ComposedProcess {
    pub id: String,
    pub name: String,
    pub identifier: String,
    pub unit: String,
    pub system_description: String,
    pub impacts: ImpactVector,
}

/// Why an entity did not make it into the dataset.
#[derive(Debug, Clone)]
pub struct EntityFailure {
    pub id: String,
    pub reason: String,
    /// Ids of entities that reference this one and were dropped with it.
    pub blocked: Vec<String>,
}

#[derive(Debug, Clone)]
enum Outcome {
    Composed(ComposedProcess),
    Unresolved { reason: String },
}

/// Composition results for a whole run.
pub struct ComposeReport {
    pub composed: BTreeMap<String, ComposedProcess>,
    pub failures: Vec<EntityFailure>,
}

pub struct Composer {
    source: Arc<dyn ImpactSource>,
    concurrency: usize,
}

impl Composer {
    pub fn new(source: Arc<dyn ImpactSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
        }
    }

    /// Compose every catalog entity in dependency order. Per-entity failures
    /// are collected, never raised: a failed entity marks its dependents
    /// unresolved and the rest of the catalog still completes.
    pub async fn compose_all(
        &self,
        catalog: &Catalog,
        graph: &DependencyGraph,
        indicators: &[String],
    ) -> ComposeReport {
        let total = catalog.len();
        let results: Arc<DashMap<String, Outcome>> = Arc::new(DashMap::new());
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let indicators: Arc<Vec<String>> = Arc::new(indicators.to_vec());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<String>();

        let mut pending = graph.pending_counts();
        let mut ready: VecDeque<String> = catalog
            .entities
            .iter()
            .filter(|e| pending.get(&e.id).copied().unwrap_or(0) == 0)
            .map(|e| e.id.clone())
            .collect();
        let mut in_flight = 0usize;
        let mut completed = 0usize;

        while completed < total {
            while let Some(id) = ready.pop_front() {
                let entity = catalog.get(&id).expect("scheduled id is in the catalog");
                match &entity.kind {
                    EntityKind::Simple => {
                        let source = Arc::clone(&self.source);
                        let results = Arc::clone(&results);
                        let semaphore = Arc::clone(&semaphore);
                        let indicators = Arc::clone(&indicators);
                        let done_tx = done_tx.clone();
                        let entity = entity.clone();
                        in_flight += 1;
                        tokio::spawn(async move {
                            let _permit =
                                semaphore.acquire().await.expect("semaphore never closes");
                            let outcome =
                                compose_simple(source.as_ref(), &entity, &indicators).await;
                            results.insert(entity.id.clone(), outcome);
                            let _ = done_tx.send(entity.id);
                        });
                    }
                    EntityKind::Complex {
                        base,
                        variant,
                        ratio,
                    } => {
                        let outcome = compose_complex(entity, base, variant, *ratio, &results);
                        results.insert(id.clone(), outcome);
                        completed += 1;
                        release_dependents(&id, graph, &mut pending, &mut ready);
                    }
                }
            }

            if completed >= total {
                break;
            }
            if in_flight == 0 {
                // Nothing running and nothing ready: the validated graph
                // guarantees this only happens once everything completed.
                break;
            }
            let Some(done_id) = done_rx.recv().await else {
                break;
            };
            in_flight -= 1;
            completed += 1;
            release_dependents(&done_id, graph, &mut pending, &mut ready);
        }

        let mut composed = BTreeMap::new();
        let mut failures = Vec::new();
        for entity in &catalog.entities {
            match lookup(&results, &entity.id) {
                Some(Outcome::Composed(process)) => {
                    composed.insert(entity.id.clone(), process);
                }
                Some(Outcome::Unresolved { reason }) => {
                    warn!("Excluding '{}' from the dataset: {}", entity.id, reason);
                    failures.push(EntityFailure {
                        id: entity.id.clone(),
                        reason,
                        blocked: graph.dependents(&entity.id).to_vec(),
                    });
                }
                None => failures.push(EntityFailure {
                    id: entity.id.clone(),
                    reason: "never scheduled".to_string(),
                    blocked: graph.dependents(&entity.id).to_vec(),
                }),
            }
        }

        ComposeReport { composed, failures }
    }
}

fn release_dependents(
    id: &str,
    graph: &DependencyGraph,
    pending: &mut HashMap<String, usize>,
    ready: &mut VecDeque<String>,
) {
    for dependent in graph.dependents(id) {
        if let Some(count) = pending.get_mut(dependent) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(dependent.clone());
            }
        }
    }
}

fn lookup(results: &DashMap<String, Outcome>, id: &str) -> Option<Outcome> {
    results.get(id).map(|entry| entry.value().clone())
}

async fn compose_simple(
    source: &dyn ImpactSource,
    entity: &Entity,
    indicators: &[String],
) -> Outcome {
    debug!("Resolving '{}' via the {} source", entity.id, source.name());
    let handle = match source.resolve(&entity.search).await {
        Ok(handle) => handle,
        Err(e) => {
            return Outcome::Unresolved {
                reason: format!("search '{}' failed: {}", entity.search, e),
            }
        }
    };

    match compute_with_retry(source, &handle, indicators).await {
        Ok(scores) => {
            let mut impacts: ImpactVector = scores.into_iter().collect();
            merge_twin_indicators(&mut impacts);
            Outcome::Composed(ComposedProcess {
                id: entity.id.clone(),
                name: handle.name,
                identifier: handle.identifier,
                unit: handle.unit,
                system_description: handle.system_description,
                impacts,
            })
        }
        Err(e) => Outcome::Unresolved {
            reason: format!("impact computation failed: {}", e),
        },
    }
}

/// Bounded retry on transient source failures. A definitive not-found is
/// never retried.
async fn compute_with_retry(
    source: &dyn ImpactSource,
    handle: &EntityHandle,
    indicators: &[String],
) -> Result<HashMap<String, f64>, SourceError> {
    let mut attempt = 1;
    loop {
        match source.compute(handle, indicators).await {
            Ok(scores) => return Ok(scores),
            Err(SourceError::Transient(reason)) if attempt < MAX_ATTEMPTS => {
                warn!(
                    "Transient source error for '{}' (attempt {}/{}): {}",
                    handle.name, attempt, MAX_ATTEMPTS, reason
                );
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn compose_complex(
    entity: &Entity,
    base_id: &str,
    variant_id: &str,
    ratio: f64,
    results: &DashMap<String, Outcome>,
) -> Outcome {
    let base = match lookup(results, base_id) {
        Some(Outcome::Composed(process)) => process,
        _ => {
            return Outcome::Unresolved {
                reason: format!("reference '{}' is unresolved", base_id),
            }
        }
    };
    let variant = match lookup(results, variant_id) {
        Some(Outcome::Composed(process)) => process,
        _ => {
            return Outcome::Unresolved {
                reason: format!("reference '{}' is unresolved", variant_id),
            }
        }
    };

    let (impacts, missing) = substitute(&base.impacts, &variant.impacts, ratio);
    for code in &missing {
        warn!(
            "Indicator '{}' missing from variant '{}' of '{}', counting zero",
            code, variant_id, entity.id
        );
    }

    let name = format!("{}, constructed by {}", entity.id, CONSTRUCTED_BY);
    let identifier = format!("{:x}", Sha256::digest(name.as_bytes()));
    Outcome::Composed(ComposedProcess {
        id: entity.id.clone(),
        name,
        identifier,
        unit: base.unit.clone(),
        system_description: CONSTRUCTED_BY.to_string(),
        impacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{StaticActivity, StaticSource};

    fn simple(id: &str, search: &str) -> Entity {
        Entity {
            id: id.to_string(),
            search: search.to_string(),
            categories: Vec::new(),
            kind: EntityKind::Simple,
            ingredient: false,
            default_origin: None,
            density: None,
            visible: None,
        }
    }

    fn complex(id: &str, base: &str, variant: &str, ratio: f64) -> Entity {
        Entity {
            kind: EntityKind::Complex {
                base: base.to_string(),
                variant: variant.to_string(),
                ratio,
            },
            ..simple(id, "unused")
        }
    }

    fn activity(name: &str, identifier: &str, impacts: &[(&str, f64)]) -> StaticActivity {
        StaticActivity {
            name: name.to_string(),
            identifier: identifier.to_string(),
            unit: "kg".to_string(),
            system_description: "agribalyse".to_string(),
            impacts: impacts.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn source() -> Arc<StaticSource> {
        Arc::new(StaticSource::new(HashMap::from([
            (
                "wheat organic FR".to_string(),
                activity("Wheat, organic", "wheat-organic", &[("cch", 10.0)]),
            ),
            (
                "wheat conventional FR".to_string(),
                activity("Wheat, conventional", "wheat-conv", &[("cch", 8.0)]),
            ),
        ])))
    }

    #[tokio::test]
    async fn test_substitution_formula_end_to_end() {
        let catalog = Catalog::from_entities(vec![
            simple("wheat", "wheat organic FR"),
            simple("wheat-conventional", "wheat conventional FR"),
            complex("flour-organic", "wheat", "wheat-conventional", 1.2),
        ])
        .unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();

        let composer = Composer::new(source(), 4);
        let report = composer
            .compose_all(&catalog, &graph, &["cch".to_string()])
            .await;

        assert!(report.failures.is_empty());
        let flour = &report.composed["flour-organic"];
        assert!((flour.impacts["cch"] - 7.6).abs() < 1e-12);
        assert_eq!(flour.system_description, CONSTRUCTED_BY);
        assert_eq!(flour.unit, "kg");
    }

    #[tokio::test]
    async fn test_constructed_identifier_is_stable() {
        let catalog = Catalog::from_entities(vec![
            simple("wheat", "wheat organic FR"),
            simple("wheat-conventional", "wheat conventional FR"),
            complex("flour-organic", "wheat", "wheat-conventional", 1.2),
        ])
        .unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();
        let composer = Composer::new(source(), 4);

        let first = composer
            .compose_all(&catalog, &graph, &["cch".to_string()])
            .await;
        let second = composer
            .compose_all(&catalog, &graph, &["cch".to_string()])
            .await;

        assert_eq!(
            first.composed["flour-organic"].identifier,
            second.composed["flour-organic"].identifier
        );
        assert_eq!(first.composed["flour-organic"].identifier.len(), 64);
    }

    #[tokio::test]
    async fn test_failed_dependency_marks_dependents_unresolved() {
        let catalog = Catalog::from_entities(vec![
            simple("wheat", "wheat organic FR"),
            simple("barley", "no such activity"),
            complex("malt", "barley", "wheat", 1.1),
            complex("flour", "wheat", "wheat", 1.16),
        ])
        .unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();

        let composer = Composer::new(source(), 4);
        let report = composer
            .compose_all(&catalog, &graph, &["cch".to_string()])
            .await;

        assert!(report.composed.contains_key("wheat"));
        assert!(report.composed.contains_key("flour"));
        assert!(!report.composed.contains_key("barley"));
        assert!(!report.composed.contains_key("malt"));

        let barley = report.failures.iter().find(|f| f.id == "barley").unwrap();
        assert_eq!(barley.blocked, vec!["malt".to_string()]);
        let malt = report.failures.iter().find(|f| f.id == "malt").unwrap();
        assert!(malt.reason.contains("barley"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct FlakySource {
            inner: StaticSource,
            failures_left: AtomicUsize,
        }

        #[async_trait]
        impl ImpactSource for FlakySource {
            fn name(&self) -> &'static str {
                "flaky"
            }

            async fn resolve(
                &self,
                search_key: &str,
            ) -> std::result::Result<EntityHandle, SourceError> {
                self.inner.resolve(search_key).await
            }

            async fn compute(
                &self,
                handle: &EntityHandle,
                indicators: &[String],
            ) -> std::result::Result<HashMap<String, f64>, SourceError> {
                if self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(SourceError::Transient("engine busy".to_string()));
                }
                self.inner.compute(handle, indicators).await
            }
        }

        let flaky = Arc::new(FlakySource {
            inner: StaticSource::new(HashMap::from([(
                "wheat organic FR".to_string(),
                activity("Wheat, organic", "wheat-organic", &[("cch", 10.0)]),
            )])),
            failures_left: AtomicUsize::new(2),
        });

        let catalog = Catalog::from_entities(vec![simple("wheat", "wheat organic FR")]).unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();

        let composer = Composer::new(flaky, 1);
        let report = composer
            .compose_all(&catalog, &graph, &["cch".to_string()])
            .await;

        assert!(report.failures.is_empty());
        assert_eq!(report.composed["wheat"].impacts["cch"], 10.0);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct MissingSource {
            compute_calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl ImpactSource for MissingSource {
            fn name(&self) -> &'static str {
                "missing"
            }

            async fn resolve(
                &self,
                _search_key: &str,
            ) -> std::result::Result<EntityHandle, SourceError> {
                Ok(EntityHandle {
                    name: "ghost".to_string(),
                    identifier: "ghost".to_string(),
                    unit: "kg".to_string(),
                    system_description: "agribalyse".to_string(),
                })
            }

            async fn compute(
                &self,
                handle: &EntityHandle,
                _indicators: &[String],
            ) -> std::result::Result<HashMap<String, f64>, SourceError> {
                self.compute_calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::NotFound(handle.identifier.clone()))
            }
        }

        let missing = Arc::new(MissingSource {
            compute_calls: AtomicUsize::new(0),
        });
        let catalog = Catalog::from_entities(vec![simple("ghost", "ghost FR")]).unwrap();
        let graph = DependencyGraph::from_catalog(&catalog).unwrap();

        let composer = Composer::new(missing.clone(), 1);
        let report = composer
            .compose_all(&catalog, &graph, &["cch".to_string()])
            .await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(missing.compute_calls.load(Ordering::SeqCst), 1);
    }
}
