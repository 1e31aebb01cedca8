//! Run orchestration: load, order, compose, correct, diff, write.
//!
//! Fatal problems (bad configuration, unresolved or cyclic references) stop
//! the run before anything is written. Per-entity problems degrade: the
//! affected entities are excluded, everything else is still published.

use crate::catalog::Catalog;
use crate::composer::{Composer, EntityFailure};
use crate::dataset::{self, Dataset, ProcessEntry};
use crate::diff::{self, ChangeReport};
use crate::error::Result;
use crate::indicators::IndicatorSet;
use crate::resolver::DependencyGraph;
use crate::source::{CachedSource, ImpactSource};
use itertools::Itertools;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Run stages, in order. A run that aborts does so from `Loading` or
/// `Ordering`; the later stages degrade per-entity instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loading,
    Ordering,
    Composing,
    Correcting,
    Diffing,
    Writing,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Loading => "loading",
            Stage::Ordering => "ordering",
            Stage::Composing => "composing",
            Stage::Correcting => "correcting",
            Stage::Diffing => "diffing",
            Stage::Writing => "writing",
            Stage::Done => "done",
        };
        write!(f, "{}", name)
    }
}

pub struct PipelineConfig {
    pub catalog_path: PathBuf,
    pub indicators_path: PathBuf,
    pub output_path: PathBuf,
    /// Optional ingredient listing output.
    pub ingredients_path: Option<PathBuf>,
    /// Dataset to diff against; defaults to the output path.
    pub previous_path: Option<PathBuf>,
    /// Maximum concurrent impact-source calls.
    pub concurrency: usize,
}

pub struct BuildPipeline {
    config: PipelineConfig,
    source: Arc<dyn ImpactSource>,
}

impl BuildPipeline {
    pub fn new(config: PipelineConfig, source: Arc<dyn ImpactSource>) -> Self {
        Self { config, source }
    }

    pub async fn run(&self) -> Result<RunSummary> {
        info!("[{}] Reading catalog and indicator definitions", Stage::Loading);
        let catalog = Catalog::load(&self.config.catalog_path)?;
        let indicators = IndicatorSet::load(&self.config.indicators_path)?;
        info!(
            "Loaded {} catalog entities and {} indicator definitions",
            catalog.len(),
            indicators.len()
        );

        info!("[{}] Building the reference graph", Stage::Ordering);
        let graph = DependencyGraph::from_catalog(&catalog)?;
        let order = graph.topological_sort()?;

        info!(
            "[{}] Composing impacts for {} entities ({} parallel source calls)",
            Stage::Composing,
            order.len(),
            self.config.concurrency
        );
        let cached = Arc::new(CachedSource::new(Arc::clone(&self.source)));
        let composer = Composer::new(cached, self.config.concurrency);
        let requested = indicators.requested_codes();
        let compose_report = composer.compose_all(&catalog, &graph, &requested).await;

        info!("[{}] Applying corrections", Stage::Correcting);
        let mut published = Dataset::new();
        for (id, process) in &compose_report.composed {
            let entity = catalog.get(id).expect("composed id is in the catalog");
            published.insert(
                id.clone(),
                ProcessEntry {
                    name: process.name.clone(),
                    unit: process.unit.clone(),
                    identifier: process.identifier.clone(),
                    system_description: process.system_description.clone(),
                    category_tags: entity.categories.clone(),
                    impacts: indicators.apply_corrections(id, &process.impacts),
                },
            );
        }

        info!("[{}] Comparing against the previous dataset", Stage::Diffing);
        let previous_path = self
            .config
            .previous_path
            .clone()
            .unwrap_or_else(|| self.config.output_path.clone());
        let previous = dataset::load_previous(&previous_path)?;
        let changes = diff::compare(previous.as_ref(), &published);

        info!(
            "[{}] Writing {} processes to {}",
            Stage::Writing,
            published.len(),
            self.config.output_path.display()
        );
        dataset::write_json(&self.config.output_path, &published)?;
        if let Some(ingredients_path) = &self.config.ingredients_path {
            let ingredients = dataset::ingredient_entries(&catalog, &compose_report.composed);
            info!(
                "Writing {} ingredients to {}",
                ingredients.len(),
                ingredients_path.display()
            );
            dataset::write_json(ingredients_path, &ingredients)?;
        }

        info!(
            "[{}] {} resolved, {} unresolved",
            Stage::Done,
            published.len(),
            compose_report.failures.len()
        );
        Ok(RunSummary {
            total: catalog.len(),
            resolved: published.len(),
            failures: compose_report.failures,
            changes,
        })
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub total: usize,
    pub resolved: usize,
    pub failures: Vec<EntityFailure>,
    pub changes: ChangeReport,
}

impl RunSummary {
    pub fn unresolved(&self) -> usize {
        self.failures.len()
    }

    /// A failed entity with dependents means derived processes were dropped
    /// with it and the run counts as failed overall. Isolated failures are
    /// an accepted partial result.
    pub fn is_success(&self) -> bool {
        self.failures.iter().all(|f| f.blocked.is_empty())
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Run Summary ===")?;
        writeln!(
            f,
            "Entities: {} total, {} resolved, {} unresolved",
            self.total,
            self.resolved,
            self.unresolved()
        )?;

        if !self.failures.is_empty() {
            writeln!(f, "\n=== Failures ===")?;
            for failure in &self.failures {
                writeln!(f, "- {}: {}", failure.id, failure.reason)?;
                if !failure.blocked.is_empty() {
                    writeln!(f, "  blocks: {}", failure.blocked.iter().join(", "))?;
                }
            }
        }

        writeln!(f, "\n=== Changes ===")?;
        write!(f, "{}", self.changes)?;
        Ok(())
    }
}
