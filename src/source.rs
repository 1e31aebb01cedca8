//! Impact vector source, the seam to the external LCA engine.
//!
//! Implementations are pluggable behind the `ImpactSource` trait: an HTTP
//! client against a running engine service, and an in-memory fixture source
//! for tests and offline runs. `CachedSource` adds a per-run read-through
//! cache for activity lookups.

use crate::error::{BuildError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by an impact source. `Transient` is worth retrying,
/// `NotFound` never is.
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Other(String),
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// A resolved engine activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityHandle {
    pub name: String,
    pub identifier: String,
    pub unit: String,
    pub system_description: String,
}

#[async_trait]
pub trait ImpactSource: Send + Sync {
    /// Source name, for logs.
    fn name(&self) -> &'static str;

    /// Look up an activity by its opaque search key.
    async fn resolve(&self, search_key: &str) -> SourceResult<EntityHandle>;

    /// Compute the requested indicator scores for a resolved activity.
    async fn compute(
        &self,
        handle: &EntityHandle,
        indicators: &[String],
    ) -> SourceResult<HashMap<String, f64>>;
}

/// HTTP-backed source talking to an LCA engine service.
pub struct HttpSource {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ComputeRequest<'a> {
    identifier: &'a str,
    indicators: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    results: Vec<EntityHandle>,
}

#[derive(Debug, Deserialize)]
struct ComputeResponse {
    impacts: HashMap<String, f64>,
}

impl HttpSource {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client for the impact source");

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Create the source from `ECODATA_SOURCE_URL`, defaulting to a local
    /// engine service.
    pub fn from_env() -> Self {
        let base_url = std::env::var("ECODATA_SOURCE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());
        Self::new(base_url)
    }

    fn classify(err: reqwest::Error) -> SourceError {
        if err.is_timeout() || err.is_connect() {
            SourceError::Transient(err.to_string())
        } else {
            SourceError::Other(err.to_string())
        }
    }

    fn classify_status(status: reqwest::StatusCode, what: &str, key: &str) -> Option<SourceError> {
        if status == reqwest::StatusCode::NOT_FOUND {
            return Some(SourceError::NotFound(key.to_string()));
        }
        if status.is_server_error() {
            return Some(SourceError::Transient(format!("{} returned {}", what, status)));
        }
        if !status.is_success() {
            return Some(SourceError::Other(format!("{} returned {}", what, status)));
        }
        None
    }
}

#[async_trait]
impl ImpactSource for HttpSource {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn resolve(&self, search_key: &str) -> SourceResult<EntityHandle> {
        let url = format!("{}/activities/search", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("q", search_key)])
            .send()
            .await
            .map_err(Self::classify)?;

        if let Some(err) = Self::classify_status(response.status(), "search", search_key) {
            return Err(err);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Other(format!("bad search payload: {}", e)))?;

        parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| SourceError::NotFound(search_key.to_string()))
    }

    async fn compute(
        &self,
        handle: &EntityHandle,
        indicators: &[String],
    ) -> SourceResult<HashMap<String, f64>> {
        let url = format!("{}/impacts", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&ComputeRequest {
                identifier: &handle.identifier,
                indicators,
            })
            .send()
            .await
            .map_err(Self::classify)?;

        if let Some(err) = Self::classify_status(response.status(), "compute", &handle.identifier) {
            return Err(err);
        }

        let parsed: ComputeResponse = response
            .json()
            .await
            .map_err(|e| SourceError::Other(format!("bad compute payload: {}", e)))?;

        Ok(parsed.impacts)
    }
}

/// One fixture activity: the handle fields plus its indicator scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticActivity {
    pub name: String,
    pub identifier: String,
    pub unit: String,
    pub system_description: String,
    pub impacts: HashMap<String, f64>,
}

/// In-memory source backed by fixture data, keyed by search key. Stands in
/// for the engine in tests and offline runs.
#[derive(Default)]
pub struct StaticSource {
    activities: HashMap<String, StaticActivity>,
}

impl StaticSource {
    pub fn new(activities: HashMap<String, StaticActivity>) -> Self {
        Self { activities }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let activities: HashMap<String, StaticActivity> = serde_json::from_str(&content)
            .map_err(|e| BuildError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        Ok(Self::new(activities))
    }
}

#[async_trait]
impl ImpactSource for StaticSource {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn resolve(&self, search_key: &str) -> SourceResult<EntityHandle> {
        self.activities
            .get(search_key)
            .map(|activity| EntityHandle {
                name: activity.name.clone(),
                identifier: activity.identifier.clone(),
                unit: activity.unit.clone(),
                system_description: activity.system_description.clone(),
            })
            .ok_or_else(|| SourceError::NotFound(search_key.to_string()))
    }

    async fn compute(
        &self,
        handle: &EntityHandle,
        indicators: &[String],
    ) -> SourceResult<HashMap<String, f64>> {
        let activity = self
            .activities
            .values()
            .find(|a| a.identifier == handle.identifier)
            .ok_or_else(|| SourceError::NotFound(handle.identifier.clone()))?;

        Ok(indicators
            .iter()
            .filter_map(|code| activity.impacts.get(code).map(|score| (code.clone(), *score)))
            .collect())
    }
}

/// Read-through activity-lookup cache scoped to one run. Search keys repeat
/// across catalog entries, and each one hits the engine only once.
pub struct CachedSource {
    inner: Arc<dyn ImpactSource>,
    resolved: DashMap<String, EntityHandle>,
}

impl CachedSource {
    pub fn new(inner: Arc<dyn ImpactSource>) -> Self {
        Self {
            inner,
            resolved: DashMap::new(),
        }
    }
}

#[async_trait]
impl ImpactSource for CachedSource {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn resolve(&self, search_key: &str) -> SourceResult<EntityHandle> {
        if let Some(handle) = self.resolved.get(search_key) {
            return Ok(handle.clone());
        }
        let handle = self.inner.resolve(search_key).await?;
        self.resolved.insert(search_key.to_string(), handle.clone());
        Ok(handle)
    }

    async fn compute(
        &self,
        handle: &EntityHandle,
        indicators: &[String],
    ) -> SourceResult<HashMap<String, f64>> {
        self.inner.compute(handle, indicators).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: StaticSource,
        resolve_calls: AtomicUsize,
    }

    #[async_trait]
    impl ImpactSource for CountingSource {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn resolve(&self, search_key: &str) -> SourceResult<EntityHandle> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(search_key).await
        }

        async fn compute(
            &self,
            handle: &EntityHandle,
            indicators: &[String],
        ) -> SourceResult<HashMap<String, f64>> {
            self.inner.compute(handle, indicators).await
        }
    }

    fn fixture() -> StaticSource {
        StaticSource::new(HashMap::from([(
            "wheat organic FR".to_string(),
            StaticActivity {
                name: "Wheat, organic".to_string(),
                identifier: "wheat-organic-fr".to_string(),
                unit: "kg".to_string(),
                system_description: "agribalyse".to_string(),
                impacts: HashMap::from([("cch".to_string(), 10.0)]),
            },
        )]))
    }

    #[tokio::test]
    async fn test_static_source_resolves_known_keys() {
        let source = fixture();
        let handle = source.resolve("wheat organic FR").await.unwrap();
        assert_eq!(handle.identifier, "wheat-organic-fr");

        let err = source.resolve("no such activity").await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_static_source_computes_requested_subset() {
        let source = fixture();
        let handle = source.resolve("wheat organic FR").await.unwrap();
        let impacts = source
            .compute(&handle, &["cch".to_string(), "wtu".to_string()])
            .await
            .unwrap();

        assert_eq!(impacts.get("cch"), Some(&10.0));
        assert!(!impacts.contains_key("wtu"));
    }

    #[tokio::test]
    async fn test_cached_source_resolves_each_key_once() {
        let counting = Arc::new(CountingSource {
            inner: fixture(),
            resolve_calls: AtomicUsize::new(0),
        });
        let cached = CachedSource::new(counting.clone());

        cached.resolve("wheat organic FR").await.unwrap();
        cached.resolve("wheat organic FR").await.unwrap();
        cached.resolve("wheat organic FR").await.unwrap();

        assert_eq!(counting.resolve_calls.load(Ordering::SeqCst), 1);
    }
}
