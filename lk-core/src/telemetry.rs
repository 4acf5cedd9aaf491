use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineCounters {
    pub documents_ingested: usize,
    pub auto_classified: usize,
    pub sent_to_review: usize,
    pub manual_review: usize,
    pub synced_transactions: usize,
    pub matched_documents: usize,
    pub proposals_created: usize,
    pub auto_linked: usize,
    pub llm_suggestions_served: usize,
    pub llm_suggestions_from_cache: usize,
    pub llm_jobs_failed: usize,
}

#[derive(Debug)]
struct TelemetryStore {
    path: PathBuf,
}

impl TelemetryStore {
    fn from_env() -> Option<Self> {
        let home = env::var_os("LK_HOME")?;
        let mut path = PathBuf::from(home);
        path.push("pipeline");
        path.push("telemetry.json");
        Some(Self { path })
    }

    fn read(&self) -> anyhow::Result<Option<PipelineCounters>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let counters = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        Ok(Some(counters))
    }

    fn persist(&self, counters: &PipelineCounters) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let data =
            serde_json::to_vec_pretty(counters).context("failed to encode telemetry counters")?;
        fs::write(&self.path, data)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TelemetryInner {
    counters: PipelineCounters,
    store: Option<TelemetryStore>,
}

impl TelemetryInner {
    fn with_store(store: Option<TelemetryStore>) -> Self {
        match store {
            Some(store) => {
                let counters = match store.read() {
                    Ok(Some(existing)) => existing,
                    Ok(None) => PipelineCounters::default(),
                    Err(err) => {
                        warn!(
                            path = %store.path.display(),
                            error = %err,
                            "failed to load persisted telemetry; continuing with defaults"
                        );
                        PipelineCounters::default()
                    }
                };
                Self { counters, store: Some(store) }
            }
            None => Self::default(),
        }
    }

    fn persist(&self) {
        if let Some(store) = &self.store
            && let Err(err) = store.persist(&self.counters)
        {
            warn!(path = %store.path.display(), error = %err, "failed to persist telemetry counters");
        }
    }
}

/// Process-wide counters for the pipeline, mirrored to a JSON file under
/// `LK_HOME/pipeline/telemetry.json` when running outside tests. Never
/// interpolates document text, account numbers, or other payload
/// content — only counts.
#[derive(Clone, Default)]
pub struct PipelineTelemetry {
    inner: Arc<Mutex<TelemetryInner>>,
}

impl PipelineTelemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::from_store(None)
    }

    #[must_use]
    pub fn persistent_from_env() -> Self {
        Self::from_store(TelemetryStore::from_env())
    }

    #[must_use]
    pub fn with_store_path(path: PathBuf) -> Self {
        Self::from_store(Some(TelemetryStore { path }))
    }

    fn from_store(store: Option<TelemetryStore>) -> Self {
        Self { inner: Arc::new(Mutex::new(TelemetryInner::with_store(store))) }
    }

    fn update<F>(&self, mut updater: F)
    where
        F: FnMut(&mut PipelineCounters),
    {
        if let Ok(mut inner) = self.inner.lock() {
            updater(&mut inner.counters);
            inner.persist();
        }
    }

    pub fn record_ingested(&self, review_state: lk_store::ReviewState) {
        self.update(|counters| {
            counters.documents_ingested += 1;
            match review_state {
                lk_store::ReviewState::Auto => counters.auto_classified += 1,
                lk_store::ReviewState::Review => counters.sent_to_review += 1,
                lk_store::ReviewState::Manual => counters.manual_review += 1,
            }
        });
    }

    pub fn record_reconciliation(&self, summary: &lk_reconcile::RunSummary) {
        self.update(|counters| {
            counters.synced_transactions += summary.synced;
            counters.matched_documents += summary.matched_documents;
            counters.proposals_created += summary.proposals_created;
            counters.auto_linked += summary.auto_linked;
        });
    }

    pub fn record_llm_suggestion(&self, from_cache: bool) {
        self.update(|counters| {
            counters.llm_suggestions_served += 1;
            if from_cache {
                counters.llm_suggestions_from_cache += 1;
            }
        });
    }

    pub fn record_llm_job_failure(&self) {
        self.update(|counters| counters.llm_jobs_failed += 1);
    }

    #[must_use]
    pub fn snapshot(&self) -> PipelineCounters {
        self.inner.lock().map(|inner| inner.counters.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn store_path(&self) -> Option<PathBuf> {
        self.inner.lock().ok().and_then(|inner| inner.store.as_ref().map(|store| store.path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn counters_accumulate() {
        let telemetry = PipelineTelemetry::new();
        telemetry.record_ingested(lk_store::ReviewState::Auto);
        telemetry.record_ingested(lk_store::ReviewState::Review);
        telemetry.record_llm_suggestion(false);
        telemetry.record_llm_suggestion(true);
        telemetry.record_llm_job_failure();
        let counters = telemetry.snapshot();
        assert_eq!(counters.documents_ingested, 2);
        assert_eq!(counters.auto_classified, 1);
        assert_eq!(counters.sent_to_review, 1);
        assert_eq!(counters.llm_suggestions_served, 2);
        assert_eq!(counters.llm_suggestions_from_cache, 1);
        assert_eq!(counters.llm_jobs_failed, 1);
    }

    #[test]
    fn persistence_survives_restart() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("telemetry.json");
        {
            let telemetry = PipelineTelemetry::with_store_path(path.clone());
            telemetry.record_ingested(lk_store::ReviewState::Auto);
            telemetry.record_llm_suggestion(false);
        }
        let telemetry = PipelineTelemetry::with_store_path(path);
        let counters = telemetry.snapshot();
        assert_eq!(counters.documents_ingested, 1);
        assert_eq!(counters.llm_suggestions_served, 1);
    }

    #[test]
    fn persistence_recovers_from_corrupt_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("telemetry.json");
        fs::write(&path, b"not json").expect("write corrupt telemetry");

        let telemetry = PipelineTelemetry::with_store_path(path.clone());
        let counters = telemetry.snapshot();
        assert_eq!(counters.documents_ingested, 0);

        telemetry.record_ingested(lk_store::ReviewState::Auto);

        let reloaded = PipelineTelemetry::with_store_path(path);
        let counters = reloaded.snapshot();
        assert_eq!(counters.documents_ingested, 1);
        let stored_path = reloaded.store_path().expect("telemetry path recorded");
        assert!(stored_path.ends_with("telemetry.json"), "unexpected path: {stored_path:?}");
    }
}
