use std::sync::Arc;

use chrono::Utc;
use lk_dms_client::DmsClient;
use lk_extract::{ExtractionInput, ExtractionRouter};
use lk_ledger_client::LedgerClient;
use lk_llm::{LlmBackend, LlmConfig, LlmService};
use lk_reconcile::{ReconcileOptions, ReconciliationOrchestrator, RunSummary};
use lk_record::Document;
use lk_review::{FieldEdit, ReviewWorkflow, Thresholds, classify, rescale_for_strategy};
use lk_store::{ExtractionRow, OwnerFilter, ReviewDecision, StateStore};
use sha2::{Digest, Sha256};

use crate::error::{PipelineError, PipelineResult};
use crate::telemetry::PipelineTelemetry;

/// The DMS client only hands back a filename on download, not a
/// content-type header, so extraction strategies get a best-effort
/// guess from the extension rather than nothing at all.
fn guess_mime_type(filename: &str) -> String {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "txt" => "text/plain",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
    .to_string()
}

/// Wires every stage of the document-to-ledger pipeline together:
/// ingest from the DMS, classify and route to review, reconcile against
/// the ledger, and serve LLM-assisted suggestions. Mirrors the
/// "required dependencies + optional telemetry" constructor pattern the
/// rest of this codebase uses for composed services.
pub struct Pipeline<S, D, L, B>
where
    S: StateStore,
    D: DmsClient,
    L: LedgerClient,
    B: LlmBackend,
{
    store: Arc<S>,
    dms: Arc<D>,
    router: ExtractionRouter,
    review: ReviewWorkflow<S>,
    reconcile: ReconciliationOrchestrator<S, L>,
    llm: Option<Arc<LlmService<S, B>>>,
    thresholds: Thresholds,
    telemetry: PipelineTelemetry,
}

impl<S, D, L, B> Pipeline<S, D, L, B>
where
    S: StateStore,
    D: DmsClient,
    L: LedgerClient,
    B: LlmBackend,
{
    pub fn new(store: Arc<S>, dms: Arc<D>, ledger: Arc<L>, router: ExtractionRouter, thresholds: Thresholds) -> Self {
        Self {
            review: ReviewWorkflow::new(store.clone()),
            reconcile: ReconciliationOrchestrator::new(store.clone(), ledger),
            store,
            dms,
            router,
            llm: None,
            thresholds,
            telemetry: PipelineTelemetry::new(),
        }
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: PipelineTelemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn with_llm(mut self, backend: Arc<B>, config: LlmConfig, categories: Vec<String>) -> Self {
        self.llm = Some(Arc::new(LlmService::new(self.store.clone(), backend, config, categories)));
        self
    }

    #[must_use]
    pub fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    #[must_use]
    pub fn llm(&self) -> Option<&Arc<LlmService<S, B>>> {
        self.llm.as_ref()
    }

    #[must_use]
    pub fn review(&self) -> &ReviewWorkflow<S> {
        &self.review
    }

    /// Pulls one document from the DMS, routes it through extraction,
    /// classifies the result, and persists both the document and the
    /// extraction. Idempotent on `document_id`: a document already known
    /// to the DMS client's backing store is upserted, not duplicated.
    pub async fn ingest_document(&self, document_id: &str, owner: OwnerFilter<'_>) -> PipelineResult<ExtractionRow> {
        let remote = self
            .dms
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::Validation(format!("document {document_id} not found upstream")))?;
        let (bytes, filename) = self
            .dms
            .download_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::Validation(format!("document {document_id} has no downloadable content")))?;
        let source_hash = format!("{:x}", Sha256::digest(&bytes));
        let mime_type = guess_mime_type(&filename);

        let document = Document {
            document_id: document_id.to_string(),
            source_hash: source_hash.clone(),
            title: remote.title,
            document_type: remote.document_type.unwrap_or_default(),
            correspondent: remote.correspondent.unwrap_or_default(),
            tags: remote.tags,
            first_seen: remote.created,
            last_seen: Utc::now(),
        }
        .normalize()
        .map_err(|e| PipelineError::Validation(e.to_string()))?;
        self.store.upsert_document(document.clone(), owner).await?;

        let text_layer = mime_type.starts_with("text/").then(|| String::from_utf8_lossy(&bytes).into_owned());
        let input = ExtractionInput {
            document_id: document_id.to_string(),
            source_hash,
            document_url: format!("dms://{document_id}"),
            mime_type,
            bytes,
            text_layer,
            received_at: remote.created,
        };
        let mut record = self.router.route(&input).await?;
        record.field_confidence = rescale_for_strategy(record.field_confidence, &record.provenance.extraction_strategy);
        let (review_state, overall_confidence) = classify(&record.field_confidence, self.thresholds);

        let row = ExtractionRow {
            id: format!("ext:{}", record.proposal.external_id),
            document_id: document_id.to_string(),
            external_id: record.proposal.external_id.clone(),
            record,
            overall_confidence,
            review_state,
            created_at: Utc::now(),
            reviewed_at: None,
            review_decision: None,
            llm_opt_out: false,
            owner_user_id: owner.map(str::to_string),
        };
        self.store.save_extraction(row.clone()).await?;
        self.telemetry.record_ingested(review_state);
        Ok(row)
    }

    pub async fn apply_review_edits(
        &self,
        extraction_id: &str,
        extraction: ExtractionRow,
        edits: &[FieldEdit],
    ) -> PipelineResult<lk_record::CanonicalRecord> {
        Ok(self.review.apply_edits(extraction_id, extraction.record, edits).await?)
    }

    pub async fn record_review_decision(
        &self,
        extraction_id: &str,
        decision: ReviewDecision,
        rewritten_record: Option<lk_record::CanonicalRecord>,
    ) -> PipelineResult<()> {
        Ok(self.review.record_decision(extraction_id, decision, rewritten_record).await?)
    }

    /// Runs one sync/match/propose/auto-link pass for `owner` and feeds
    /// the resulting counts into telemetry.
    pub async fn run_reconciliation(&self, owner: OwnerFilter<'_>, options: ReconcileOptions) -> PipelineResult<RunSummary> {
        let summary = self.reconcile.run(owner, options).await?;
        self.telemetry.record_reconciliation(&summary);
        Ok(summary)
    }

    /// Drains the LLM job queue once, running `handler` against the
    /// service's suggestion methods for whichever job comes up next.
    /// Returns `Ok(None)` once the queue is empty.
    pub async fn process_next_llm_job<F, Fut>(&self, handler: F) -> PipelineResult<Option<lk_store::AiJobId>>
    where
        F: FnOnce(lk_store::AiJobRow) -> Fut,
        Fut: std::future::Future<Output = lk_llm::LlmResult<Option<serde_json::Value>>>,
    {
        let Some(llm) = &self.llm else {
            return Ok(None);
        };
        Ok(llm.process_next_job(handler).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use lk_dms_client::{DocumentFilter, MockDmsClient, RemoteDocument};
    use lk_extract::{ExtractionRouter, LastResortStrategy};
    use lk_ledger_client::MockLedgerClient;
    use lk_llm::MockLlmBackend;
    use lk_store::SqliteStore;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn ingest_document_persists_document_and_extraction() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
        let dms = Arc::new(MockDmsClient::default());
        dms.seed_document(RemoteDocument {
            document_id: "doc-1".into(),
            title: "Invoice".into(),
            document_type: Some("invoice".into()),
            correspondent: Some("Acme".into()),
            tags: vec!["receipts".into()],
            created: Utc::now(),
        })
        .await;
        dms.seed_bytes("doc-1", b"total due: 42.00 on 2025-01-15".to_vec(), "invoice.txt").await;
        let ledger = MockLedgerClient::shared();
        let router = ExtractionRouter::new().with_strategy(Box::new(LastResortStrategy));
        let pipeline: Pipeline<SqliteStore, MockDmsClient, MockLedgerClient, MockLlmBackend> =
            Pipeline::new(store.clone(), dms, ledger, router, Thresholds::default());

        let row = pipeline.ingest_document("doc-1", None).await.expect("ingest ok");
        assert_eq!(row.document_id, "doc-1");

        let fetched = store.get_document("doc-1", None).await.expect("get document").expect("document present");
        assert_eq!(fetched.title, "Invoice");
    }

    #[tokio::test]
    async fn ingest_missing_document_is_a_validation_error() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
        let dms = Arc::new(MockDmsClient::default());
        let ledger = MockLedgerClient::shared();
        let router = ExtractionRouter::new().with_strategy(Box::new(LastResortStrategy));
        let pipeline: Pipeline<SqliteStore, MockDmsClient, MockLedgerClient, MockLlmBackend> =
            Pipeline::new(store, dms, ledger, router, Thresholds::default());

        let err = pipeline.ingest_document("missing", None).await.expect_err("should fail");
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn reconciliation_pass_updates_telemetry() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
        let dms = Arc::new(MockDmsClient::default());
        let ledger = MockLedgerClient::shared();
        let router = ExtractionRouter::new().with_strategy(Box::new(LastResortStrategy));
        let pipeline: Pipeline<SqliteStore, MockDmsClient, MockLedgerClient, MockLlmBackend> =
            Pipeline::new(store, dms, ledger, router, Thresholds::default());

        let summary = pipeline
            .run_reconciliation(None, ReconcileOptions { skip_sync: true, ..ReconcileOptions::default() })
            .await
            .expect("reconcile ok");
        assert_eq!(summary.matched_documents, 0);
        assert_eq!(pipeline.telemetry().snapshot().matched_documents, 0);
    }

    #[test]
    fn doc_filter_is_constructible() {
        let _ = DocumentFilter::default();
    }
}
