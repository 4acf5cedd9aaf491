#![deny(clippy::print_stdout, clippy::print_stderr)]

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use lk_record::{CanonicalRecord, Document, DocumentId, ExtractionId, Money};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod sqlite;

pub use crate::sqlite::SqliteStore;

pub type StoreResult<T> = Result<T, StoreError>;
pub type FireflyId = i64;
pub type ImportId = i64;
pub type ProposalId = i64;
pub type RunId = i64;
pub type AiJobId = i64;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("migration failure: {0}")]
    Migration(String),
}

/// An owner-id filter applied to every multi-tenant read/write. `None`
/// only ever sees rows with a NULL `owner_user_id` (legacy/shared rows);
/// `Some(id)` sees rows owned by `id` plus legacy rows.
pub type OwnerFilter<'a> = Option<&'a str>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Auto,
    Review,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    Accepted,
    Edited,
    Rejected,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Pending,
    Imported,
    Failed,
    Skipped,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Unmatched,
    Matched,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    AutoMatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalState {
    ProposalCreated,
    Linked,
    Rejected,
    LinkageWriteFailed,
    ManualCreated,
    LinkError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionSource {
    Rules,
    Llm,
    User,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackKind {
    Correct,
    Wrong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRow {
    pub id: ExtractionId,
    pub document_id: DocumentId,
    pub external_id: String,
    pub record: CanonicalRecord,
    pub overall_confidence: f32,
    pub review_state: ReviewState,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub review_decision: Option<ReviewDecision>,
    pub llm_opt_out: bool,
    pub owner_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportRow {
    pub id: ImportId,
    pub external_id: String,
    pub document_id: DocumentId,
    pub firefly_id: Option<FireflyId>,
    pub status: ImportStatus,
    pub error_message: Option<String>,
    pub payload_json: String,
    pub created_at: DateTime<Utc>,
    pub imported_at: Option<DateTime<Utc>>,
    pub owner_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerCacheRow {
    pub firefly_id: FireflyId,
    pub transaction_type: String,
    pub date: NaiveDate,
    pub amount: Money,
    pub description: String,
    pub source_account: Option<String>,
    pub destination_account: Option<String>,
    pub notes: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub ledger_external_id: Option<String>,
    pub internal_reference: Option<String>,
    pub synced_at: DateTime<Utc>,
    pub match_status: MatchStatus,
    pub matched_document_id: Option<DocumentId>,
    pub match_confidence: Option<f32>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub owner_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchProposalRow {
    pub id: ProposalId,
    pub firefly_id: FireflyId,
    pub document_id: DocumentId,
    pub match_score: f32,
    pub match_reasons: Vec<String>,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub owner_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpretationRunRow {
    pub id: RunId,
    pub document_id: DocumentId,
    pub firefly_id: Option<FireflyId>,
    pub external_id: Option<String>,
    pub run_timestamp: DateTime<Utc>,
    pub duration_ms: i64,
    pub pipeline_version: String,
    pub algorithm_version: String,
    pub inputs_summary: serde_json::Value,
    pub rules_applied: Vec<String>,
    pub llm_result: Option<serde_json::Value>,
    pub final_state: FinalState,
    pub decision_source: DecisionSource,
    pub auto_applied: bool,
    pub firefly_write_action: Option<String>,
    pub firefly_target_id: Option<FireflyId>,
    pub linkage_marker_written: Option<serde_json::Value>,
    pub owner_user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCacheRow {
    pub cache_key: String,
    pub model_name: String,
    pub prompt_version: String,
    pub taxonomy_version: String,
    pub response_text: String,
    pub hit_count: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmFeedbackRow {
    pub id: i64,
    pub run_id: RunId,
    pub suggested_category: Option<String>,
    pub actual_category: Option<String>,
    pub feedback_kind: FeedbackKind,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiJobRow {
    pub id: AiJobId,
    pub document_id: DocumentId,
    pub extraction_id: Option<ExtractionId>,
    pub external_id: Option<String>,
    pub priority: i32,
    pub status: AiJobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub suggestions_json: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorMappingRow {
    pub vendor_pattern: String,
    pub destination_account: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub use_count: i64,
}

/// Single-writer SQL-backed storage for the whole pipeline. Every
/// multi-statement mutation runs inside an explicit transaction that
/// commits on success and rolls back on any error; no cross-call state
/// leaks between invocations.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn upsert_document(&self, document: Document, owner: OwnerFilter<'_>) -> StoreResult<()>;
    async fn get_document(&self, document_id: &str, owner: OwnerFilter<'_>) -> StoreResult<Option<Document>>;
    async fn document_exists(&self, document_id: &str, owner: OwnerFilter<'_>) -> StoreResult<bool>;

    async fn save_extraction(&self, row: ExtractionRow) -> StoreResult<ExtractionId>;
    async fn get_extraction_by_document(
        &self,
        document_id: &str,
        owner: OwnerFilter<'_>,
    ) -> StoreResult<Option<ExtractionRow>>;
    async fn get_extraction_by_external_id(&self, external_id: &str) -> StoreResult<Option<ExtractionRow>>;
    async fn update_extraction_review(
        &self,
        extraction_id: &str,
        decision: ReviewDecision,
        updated_record: Option<CanonicalRecord>,
    ) -> StoreResult<()>;
    async fn reset_extraction_for_review(&self, extraction_id: &str) -> StoreResult<()>;
    async fn list_extractions_for_review(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<ExtractionRow>>;
    /// Extractions that have cleared review (AUTO with no decision yet,
    /// or an ACCEPTED/EDITED decision) and have neither an import record
    /// nor a pending proposal yet — the reconciliation orchestrator's
    /// matching-phase input set.
    async fn list_extractions_pending_reconciliation(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<ExtractionRow>>;

    async fn create_import(&self, row: ImportRow) -> StoreResult<ImportId>;
    async fn update_import_success(&self, external_id: &str, firefly_id: FireflyId) -> StoreResult<()>;
    async fn update_import_failed(&self, external_id: &str, error_message: &str) -> StoreResult<()>;
    async fn reset_import_for_retry(&self, external_id: &str) -> StoreResult<()>;
    async fn get_import_by_external_id(&self, external_id: &str) -> StoreResult<Option<ImportRow>>;
    async fn import_exists(&self, external_id: &str) -> StoreResult<bool>;

    async fn upsert_cache_entry(&self, row: LedgerCacheRow) -> StoreResult<()>;
    async fn list_unmatched_cache(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<LedgerCacheRow>>;
    async fn update_cache_match_status(
        &self,
        firefly_id: FireflyId,
        status: MatchStatus,
        matched_document_id: Option<&str>,
        match_confidence: Option<f32>,
    ) -> StoreResult<()>;
    async fn soft_delete_missing_cache(&self, seen_firefly_ids: &[FireflyId], owner: OwnerFilter<'_>) -> StoreResult<usize>;
    /// Cache rows currently matched to `document_id`, so a rerun can
    /// un-match them before re-scoring.
    async fn list_cache_matched_to_document(
        &self,
        document_id: &str,
        owner: OwnerFilter<'_>,
    ) -> StoreResult<Vec<LedgerCacheRow>>;

    async fn create_match_proposal(&self, row: MatchProposalRow) -> StoreResult<ProposalId>;
    async fn list_pending_proposals(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<MatchProposalRow>>;
    async fn update_proposal_status(&self, proposal_id: ProposalId, status: ProposalStatus) -> StoreResult<()>;
    async fn purge_pending_proposals_for(&self, firefly_id: FireflyId, document_id: &str) -> StoreResult<()>;

    async fn create_interpretation_run(&self, row: InterpretationRunRow) -> StoreResult<RunId>;
    async fn list_runs_for_document(&self, document_id: &str) -> StoreResult<Vec<InterpretationRunRow>>;
    async fn latest_run_for_document(&self, document_id: &str) -> StoreResult<Option<InterpretationRunRow>>;

    async fn get_llm_cache(&self, cache_key: &str) -> StoreResult<Option<LlmCacheRow>>;
    async fn set_llm_cache(&self, row: LlmCacheRow) -> StoreResult<()>;
    async fn sweep_expired_llm_cache(&self) -> StoreResult<usize>;
    /// Count of distinct LLM cache keys ever written, the calibration
    /// service's proxy for "suggestions produced".
    async fn llm_suggestion_count(&self) -> StoreResult<i64>;

    async fn record_llm_feedback(&self, row: LlmFeedbackRow) -> StoreResult<i64>;
    async fn llm_feedback_stats(&self) -> StoreResult<(i64, i64)>;

    async fn schedule_ai_job(&self, row: AiJobRow) -> StoreResult<AiJobId>;
    async fn get_next_ai_job(&self) -> StoreResult<Option<AiJobRow>>;
    async fn start_ai_job(&self, job_id: AiJobId) -> StoreResult<()>;
    async fn complete_ai_job(&self, job_id: AiJobId, suggestions_json: &str) -> StoreResult<()>;
    async fn fail_ai_job_with_retry(&self, job_id: AiJobId, error_message: &str) -> StoreResult<()>;
    async fn cancel_ai_job(&self, job_id: AiJobId) -> StoreResult<()>;
    async fn list_ai_jobs(&self, status: Option<AiJobStatus>) -> StoreResult<Vec<AiJobRow>>;
    async fn ai_job_stats(&self) -> StoreResult<Vec<(AiJobStatus, i64)>>;
    async fn cleanup_ai_jobs(&self, older_than: DateTime<Utc>) -> StoreResult<usize>;

    async fn upsert_vendor_mapping(&self, row: VendorMappingRow) -> StoreResult<()>;
    async fn get_vendor_mapping(&self, vendor_pattern: &str) -> StoreResult<Option<VendorMappingRow>>;
}
