use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lk_record::{CanonicalRecord, Document, ExtractionId, Money};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::info;

use crate::{
    AiJobId, AiJobRow, AiJobStatus, DecisionSource, ExtractionRow, FeedbackKind, FinalState, FireflyId, ImportId,
    ImportRow, ImportStatus, InterpretationRunRow, LedgerCacheRow, LlmCacheRow, LlmFeedbackRow, MatchProposalRow,
    MatchStatus, OwnerFilter, ProposalId, ProposalStatus, ReviewDecision, ReviewState, RunId, StateStore,
    StoreError, StoreResult, VendorMappingRow,
};

type DbResult<T> = Result<T, rusqlite::Error>;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_initial",
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            document_id TEXT PRIMARY KEY,
            source_hash TEXT NOT NULL,
            title TEXT NOT NULL,
            document_type TEXT NOT NULL,
            correspondent TEXT NOT NULL,
            tags TEXT NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS extractions (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL REFERENCES documents(document_id),
            external_id TEXT NOT NULL UNIQUE,
            record_json TEXT NOT NULL,
            overall_confidence REAL NOT NULL,
            review_state TEXT NOT NULL,
            created_at TEXT NOT NULL,
            reviewed_at TEXT,
            review_decision TEXT,
            llm_opt_out INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS imports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            external_id TEXT NOT NULL UNIQUE,
            document_id TEXT NOT NULL REFERENCES documents(document_id),
            firefly_id INTEGER,
            status TEXT NOT NULL,
            error_message TEXT,
            payload_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            imported_at TEXT
        );

        CREATE TABLE IF NOT EXISTS ledger_cache (
            firefly_id INTEGER PRIMARY KEY,
            transaction_type TEXT NOT NULL,
            date TEXT NOT NULL,
            amount_minor INTEGER NOT NULL,
            description TEXT NOT NULL,
            source_account TEXT,
            destination_account TEXT,
            notes TEXT,
            category TEXT,
            tags TEXT NOT NULL,
            ledger_external_id TEXT,
            internal_reference TEXT,
            synced_at TEXT NOT NULL,
            match_status TEXT NOT NULL,
            matched_document_id TEXT,
            match_confidence REAL,
            deleted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS match_proposals (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            firefly_id INTEGER NOT NULL,
            document_id TEXT NOT NULL,
            match_score REAL NOT NULL,
            match_reasons TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            reviewed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS interpretation_runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            firefly_id INTEGER,
            external_id TEXT,
            run_timestamp TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            pipeline_version TEXT NOT NULL,
            algorithm_version TEXT NOT NULL,
            inputs_summary TEXT NOT NULL,
            rules_applied TEXT NOT NULL,
            llm_result TEXT,
            final_state TEXT NOT NULL,
            decision_source TEXT NOT NULL,
            auto_applied INTEGER NOT NULL,
            firefly_write_action TEXT,
            firefly_target_id INTEGER,
            linkage_marker_written TEXT
        );

        CREATE TABLE IF NOT EXISTS llm_cache (
            cache_key TEXT PRIMARY KEY,
            model_name TEXT NOT NULL,
            prompt_version TEXT NOT NULL,
            taxonomy_version TEXT NOT NULL,
            response_text TEXT NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS llm_feedback (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id INTEGER NOT NULL,
            suggested_category TEXT,
            actual_category TEXT,
            feedback_kind TEXT NOT NULL,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS ai_jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            document_id TEXT NOT NULL,
            extraction_id TEXT,
            external_id TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 3,
            scheduled_for TEXT,
            created_by TEXT,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT,
            error_message TEXT,
            suggestions_json TEXT
        );

        CREATE TABLE IF NOT EXISTS vendor_mappings (
            vendor_pattern TEXT PRIMARY KEY,
            destination_account TEXT,
            category TEXT,
            tags TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            use_count INTEGER NOT NULL DEFAULT 1
        );

        CREATE INDEX IF NOT EXISTS idx_extractions_document_id ON extractions(document_id);
        CREATE INDEX IF NOT EXISTS idx_imports_document_id ON imports(document_id);
        CREATE INDEX IF NOT EXISTS idx_imports_status ON imports(status);
        CREATE INDEX IF NOT EXISTS idx_ledger_cache_match_status ON ledger_cache(match_status);
        CREATE INDEX IF NOT EXISTS idx_match_proposals_status ON match_proposals(status);
        CREATE INDEX IF NOT EXISTS idx_interpretation_runs_document_id ON interpretation_runs(document_id);
        CREATE INDEX IF NOT EXISTS idx_ai_jobs_status ON ai_jobs(status);
        "#,
    ),
    (
        "0002_user_ownership",
        r#"
        ALTER TABLE documents ADD COLUMN owner_user_id TEXT DEFAULT NULL;
        ALTER TABLE extractions ADD COLUMN owner_user_id TEXT DEFAULT NULL;
        ALTER TABLE imports ADD COLUMN owner_user_id TEXT DEFAULT NULL;
        ALTER TABLE ledger_cache ADD COLUMN owner_user_id TEXT DEFAULT NULL;
        ALTER TABLE match_proposals ADD COLUMN owner_user_id TEXT DEFAULT NULL;
        ALTER TABLE interpretation_runs ADD COLUMN owner_user_id TEXT DEFAULT NULL;

        CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_user_id);
        CREATE INDEX IF NOT EXISTS idx_extractions_owner ON extractions(owner_user_id);
        CREATE INDEX IF NOT EXISTS idx_imports_owner ON imports(owner_user_id);
        CREATE INDEX IF NOT EXISTS idx_ledger_cache_owner ON ledger_cache(owner_user_id);
        CREATE INDEX IF NOT EXISTS idx_match_proposals_owner ON match_proposals(owner_user_id);
        CREATE INDEX IF NOT EXISTS idx_interpretation_runs_owner ON interpretation_runs(owner_user_id);
        "#,
    ),
];

/// Single-writer SQLite-backed `StateStore`. Every method takes the
/// mutex for the whole transaction; rusqlite has no async driver in
/// this stack, so the `async fn` surface is a thin wrapper over
/// synchronous work done without ever holding the lock across an
/// await point.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Storage(e.to_string()))?;
        Self::from_connection(conn)
    }

    pub fn open_file(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path).map_err(|e| StoreError::Storage(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> StoreResult<()> {
        let conn = self.conn.lock().expect("sqlite connection mutex poisoned");
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (name TEXT PRIMARY KEY, applied_at TEXT NOT NULL);",
        )
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        for (name, sql) in MIGRATIONS {
            let already_applied: bool = conn
                .query_row(
                    "SELECT 1 FROM schema_migrations WHERE name = ?1",
                    params![name],
                    |_| Ok(true),
                )
                .optional()
                .map_err(|e| StoreError::Migration(e.to_string()))?
                .unwrap_or(false);
            if already_applied {
                continue;
            }
            if let Err(err) = conn.execute_batch(sql) {
                // Column-add migrations are not naturally idempotent in
                // SQLite (no `ADD COLUMN IF NOT EXISTS`); a "duplicate
                // column name" failure here means a prior partial run
                // already applied it, matching the original
                // migration's own idempotency check.
                if !err.to_string().contains("duplicate column name") {
                    return Err(StoreError::Migration(format!("{name}: {err}")));
                }
            }
            conn.execute(
                "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
                params![name, Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::Migration(e.to_string()))?;
            info!(migration = name, "applied schema migration");
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection mutex poisoned")
    }
}

fn owner_clause(owner: OwnerFilter<'_>) -> (&'static str, Option<String>) {
    match owner {
        Some(id) => (" AND (owner_user_id IS NULL OR owner_user_id = ?)", Some(id.to_string())),
        None => (" AND owner_user_id IS NULL AND ? IS NULL", None),
    }
}

fn tags_to_json(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

fn tags_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn review_state_str(state: ReviewState) -> &'static str {
    match state {
        ReviewState::Auto => "AUTO",
        ReviewState::Review => "REVIEW",
        ReviewState::Manual => "MANUAL",
    }
}

fn review_state_from_str(raw: &str) -> DbResult<ReviewState> {
    match raw {
        "AUTO" => Ok(ReviewState::Auto),
        "REVIEW" => Ok(ReviewState::Review),
        "MANUAL" => Ok(ReviewState::Manual),
        other => Err(invalid_enum("review_state", other)),
    }
}

fn review_decision_str(decision: ReviewDecision) -> &'static str {
    match decision {
        ReviewDecision::Accepted => "ACCEPTED",
        ReviewDecision::Edited => "EDITED",
        ReviewDecision::Rejected => "REJECTED",
        ReviewDecision::Skipped => "SKIPPED",
    }
}

fn review_decision_from_str(raw: &str) -> DbResult<ReviewDecision> {
    match raw {
        "ACCEPTED" => Ok(ReviewDecision::Accepted),
        "EDITED" => Ok(ReviewDecision::Edited),
        "REJECTED" => Ok(ReviewDecision::Rejected),
        "SKIPPED" => Ok(ReviewDecision::Skipped),
        other => Err(invalid_enum("review_decision", other)),
    }
}

fn import_status_str(status: ImportStatus) -> &'static str {
    match status {
        ImportStatus::Pending => "PENDING",
        ImportStatus::Imported => "IMPORTED",
        ImportStatus::Failed => "FAILED",
        ImportStatus::Skipped => "SKIPPED",
        ImportStatus::Duplicate => "DUPLICATE",
    }
}

fn import_status_from_str(raw: &str) -> DbResult<ImportStatus> {
    match raw {
        "PENDING" => Ok(ImportStatus::Pending),
        "IMPORTED" => Ok(ImportStatus::Imported),
        "FAILED" => Ok(ImportStatus::Failed),
        "SKIPPED" => Ok(ImportStatus::Skipped),
        "DUPLICATE" => Ok(ImportStatus::Duplicate),
        other => Err(invalid_enum("import_status", other)),
    }
}

fn match_status_str(status: MatchStatus) -> &'static str {
    match status {
        MatchStatus::Unmatched => "UNMATCHED",
        MatchStatus::Matched => "MATCHED",
        MatchStatus::Rejected => "REJECTED",
    }
}

fn match_status_from_str(raw: &str) -> DbResult<MatchStatus> {
    match raw {
        "UNMATCHED" => Ok(MatchStatus::Unmatched),
        "MATCHED" => Ok(MatchStatus::Matched),
        "REJECTED" => Ok(MatchStatus::Rejected),
        other => Err(invalid_enum("match_status", other)),
    }
}

fn proposal_status_str(status: ProposalStatus) -> &'static str {
    match status {
        ProposalStatus::Pending => "PENDING",
        ProposalStatus::Accepted => "ACCEPTED",
        ProposalStatus::Rejected => "REJECTED",
        ProposalStatus::AutoMatched => "AUTO_MATCHED",
    }
}

fn proposal_status_from_str(raw: &str) -> DbResult<ProposalStatus> {
    match raw {
        "PENDING" => Ok(ProposalStatus::Pending),
        "ACCEPTED" => Ok(ProposalStatus::Accepted),
        "REJECTED" => Ok(ProposalStatus::Rejected),
        "AUTO_MATCHED" => Ok(ProposalStatus::AutoMatched),
        other => Err(invalid_enum("proposal_status", other)),
    }
}

fn final_state_str(state: FinalState) -> &'static str {
    match state {
        FinalState::ProposalCreated => "PROPOSAL_CREATED",
        FinalState::Linked => "LINKED",
        FinalState::Rejected => "REJECTED",
        FinalState::LinkageWriteFailed => "LINKAGE_WRITE_FAILED",
        FinalState::ManualCreated => "MANUAL_CREATED",
        FinalState::LinkError => "LINK_ERROR",
    }
}

fn final_state_from_str(raw: &str) -> DbResult<FinalState> {
    match raw {
        "PROPOSAL_CREATED" => Ok(FinalState::ProposalCreated),
        "LINKED" => Ok(FinalState::Linked),
        "REJECTED" => Ok(FinalState::Rejected),
        "LINKAGE_WRITE_FAILED" => Ok(FinalState::LinkageWriteFailed),
        "MANUAL_CREATED" => Ok(FinalState::ManualCreated),
        "LINK_ERROR" => Ok(FinalState::LinkError),
        other => Err(invalid_enum("final_state", other)),
    }
}

fn decision_source_str(source: DecisionSource) -> &'static str {
    match source {
        DecisionSource::Rules => "RULES",
        DecisionSource::Llm => "LLM",
        DecisionSource::User => "USER",
        DecisionSource::Auto => "AUTO",
    }
}

fn decision_source_from_str(raw: &str) -> DbResult<DecisionSource> {
    match raw {
        "RULES" => Ok(DecisionSource::Rules),
        "LLM" => Ok(DecisionSource::Llm),
        "USER" => Ok(DecisionSource::User),
        "AUTO" => Ok(DecisionSource::Auto),
        other => Err(invalid_enum("decision_source", other)),
    }
}

fn ai_job_status_str(status: AiJobStatus) -> &'static str {
    match status {
        AiJobStatus::Pending => "PENDING",
        AiJobStatus::Processing => "PROCESSING",
        AiJobStatus::Completed => "COMPLETED",
        AiJobStatus::Failed => "FAILED",
        AiJobStatus::Cancelled => "CANCELLED",
    }
}

fn ai_job_status_from_str(raw: &str) -> DbResult<AiJobStatus> {
    match raw {
        "PENDING" => Ok(AiJobStatus::Pending),
        "PROCESSING" => Ok(AiJobStatus::Processing),
        "COMPLETED" => Ok(AiJobStatus::Completed),
        "FAILED" => Ok(AiJobStatus::Failed),
        "CANCELLED" => Ok(AiJobStatus::Cancelled),
        other => Err(invalid_enum("ai_job_status", other)),
    }
}

fn feedback_kind_str(kind: FeedbackKind) -> &'static str {
    match kind {
        FeedbackKind::Correct => "CORRECT",
        FeedbackKind::Wrong => "WRONG",
    }
}

fn feedback_kind_from_str(raw: &str) -> DbResult<FeedbackKind> {
    match raw {
        "CORRECT" => Ok(FeedbackKind::Correct),
        "WRONG" => Ok(FeedbackKind::Wrong),
        other => Err(invalid_enum("feedback_kind", other)),
    }
}

fn invalid_enum(column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(0, format!("{column}={value}"), rusqlite::types::Type::Text)
}

fn row_to_document(row: &Row<'_>) -> DbResult<Document> {
    let tags_raw: String = row.get("tags")?;
    Ok(Document {
        document_id: row.get("document_id")?,
        source_hash: row.get("source_hash")?,
        title: row.get("title")?,
        document_type: row.get("document_type")?,
        correspondent: row.get("correspondent")?,
        tags: tags_from_json(&tags_raw),
        first_seen: row.get("first_seen")?,
        last_seen: row.get("last_seen")?,
    })
}

fn row_to_extraction(row: &Row<'_>) -> DbResult<ExtractionRow> {
    let record_raw: String = row.get("record_json")?;
    let record: CanonicalRecord =
        serde_json::from_str(&record_raw).map_err(|e| invalid_enum("record_json", &e.to_string()))?;
    let review_state: String = row.get("review_state")?;
    let review_decision: Option<String> = row.get("review_decision")?;
    Ok(ExtractionRow {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        external_id: row.get("external_id")?,
        record,
        overall_confidence: row.get("overall_confidence")?,
        review_state: review_state_from_str(&review_state)?,
        created_at: row.get("created_at")?,
        reviewed_at: row.get("reviewed_at")?,
        review_decision: review_decision.map(|s| review_decision_from_str(&s)).transpose()?,
        llm_opt_out: row.get::<_, i64>("llm_opt_out")? != 0,
        owner_user_id: row.get("owner_user_id")?,
    })
}

fn row_to_import(row: &Row<'_>) -> DbResult<ImportRow> {
    let status: String = row.get("status")?;
    Ok(ImportRow {
        id: row.get("id")?,
        external_id: row.get("external_id")?,
        document_id: row.get("document_id")?,
        firefly_id: row.get("firefly_id")?,
        status: import_status_from_str(&status)?,
        error_message: row.get("error_message")?,
        payload_json: row.get("payload_json")?,
        created_at: row.get("created_at")?,
        imported_at: row.get("imported_at")?,
        owner_user_id: row.get("owner_user_id")?,
    })
}

fn row_to_cache(row: &Row<'_>) -> DbResult<LedgerCacheRow> {
    let tags_raw: String = row.get("tags")?;
    let match_status: String = row.get("match_status")?;
    let amount_minor: i64 = row.get("amount_minor")?;
    let amount = Money::from_minor(amount_minor).map_err(|e| invalid_enum("amount_minor", &e.to_string()))?;
    Ok(LedgerCacheRow {
        firefly_id: row.get("firefly_id")?,
        transaction_type: row.get("transaction_type")?,
        date: row.get("date")?,
        amount,
        description: row.get("description")?,
        source_account: row.get("source_account")?,
        destination_account: row.get("destination_account")?,
        notes: row.get("notes")?,
        category: row.get("category")?,
        tags: tags_from_json(&tags_raw),
        ledger_external_id: row.get("ledger_external_id")?,
        internal_reference: row.get("internal_reference")?,
        synced_at: row.get("synced_at")?,
        match_status: match_status_from_str(&match_status)?,
        matched_document_id: row.get("matched_document_id")?,
        match_confidence: row.get("match_confidence")?,
        deleted_at: row.get("deleted_at")?,
        owner_user_id: row.get("owner_user_id")?,
    })
}

fn row_to_proposal(row: &Row<'_>) -> DbResult<MatchProposalRow> {
    let reasons_raw: String = row.get("match_reasons")?;
    let status: String = row.get("status")?;
    Ok(MatchProposalRow {
        id: row.get("id")?,
        firefly_id: row.get("firefly_id")?,
        document_id: row.get("document_id")?,
        match_score: row.get("match_score")?,
        match_reasons: tags_from_json(&reasons_raw),
        status: proposal_status_from_str(&status)?,
        created_at: row.get("created_at")?,
        reviewed_at: row.get("reviewed_at")?,
        owner_user_id: row.get("owner_user_id")?,
    })
}

fn row_to_run(row: &Row<'_>) -> DbResult<InterpretationRunRow> {
    let rules_raw: String = row.get("rules_applied")?;
    let inputs_raw: String = row.get("inputs_summary")?;
    let llm_result_raw: Option<String> = row.get("llm_result")?;
    let linkage_raw: Option<String> = row.get("linkage_marker_written")?;
    let final_state: String = row.get("final_state")?;
    let decision_source: String = row.get("decision_source")?;
    Ok(InterpretationRunRow {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        firefly_id: row.get("firefly_id")?,
        external_id: row.get("external_id")?,
        run_timestamp: row.get("run_timestamp")?,
        duration_ms: row.get("duration_ms")?,
        pipeline_version: row.get("pipeline_version")?,
        algorithm_version: row.get("algorithm_version")?,
        inputs_summary: serde_json::from_str(&inputs_raw).unwrap_or(serde_json::Value::Null),
        rules_applied: tags_from_json(&rules_raw),
        llm_result: llm_result_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        final_state: final_state_from_str(&final_state)?,
        decision_source: decision_source_from_str(&decision_source)?,
        auto_applied: row.get::<_, i64>("auto_applied")? != 0,
        firefly_write_action: row.get("firefly_write_action")?,
        firefly_target_id: row.get("firefly_target_id")?,
        linkage_marker_written: linkage_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        owner_user_id: row.get("owner_user_id")?,
    })
}

fn row_to_ai_job(row: &Row<'_>) -> DbResult<AiJobRow> {
    let status: String = row.get("status")?;
    Ok(AiJobRow {
        id: row.get("id")?,
        document_id: row.get("document_id")?,
        extraction_id: row.get("extraction_id")?,
        external_id: row.get("external_id")?,
        priority: row.get("priority")?,
        status: ai_job_status_from_str(&status)?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        scheduled_for: row.get("scheduled_for")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        error_message: row.get("error_message")?,
        suggestions_json: row.get("suggestions_json")?,
    })
}

fn row_to_vendor_mapping(row: &Row<'_>) -> DbResult<VendorMappingRow> {
    let tags_raw: String = row.get("tags")?;
    Ok(VendorMappingRow {
        vendor_pattern: row.get("vendor_pattern")?,
        destination_account: row.get("destination_account")?,
        category: row.get("category")?,
        tags: tags_from_json(&tags_raw),
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        use_count: row.get("use_count")?,
    })
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn upsert_document(&self, document: Document, owner: OwnerFilter<'_>) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO documents (document_id, source_hash, title, document_type, correspondent, tags, first_seen, last_seen, owner_user_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(document_id) DO UPDATE SET
                source_hash = excluded.source_hash,
                title = excluded.title,
                document_type = excluded.document_type,
                correspondent = excluded.correspondent,
                tags = excluded.tags,
                last_seen = excluded.last_seen
            ",
            params![
                document.document_id,
                document.source_hash,
                document.title,
                document.document_type,
                document.correspondent,
                tags_to_json(&document.tags),
                document.first_seen,
                document.last_seen,
                owner,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_document(&self, document_id: &str, owner: OwnerFilter<'_>) -> StoreResult<Option<Document>> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let sql = format!("SELECT * FROM documents WHERE document_id = ?1{clause}");
        conn.query_row(&sql, params![document_id, bound], row_to_document)
            .optional()
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn document_exists(&self, document_id: &str, owner: OwnerFilter<'_>) -> StoreResult<bool> {
        Ok(self.get_document(document_id, owner).await?.is_some())
    }

    async fn save_extraction(&self, row: ExtractionRow) -> StoreResult<ExtractionId> {
        let conn = self.lock();
        let record_json = serde_json::to_string(&row.record).map_err(|e| StoreError::Validation(e.to_string()))?;
        conn.execute(
            r"
            INSERT INTO extractions
            (id, document_id, external_id, record_json, overall_confidence, review_state, created_at, reviewed_at, review_decision, llm_opt_out, owner_user_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                row.id,
                row.document_id,
                row.external_id,
                record_json,
                row.overall_confidence,
                review_state_str(row.review_state),
                row.created_at,
                row.reviewed_at,
                row.review_decision.map(review_decision_str),
                row.llm_opt_out as i64,
                row.owner_user_id,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(row.id)
    }

    async fn get_extraction_by_document(
        &self,
        document_id: &str,
        owner: OwnerFilter<'_>,
    ) -> StoreResult<Option<ExtractionRow>> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let sql =
            format!("SELECT * FROM extractions WHERE document_id = ?1{clause} ORDER BY created_at DESC LIMIT 1");
        conn.query_row(&sql, params![document_id, bound], row_to_extraction)
            .optional()
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn get_extraction_by_external_id(&self, external_id: &str) -> StoreResult<Option<ExtractionRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM extractions WHERE external_id = ?1",
            params![external_id],
            row_to_extraction,
        )
        .optional()
        .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn update_extraction_review(
        &self,
        extraction_id: &str,
        decision: ReviewDecision,
        updated_record: Option<CanonicalRecord>,
    ) -> StoreResult<()> {
        let conn = self.lock();
        let now = Utc::now();
        if let Some(record) = updated_record {
            let record_json = serde_json::to_string(&record).map_err(|e| StoreError::Validation(e.to_string()))?;
            conn.execute(
                "UPDATE extractions SET reviewed_at = ?1, review_decision = ?2, record_json = ?3, external_id = ?4 WHERE id = ?5",
                params![now, review_decision_str(decision), record_json, record.proposal.external_id, extraction_id],
            )
        } else {
            conn.execute(
                "UPDATE extractions SET reviewed_at = ?1, review_decision = ?2 WHERE id = ?3",
                params![now, review_decision_str(decision), extraction_id],
            )
        }
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn reset_extraction_for_review(&self, extraction_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE extractions SET reviewed_at = NULL, review_decision = NULL WHERE id = ?1",
            params![extraction_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_extractions_for_review(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<ExtractionRow>> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let sql = format!(
            "SELECT * FROM extractions WHERE review_state IN ('REVIEW', 'MANUAL') AND review_decision IS NULL{clause} ORDER BY created_at ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![bound], row_to_extraction)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    async fn list_extractions_pending_reconciliation(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<ExtractionRow>> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let sql = format!(
            "SELECT * FROM extractions e
             WHERE ((e.review_state = 'AUTO' AND e.review_decision IS NULL) OR e.review_decision IN ('ACCEPTED', 'EDITED'))
             AND NOT EXISTS (SELECT 1 FROM imports i WHERE i.document_id = e.document_id AND i.status != 'FAILED')
             AND NOT EXISTS (SELECT 1 FROM match_proposals p WHERE p.document_id = e.document_id AND p.status = 'PENDING')
             {clause}
             ORDER BY e.created_at ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![bound], row_to_extraction)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    async fn create_import(&self, row: ImportRow) -> StoreResult<ImportId> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO imports (external_id, document_id, firefly_id, status, error_message, payload_json, created_at, imported_at, owner_user_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                row.external_id,
                row.document_id,
                row.firefly_id,
                import_status_str(row.status),
                row.error_message,
                row.payload_json,
                row.created_at,
                row.imported_at,
                row.owner_user_id,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    async fn update_import_success(&self, external_id: &str, firefly_id: FireflyId) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE imports SET status = ?1, firefly_id = ?2, imported_at = ?3 WHERE external_id = ?4",
            params![import_status_str(ImportStatus::Imported), firefly_id, Utc::now(), external_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn update_import_failed(&self, external_id: &str, error_message: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE imports SET status = ?1, error_message = ?2, imported_at = ?3 WHERE external_id = ?4",
            params![import_status_str(ImportStatus::Failed), error_message, Utc::now(), external_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn reset_import_for_retry(&self, external_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE imports SET status = ?1, error_message = NULL, imported_at = NULL WHERE external_id = ?2",
            params![import_status_str(ImportStatus::Pending), external_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_import_by_external_id(&self, external_id: &str) -> StoreResult<Option<ImportRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM imports WHERE external_id = ?1",
            params![external_id],
            row_to_import,
        )
        .optional()
        .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn import_exists(&self, external_id: &str) -> StoreResult<bool> {
        Ok(self.get_import_by_external_id(external_id).await?.is_some())
    }

    async fn upsert_cache_entry(&self, row: LedgerCacheRow) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO ledger_cache
            (firefly_id, transaction_type, date, amount_minor, description, source_account, destination_account,
             notes, category, tags, ledger_external_id, internal_reference, synced_at, match_status,
             matched_document_id, match_confidence, deleted_at, owner_user_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(firefly_id) DO UPDATE SET
                transaction_type = excluded.transaction_type,
                date = excluded.date,
                amount_minor = excluded.amount_minor,
                description = excluded.description,
                source_account = excluded.source_account,
                destination_account = excluded.destination_account,
                notes = excluded.notes,
                category = excluded.category,
                tags = excluded.tags,
                ledger_external_id = excluded.ledger_external_id,
                internal_reference = excluded.internal_reference,
                synced_at = excluded.synced_at,
                deleted_at = NULL
            ",
            params![
                row.firefly_id,
                row.transaction_type,
                row.date,
                row.amount.minor_units(),
                row.description,
                row.source_account,
                row.destination_account,
                row.notes,
                row.category,
                tags_to_json(&row.tags),
                row.ledger_external_id,
                row.internal_reference,
                row.synced_at,
                match_status_str(row.match_status),
                row.matched_document_id,
                row.match_confidence,
                row.deleted_at,
                row.owner_user_id,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_unmatched_cache(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<LedgerCacheRow>> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let sql = format!(
            "SELECT * FROM ledger_cache WHERE match_status = 'UNMATCHED' AND deleted_at IS NULL{clause} ORDER BY date ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![bound], row_to_cache)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    async fn list_cache_matched_to_document(
        &self,
        document_id: &str,
        owner: OwnerFilter<'_>,
    ) -> StoreResult<Vec<LedgerCacheRow>> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let sql = format!(
            "SELECT * FROM ledger_cache WHERE matched_document_id = ? AND deleted_at IS NULL{clause} ORDER BY date ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![document_id, bound], row_to_cache)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    async fn update_cache_match_status(
        &self,
        firefly_id: FireflyId,
        status: MatchStatus,
        matched_document_id: Option<&str>,
        match_confidence: Option<f32>,
    ) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE ledger_cache SET match_status = ?1, matched_document_id = ?2, match_confidence = ?3 WHERE firefly_id = ?4",
            params![match_status_str(status), matched_document_id, match_confidence, firefly_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn soft_delete_missing_cache(&self, seen_firefly_ids: &[FireflyId], owner: OwnerFilter<'_>) -> StoreResult<usize> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let placeholders = if seen_firefly_ids.is_empty() {
            "0".to_string()
        } else {
            seen_firefly_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        let sql = format!(
            "UPDATE ledger_cache SET deleted_at = ?1 WHERE deleted_at IS NULL AND firefly_id NOT IN ({placeholders}){clause}"
        );
        let affected = conn
            .execute(&sql, params![Utc::now(), bound])
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(affected)
    }

    async fn create_match_proposal(&self, row: MatchProposalRow) -> StoreResult<ProposalId> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO match_proposals (firefly_id, document_id, match_score, match_reasons, status, created_at, reviewed_at, owner_user_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                row.firefly_id,
                row.document_id,
                row.match_score,
                tags_to_json(&row.match_reasons),
                proposal_status_str(row.status),
                row.created_at,
                row.reviewed_at,
                row.owner_user_id,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    async fn list_pending_proposals(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<MatchProposalRow>> {
        let conn = self.lock();
        let (clause, bound) = owner_clause(owner);
        let sql = format!("SELECT * FROM match_proposals WHERE status = 'PENDING'{clause} ORDER BY created_at ASC");
        let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![bound], row_to_proposal)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    async fn update_proposal_status(&self, proposal_id: ProposalId, status: ProposalStatus) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE match_proposals SET status = ?1, reviewed_at = ?2 WHERE id = ?3",
            params![proposal_status_str(status), Utc::now(), proposal_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn purge_pending_proposals_for(&self, firefly_id: FireflyId, document_id: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM match_proposals WHERE firefly_id = ?1 AND document_id = ?2 AND status = 'PENDING'",
            params![firefly_id, document_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn create_interpretation_run(&self, row: InterpretationRunRow) -> StoreResult<RunId> {
        let conn = self.lock();
        let inputs_json =
            serde_json::to_string(&row.inputs_summary).map_err(|e| StoreError::Validation(e.to_string()))?;
        let llm_result_json = row
            .llm_result
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let linkage_json = row
            .linkage_marker_written
            .map(|v| serde_json::to_string(&v))
            .transpose()
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        conn.execute(
            r"
            INSERT INTO interpretation_runs
            (document_id, firefly_id, external_id, run_timestamp, duration_ms, pipeline_version, algorithm_version,
             inputs_summary, rules_applied, llm_result, final_state, decision_source, auto_applied,
             firefly_write_action, firefly_target_id, linkage_marker_written, owner_user_id)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            ",
            params![
                row.document_id,
                row.firefly_id,
                row.external_id,
                row.run_timestamp,
                row.duration_ms,
                row.pipeline_version,
                row.algorithm_version,
                inputs_json,
                tags_to_json(&row.rules_applied),
                llm_result_json,
                final_state_str(row.final_state),
                decision_source_str(row.decision_source),
                row.auto_applied as i64,
                row.firefly_write_action,
                row.firefly_target_id,
                linkage_json,
                row.owner_user_id,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    async fn list_runs_for_document(&self, document_id: &str) -> StoreResult<Vec<InterpretationRunRow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM interpretation_runs WHERE document_id = ?1 ORDER BY run_timestamp ASC")
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![document_id], row_to_run)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    async fn latest_run_for_document(&self, document_id: &str) -> StoreResult<Option<InterpretationRunRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM interpretation_runs WHERE document_id = ?1 ORDER BY run_timestamp DESC LIMIT 1",
            params![document_id],
            row_to_run,
        )
        .optional()
        .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn get_llm_cache(&self, cache_key: &str) -> StoreResult<Option<LlmCacheRow>> {
        let conn = self.lock();
        let now = Utc::now();
        let found = conn
            .query_row(
                "SELECT * FROM llm_cache WHERE cache_key = ?1 AND expires_at > ?2",
                params![cache_key, now],
                |row| {
                    Ok(LlmCacheRow {
                        cache_key: row.get("cache_key")?,
                        model_name: row.get("model_name")?,
                        prompt_version: row.get("prompt_version")?,
                        taxonomy_version: row.get("taxonomy_version")?,
                        response_text: row.get("response_text")?,
                        hit_count: row.get("hit_count")?,
                        expires_at: row.get("expires_at")?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        if found.is_some() {
            conn.execute(
                "UPDATE llm_cache SET hit_count = hit_count + 1 WHERE cache_key = ?1",
                params![cache_key],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        }
        Ok(found)
    }

    async fn set_llm_cache(&self, row: LlmCacheRow) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO llm_cache (cache_key, model_name, prompt_version, taxonomy_version, response_text, hit_count, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
            ON CONFLICT(cache_key) DO UPDATE SET
                response_text = excluded.response_text,
                expires_at = excluded.expires_at
            ",
            params![
                row.cache_key,
                row.model_name,
                row.prompt_version,
                row.taxonomy_version,
                row.response_text,
                row.expires_at,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn sweep_expired_llm_cache(&self) -> StoreResult<usize> {
        let conn = self.lock();
        let affected = conn
            .execute("DELETE FROM llm_cache WHERE expires_at <= ?1", params![Utc::now()])
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(affected)
    }

    async fn llm_suggestion_count(&self) -> StoreResult<i64> {
        let conn = self.lock();
        conn.query_row("SELECT COUNT(*) FROM llm_cache", [], |row| row.get(0))
            .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn record_llm_feedback(&self, row: LlmFeedbackRow) -> StoreResult<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO llm_feedback (run_id, suggested_category, actual_category, feedback_kind, notes) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![row.run_id, row.suggested_category, row.actual_category, feedback_kind_str(row.feedback_kind), row.notes],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    async fn llm_feedback_stats(&self) -> StoreResult<(i64, i64)> {
        let conn = self.lock();
        let correct: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM llm_feedback WHERE feedback_kind = 'CORRECT'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let wrong: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM llm_feedback WHERE feedback_kind = 'WRONG'",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok((correct, wrong))
    }

    async fn schedule_ai_job(&self, row: AiJobRow) -> StoreResult<AiJobId> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO ai_jobs
            (document_id, extraction_id, external_id, priority, status, retry_count, max_retries, scheduled_for,
             created_by, created_at, started_at, completed_at, error_message, suggestions_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ",
            params![
                row.document_id,
                row.extraction_id,
                row.external_id,
                row.priority,
                ai_job_status_str(row.status),
                row.retry_count,
                row.max_retries,
                row.scheduled_for,
                row.created_by,
                row.created_at,
                row.started_at,
                row.completed_at,
                row.error_message,
                row.suggestions_json,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_next_ai_job(&self) -> StoreResult<Option<AiJobRow>> {
        let conn = self.lock();
        conn.query_row(
            r"
            SELECT * FROM ai_jobs
            WHERE status = 'PENDING' AND (scheduled_for IS NULL OR scheduled_for <= ?1)
            ORDER BY priority DESC, created_at ASC
            LIMIT 1
            ",
            params![Utc::now()],
            row_to_ai_job,
        )
        .optional()
        .map_err(|e| StoreError::Storage(e.to_string()))
    }

    async fn start_ai_job(&self, job_id: AiJobId) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE ai_jobs SET status = ?1, started_at = ?2 WHERE id = ?3",
            params![ai_job_status_str(AiJobStatus::Processing), Utc::now(), job_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn complete_ai_job(&self, job_id: AiJobId, suggestions_json: &str) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE ai_jobs SET status = ?1, completed_at = ?2, suggestions_json = ?3 WHERE id = ?4",
            params![ai_job_status_str(AiJobStatus::Completed), Utc::now(), suggestions_json, job_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn fail_ai_job_with_retry(&self, job_id: AiJobId, error_message: &str) -> StoreResult<()> {
        let conn = self.lock();
        let (retry_count, max_retries): (i32, i32) = conn
            .query_row(
                "SELECT retry_count, max_retries FROM ai_jobs WHERE id = ?1",
                params![job_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        if retry_count + 1 >= max_retries {
            conn.execute(
                "UPDATE ai_jobs SET status = ?1, retry_count = retry_count + 1, error_message = ?2, completed_at = ?3 WHERE id = ?4",
                params![ai_job_status_str(AiJobStatus::Failed), error_message, Utc::now(), job_id],
            )
        } else {
            conn.execute(
                "UPDATE ai_jobs SET status = ?1, retry_count = retry_count + 1, error_message = ?2, started_at = NULL WHERE id = ?3",
                params![ai_job_status_str(AiJobStatus::Pending), error_message, job_id],
            )
        }
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn cancel_ai_job(&self, job_id: AiJobId) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE ai_jobs SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![ai_job_status_str(AiJobStatus::Cancelled), Utc::now(), job_id],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn list_ai_jobs(&self, status: Option<AiJobStatus>) -> StoreResult<Vec<AiJobRow>> {
        let conn = self.lock();
        let (sql, bound): (&str, Option<&'static str>) = match status {
            Some(s) => ("SELECT * FROM ai_jobs WHERE status = ?1 ORDER BY created_at ASC", Some(ai_job_status_str(s))),
            None => ("SELECT * FROM ai_jobs ORDER BY created_at ASC", None),
        };
        let mut stmt = conn.prepare(sql).map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(params![bound], row_to_ai_job)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        collect_rows(rows)
    }

    async fn ai_job_stats(&self) -> StoreResult<Vec<(AiJobStatus, i64)>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM ai_jobs GROUP BY status")
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count))
            })
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        let mut out = Vec::new();
        for row in rows {
            let (status, count) = row.map_err(|e| StoreError::Storage(e.to_string()))?;
            let status = ai_job_status_from_str(&status).map_err(|e| StoreError::Storage(e.to_string()))?;
            out.push((status, count));
        }
        Ok(out)
    }

    async fn cleanup_ai_jobs(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.lock();
        let affected = conn
            .execute(
                "DELETE FROM ai_jobs WHERE status IN ('COMPLETED', 'FAILED', 'CANCELLED') AND created_at < ?1",
                params![older_than],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(affected)
    }

    async fn upsert_vendor_mapping(&self, row: VendorMappingRow) -> StoreResult<()> {
        let conn = self.lock();
        conn.execute(
            r"
            INSERT INTO vendor_mappings (vendor_pattern, destination_account, category, tags, created_at, updated_at, use_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
            ON CONFLICT(vendor_pattern) DO UPDATE SET
                destination_account = excluded.destination_account,
                category = excluded.category,
                tags = excluded.tags,
                updated_at = excluded.updated_at,
                use_count = vendor_mappings.use_count + 1
            ",
            params![
                row.vendor_pattern,
                row.destination_account,
                row.category,
                tags_to_json(&row.tags),
                row.created_at,
                row.updated_at,
            ],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn get_vendor_mapping(&self, vendor_pattern: &str) -> StoreResult<Option<VendorMappingRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM vendor_mappings WHERE vendor_pattern = ?1",
            params![vendor_pattern],
            row_to_vendor_mapping,
        )
        .optional()
        .map_err(|e| StoreError::Storage(e.to_string()))
    }
}

fn collect_rows<T>(rows: rusqlite::MappedRows<'_, impl FnMut(&Row<'_>) -> DbResult<T>>) -> StoreResult<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| StoreError::Storage(e.to_string()))?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lk_record::{Classification, FieldConfidence, LineItem, Proposal, Provenance, TransactionType};
    use pretty_assertions::assert_eq;

    fn sample_document(id: &str) -> Document {
        let now = Utc::now();
        Document {
            document_id: id.to_string(),
            source_hash: "abc123".into(),
            title: "Invoice".into(),
            document_type: "invoice".into(),
            correspondent: "Acme".into(),
            tags: vec!["finance".into()],
            first_seen: now,
            last_seen: now,
        }
    }

    fn sample_record(document_id: &str) -> CanonicalRecord {
        CanonicalRecord {
            document_id: document_id.to_string(),
            source_hash: "abc123".into(),
            document_url: "https://dms.local/doc/1".into(),
            raw_text: "raw".into(),
            proposal: Proposal {
                transaction_type: TransactionType::Withdrawal,
                date: NaiveDate::from_ymd_opt(2024, 11, 18).expect("valid fixture date"),
                amount: Money::parse("11.48").expect("valid fixture amount"),
                currency: "EUR".into(),
                description: "Acme invoice".into(),
                source_account: Some("Checking".into()),
                destination_account: Some("Acme".into()),
                category: None,
                tags: vec![],
                notes: None,
                external_id: "deadbeefdeadbeef:pl:12345".into(),
                invoice_number: None,
                due_date: None,
                tax_total: None,
            },
            field_confidence: FieldConfidence::default(),
            provenance: Provenance {
                source_system: "paperless".into(),
                parser_version: "1".into(),
                parsed_at: Utc::now(),
                extraction_strategy: "text-layer".into(),
            },
            classification: Some(Classification::default()),
            line_items: vec![LineItem {
                description: "line".into(),
                quantity: Some(1.0),
                unit_price: None,
                total: Some(Money::parse("11.48").expect("valid fixture amount")),
                tax_rate: None,
                position: 0,
            }],
        }
    }

    #[tokio::test]
    async fn upserts_and_reads_back_a_document() {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        store.upsert_document(sample_document("12345"), None).await.expect("upsert");

        let fetched = store.get_document("12345", None).await.expect("get").expect("present");
        assert_eq!(fetched.title, "Invoice");
        assert_eq!(fetched.tags, vec!["finance".to_string()]);
    }

    #[tokio::test]
    async fn owner_filter_hides_rows_owned_by_someone_else() {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        store
            .upsert_document(sample_document("owned-doc"), Some("user-a"))
            .await
            .expect("upsert");

        let as_owner = store.get_document("owned-doc", Some("user-a")).await.expect("get");
        let as_stranger = store.get_document("owned-doc", Some("user-b")).await.expect("get");
        assert!(as_owner.is_some());
        assert!(as_stranger.is_none());
    }

    #[tokio::test]
    async fn saves_and_retrieves_extraction_by_external_id() {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        store.upsert_document(sample_document("12345"), None).await.expect("upsert");

        let record = sample_record("12345");
        let row = ExtractionRow {
            id: "ext-1".into(),
            document_id: "12345".into(),
            external_id: record.proposal.external_id.clone(),
            record,
            overall_confidence: 0.92,
            review_state: ReviewState::Auto,
            created_at: Utc::now(),
            reviewed_at: None,
            review_decision: None,
            llm_opt_out: false,
            owner_user_id: None,
        };
        store.save_extraction(row).await.expect("save extraction");

        let fetched = store
            .get_extraction_by_external_id("deadbeefdeadbeef:pl:12345")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(fetched.document_id, "12345");
        assert_eq!(fetched.overall_confidence, 0.92);
    }

    #[tokio::test]
    async fn import_idempotency_round_trip() {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        store.upsert_document(sample_document("12345"), None).await.expect("upsert");

        let import = ImportRow {
            id: 0,
            external_id: "deadbeefdeadbeef:pl:12345".into(),
            document_id: "12345".into(),
            firefly_id: None,
            status: ImportStatus::Pending,
            error_message: None,
            payload_json: "{}".into(),
            created_at: Utc::now(),
            imported_at: None,
            owner_user_id: None,
        };
        store.create_import(import).await.expect("create import");
        assert!(store.import_exists("deadbeefdeadbeef:pl:12345").await.expect("exists"));

        store
            .update_import_success("deadbeefdeadbeef:pl:12345", 77)
            .await
            .expect("mark success");
        let fetched = store
            .get_import_by_external_id("deadbeefdeadbeef:pl:12345")
            .await
            .expect("lookup")
            .expect("present");
        assert_eq!(fetched.status, ImportStatus::Imported);
        assert_eq!(fetched.firefly_id, Some(77));
    }

    #[tokio::test]
    async fn vendor_mapping_increments_use_count_on_resave() {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        let now = Utc::now();
        let mapping = VendorMappingRow {
            vendor_pattern: "amazon".into(),
            destination_account: Some("Shopping".into()),
            category: Some("Retail".into()),
            tags: vec![],
            created_at: now,
            updated_at: now,
            use_count: 1,
        };
        store.upsert_vendor_mapping(mapping.clone()).await.expect("first save");
        store.upsert_vendor_mapping(mapping).await.expect("second save");

        let fetched = store.get_vendor_mapping("amazon").await.expect("lookup").expect("present");
        assert_eq!(fetched.use_count, 2);
    }

    #[tokio::test]
    async fn migrations_are_idempotent_across_repeated_opens() {
        let store = SqliteStore::open_in_memory().expect("first open");
        store.run_migrations().expect("re-run migrations");
        drop(store);
    }
}
