#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use lk_ledger_client::{
    CreateOutcome, LedgerClient, LedgerError, internal_reference_for, notes_marker_for,
};
use lk_match::{DocumentSide, LedgerSide, MatchOptions, match_candidates};
use lk_payload::{PayloadContext, PayloadError, build_payload};
use lk_record::{Money, recover_linked_document_id};
use lk_store::{
    DecisionSource, ExtractionRow, FinalState, FireflyId, InterpretationRunRow, LedgerCacheRow,
    MatchProposalRow, MatchStatus, OwnerFilter, ProposalId, ProposalStatus, ReviewState,
    StateStore, StoreError,
};
use thiserror::Error;
use tokio::sync::Mutex as TokioMutex;
use tracing::warn;

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("a reconciliation run is already in progress for this owner")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Where a run (or a single document's re-interpretation) currently sits
/// in the five-stage pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Syncing,
    Matching,
    Proposing,
    AutoLinking,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileOptions {
    /// Re-pulls the full remote transaction history and prunes cache rows
    /// no longer present upstream, instead of the incremental lookback.
    pub full_sync: bool,
    /// Computes and counts proposals/links without writing to the store
    /// or the ledger.
    pub dry_run: bool,
    /// Skips the syncing phase entirely and matches against whatever is
    /// already cached.
    pub skip_sync: bool,
    pub date_tolerance_days: i64,
    pub auto_match_threshold: f32,
    pub max_results: usize,
    /// When true (the default) only `create_manual_transaction` may
    /// create new ledger transactions; `run` only ever links to existing
    /// ones.
    pub bank_first: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            full_sync: false,
            dry_run: false,
            skip_sync: false,
            date_tolerance_days: 7,
            auto_match_threshold: 0.90,
            max_results: 5,
            bank_first: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub phase: RunPhase,
    pub synced: usize,
    pub matched_documents: usize,
    pub proposals_created: usize,
    pub auto_linked: usize,
    pub ambiguous: usize,
    pub errors: Vec<String>,
}

fn document_side(row: &ExtractionRow) -> DocumentSide {
    let proposal = &row.record.proposal;
    let vendor = proposal
        .destination_account
        .clone()
        .or_else(|| row.record.classification.as_ref().and_then(|c| c.correspondent.clone()));
    DocumentSide {
        document_id: row.document_id.clone(),
        amount: Some(proposal.amount),
        date: Some(proposal.date),
        description: Some(proposal.description.clone()),
        vendor,
        source_account: proposal.source_account.clone(),
    }
}

fn ledger_side(row: &LedgerCacheRow) -> LedgerSide {
    LedgerSide {
        firefly_id: row.firefly_id.to_string(),
        amount: Some(row.amount),
        date: Some(row.date),
        description: Some(row.description.clone()),
        destination_name: row.destination_account.clone(),
        source_name: row.source_account.clone(),
    }
}

fn parse_firefly_id(raw: &str) -> ReconcileResult<FireflyId> {
    raw.parse::<FireflyId>()
        .map_err(|_| ReconcileError::Validation(format!("invalid firefly id: {raw}")))
}

fn review_state_label(state: ReviewState) -> &'static str {
    match state {
        ReviewState::Auto => "AUTO",
        ReviewState::Review => "REVIEW",
        ReviewState::Manual => "MANUAL",
    }
}

/// Pulls remote ledger transactions into the local cache. Grounded on the
/// same upsert-then-prune shape as a bank-feed importer: every poll
/// upserts what it sees, and only a full sync is trusted to prune rows
/// that vanished upstream, since an incremental window's "seen" set
/// isn't exhaustive.
pub mod sync {
    use super::{
        FireflyId, LedgerCacheRow, LedgerClient, MatchStatus, Money, OwnerFilter, ReconcileResult,
        StateStore, Utc, parse_firefly_id, recover_linked_document_id, warn,
    };

    pub const INCREMENTAL_LOOKBACK_DAYS: i64 = 35;

    pub async fn sync_ledger_cache<S, L>(
        ledger: &L,
        store: &S,
        owner: OwnerFilter<'_>,
        full_sync: bool,
    ) -> ReconcileResult<usize>
    where
        S: StateStore,
        L: LedgerClient,
    {
        let since = if full_sync {
            None
        } else {
            Some(Utc::now().date_naive() - chrono::Duration::days(INCREMENTAL_LOOKBACK_DAYS))
        };
        let remote = ledger.list_transactions(since).await?;
        let mut seen: Vec<FireflyId> = Vec::with_capacity(remote.len());

        for transaction in &remote {
            let firefly_id = parse_firefly_id(&transaction.transaction_group_id)?;
            seen.push(firefly_id);
            let Some(first) = transaction.splits.first() else {
                continue;
            };
            let Some(amount) = first.amount.as_deref().and_then(|raw| Money::parse(raw).ok()) else {
                warn!(firefly_id, "skipping remote transaction with unparseable amount");
                continue;
            };
            let date = first.date.unwrap_or_else(|| Utc::now().date_naive());
            let transaction_type = first
                .transaction_type
                .map(|t| format!("{t:?}").to_ascii_lowercase())
                .unwrap_or_default();

            let linked = recover_linked_document_id(
                transaction.external_id.as_deref(),
                transaction.internal_reference.as_deref(),
                first.notes.as_deref(),
            );
            let (match_status, matched_document_id, match_confidence) = match &linked {
                Some((document_id, _)) if store.document_exists(document_id, owner).await? => {
                    (MatchStatus::Matched, Some(document_id.clone()), Some(1.0))
                }
                _ => (MatchStatus::Unmatched, None, None),
            };

            store
                .upsert_cache_entry(LedgerCacheRow {
                    firefly_id,
                    transaction_type,
                    date,
                    amount,
                    description: first.description.clone().unwrap_or_default(),
                    source_account: first.source_name.clone(),
                    destination_account: first.destination_name.clone(),
                    notes: first.notes.clone(),
                    category: first.category_name.clone(),
                    tags: first.tags.clone().unwrap_or_default(),
                    ledger_external_id: transaction.external_id.clone(),
                    internal_reference: transaction.internal_reference.clone(),
                    synced_at: Utc::now(),
                    match_status,
                    matched_document_id,
                    match_confidence,
                    deleted_at: None,
                    owner_user_id: owner.map(str::to_string),
                })
                .await?;
        }

        if full_sync {
            store.soft_delete_missing_cache(&seen, owner).await?;
        }

        Ok(remote.len())
    }
}

/// Drives one owner's sync/match/propose/auto-link pass and exposes the
/// manual-review side doors (accept, reject, rerun, manual create) the
/// orchestrator's automatic run never takes on its own.
pub struct ReconciliationOrchestrator<S, L>
where
    S: StateStore,
    L: LedgerClient,
{
    store: Arc<S>,
    ledger: Arc<L>,
    owner_locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl<S, L> ReconciliationOrchestrator<S, L>
where
    S: StateStore,
    L: LedgerClient,
{
    #[must_use]
    pub fn new(store: Arc<S>, ledger: Arc<L>) -> Self {
        Self { store, ledger, owner_locks: StdMutex::new(HashMap::new()) }
    }

    fn owner_lock(&self, owner: OwnerFilter<'_>) -> Arc<TokioMutex<()>> {
        let key = owner.unwrap_or("").to_string();
        let mut locks = match self.owner_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(key).or_insert_with(|| Arc::new(TokioMutex::new(()))).clone()
    }

    /// Runs one reconciliation pass for `owner`. Two runs for the same
    /// owner never overlap: a second caller gets `AlreadyRunning`
    /// immediately rather than queueing behind the first.
    pub async fn run(&self, owner: OwnerFilter<'_>, options: ReconcileOptions) -> ReconcileResult<RunSummary> {
        let lock = self.owner_lock(owner);
        let _guard = lock.try_lock().map_err(|_| ReconcileError::AlreadyRunning)?;
        Ok(match self.run_phases(owner, options).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "reconciliation run failed");
                RunSummary { phase: RunPhase::Failed, errors: vec![err.to_string()], ..RunSummary::default() }
            }
        })
    }

    async fn run_phases(&self, owner: OwnerFilter<'_>, options: ReconcileOptions) -> ReconcileResult<RunSummary> {
        let mut summary = RunSummary::default();

        if !options.skip_sync {
            summary.phase = RunPhase::Syncing;
            summary.synced =
                sync::sync_ledger_cache(self.ledger.as_ref(), self.store.as_ref(), owner, options.full_sync).await?;
        }

        summary.phase = RunPhase::Matching;
        let pending_documents = self.store.list_extractions_pending_reconciliation(owner).await?;
        let cache_candidates = self.store.list_unmatched_cache(owner).await?;
        let candidates: Vec<LedgerSide> = cache_candidates.iter().map(ledger_side).collect();
        let match_options =
            MatchOptions { date_tolerance_days: options.date_tolerance_days, max_results: options.max_results };

        summary.phase = RunPhase::Proposing;
        let existing_proposals = self.store.list_pending_proposals(owner).await?;
        let mut seen_pairs: HashSet<(FireflyId, String)> =
            existing_proposals.iter().map(|p| (p.firefly_id, p.document_id.clone())).collect();

        for extraction in &pending_documents {
            let already_linked =
                !self.store.list_cache_matched_to_document(&extraction.document_id, owner).await?.is_empty();
            if already_linked {
                continue;
            }

            let document = document_side(extraction);
            let scored = match_candidates(&document, &candidates, match_options);
            if scored.is_empty() {
                continue;
            }
            summary.matched_documents += 1;

            for candidate in &scored {
                let firefly_id = parse_firefly_id(&candidate.firefly_id)?;
                let key = (firefly_id, extraction.document_id.clone());
                if !seen_pairs.insert(key) {
                    continue;
                }
                if options.dry_run {
                    summary.proposals_created += 1;
                    continue;
                }
                self.store
                    .create_match_proposal(MatchProposalRow {
                        id: 0,
                        firefly_id,
                        document_id: extraction.document_id.clone(),
                        match_score: candidate.total,
                        match_reasons: candidate.reasons.clone(),
                        status: ProposalStatus::Pending,
                        created_at: Utc::now(),
                        reviewed_at: None,
                        owner_user_id: owner.map(str::to_string),
                    })
                    .await?;
                summary.proposals_created += 1;
            }
        }

        summary.phase = RunPhase::AutoLinking;
        if !options.dry_run {
            let pending = self.store.list_pending_proposals(owner).await?;
            let mut by_firefly: HashMap<FireflyId, Vec<&MatchProposalRow>> = HashMap::new();
            for proposal in &pending {
                by_firefly.entry(proposal.firefly_id).or_default().push(proposal);
            }
            for (firefly_id, group) in by_firefly {
                let qualifying: Vec<&MatchProposalRow> =
                    group.iter().copied().filter(|p| p.match_score >= options.auto_match_threshold).collect();
                match qualifying.as_slice() {
                    [proposal] => {
                        match self
                            .execute_link(
                                owner,
                                firefly_id,
                                &proposal.document_id,
                                proposal.match_score,
                                Some(proposal.id),
                                DecisionSource::Auto,
                            )
                            .await
                        {
                            Ok(()) => summary.auto_linked += 1,
                            Err(err) => summary.errors.push(err.to_string()),
                        }
                    }
                    [] => {}
                    _ => summary.ambiguous += 1,
                }
            }
        }

        summary.phase = RunPhase::Completed;
        Ok(summary)
    }

    /// Writes the three linkage markers to the ledger transaction and
    /// records the outcome. `final_state` lands on `Linked` when the
    /// ledger write and both store updates succeed, `LinkageWriteFailed`
    /// when the ledger call itself fails, and `LinkError` when the
    /// ledger write succeeded but a follow-up store update did not
    /// (ledger and cache now disagree and need manual reconciliation).
    async fn execute_link(
        &self,
        owner: OwnerFilter<'_>,
        firefly_id: FireflyId,
        document_id: &str,
        confidence: f32,
        proposal_id: Option<ProposalId>,
        decision_source: DecisionSource,
    ) -> ReconcileResult<()> {
        let extraction = self
            .store
            .get_extraction_by_document(document_id, owner)
            .await?
            .ok_or_else(|| ReconcileError::Validation(format!("no extraction for document {document_id}")))?;

        let external_id = extraction.record.proposal.external_id.clone();
        let internal_reference = internal_reference_for(document_id);
        let notes = notes_marker_for(document_id);
        let transaction_group_id = firefly_id.to_string();

        let write_result = self
            .ledger
            .update_linkage(&transaction_group_id, Some(&external_id), Some(&internal_reference), Some(&notes))
            .await;

        let mut final_state = match &write_result {
            Ok(()) => FinalState::Linked,
            Err(_) => FinalState::LinkageWriteFailed,
        };

        let mut store_error = None;
        if write_result.is_ok() {
            if let Err(err) = self
                .store
                .update_cache_match_status(firefly_id, MatchStatus::Matched, Some(document_id), Some(confidence))
                .await
            {
                store_error = Some(err);
            } else if let Some(proposal_id) = proposal_id {
                if let Err(err) = self.store.update_proposal_status(proposal_id, ProposalStatus::Accepted).await {
                    store_error = Some(err);
                }
            }
        }
        if store_error.is_some() {
            final_state = FinalState::LinkError;
        }

        self.store
            .create_interpretation_run(InterpretationRunRow {
                id: 0,
                document_id: document_id.to_string(),
                firefly_id: Some(firefly_id),
                external_id: Some(external_id.clone()),
                run_timestamp: Utc::now(),
                duration_ms: 0,
                pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
                algorithm_version: "reconcile-v1".to_string(),
                inputs_summary: serde_json::json!({ "match_confidence": confidence }),
                rules_applied: vec!["match_candidates".to_string()],
                llm_result: None,
                final_state,
                decision_source,
                auto_applied: matches!(decision_source, DecisionSource::Auto),
                firefly_write_action: Some("update_linkage".to_string()),
                firefly_target_id: Some(firefly_id),
                linkage_marker_written: Some(serde_json::json!({
                    "external_id": external_id,
                    "internal_reference": internal_reference,
                    "notes": notes,
                })),
                owner_user_id: owner.map(str::to_string),
            })
            .await?;

        if let Some(err) = store_error {
            return Err(ReconcileError::from(err));
        }
        write_result.map_err(ReconcileError::from)
    }

    /// Links a document to a ledger transaction the user picked by hand,
    /// bypassing proposal creation entirely.
    pub async fn manual_link(&self, owner: OwnerFilter<'_>, firefly_id: &str, document_id: &str) -> ReconcileResult<()> {
        let firefly_id = parse_firefly_id(firefly_id)?;
        self.execute_link(owner, firefly_id, document_id, 1.0, None, DecisionSource::User).await
    }

    /// Rejects a pending proposal. No ledger call is made: there is
    /// nothing to link, so only the proposal status and the audit trail
    /// change.
    pub async fn reject(&self, owner: OwnerFilter<'_>, proposal_id: ProposalId) -> ReconcileResult<()> {
        let proposal = self
            .store
            .list_pending_proposals(owner)
            .await?
            .into_iter()
            .find(|p| p.id == proposal_id)
            .ok_or_else(|| ReconcileError::Validation(format!("no pending proposal {proposal_id}")))?;

        self.store.update_proposal_status(proposal_id, ProposalStatus::Rejected).await?;
        self.store
            .create_interpretation_run(InterpretationRunRow {
                id: 0,
                document_id: proposal.document_id.clone(),
                firefly_id: Some(proposal.firefly_id),
                external_id: None,
                run_timestamp: Utc::now(),
                duration_ms: 0,
                pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
                algorithm_version: "reconcile-v1".to_string(),
                inputs_summary: serde_json::json!({ "match_score": proposal.match_score }),
                rules_applied: vec!["user_reject".to_string()],
                llm_result: None,
                final_state: FinalState::Rejected,
                decision_source: DecisionSource::User,
                auto_applied: false,
                firefly_write_action: None,
                firefly_target_id: Some(proposal.firefly_id),
                linkage_marker_written: None,
                owner_user_id: owner.map(str::to_string),
            })
            .await?;
        Ok(())
    }

    /// Discards a document's pending proposals and matched-cache state
    /// and re-scores it against whatever is currently unmatched. Used
    /// after a correction changes the amount, date, or accounts on a
    /// document that was already scored once.
    pub async fn rerun_interpretation(
        &self,
        owner: OwnerFilter<'_>,
        document_id: &str,
        options: ReconcileOptions,
    ) -> ReconcileResult<RunSummary> {
        for row in self.store.list_cache_matched_to_document(document_id, owner).await? {
            self.store.update_cache_match_status(row.firefly_id, MatchStatus::Unmatched, None, None).await?;
            self.store.purge_pending_proposals_for(row.firefly_id, document_id).await?;
        }
        let pending = self.store.list_pending_proposals(owner).await?;
        for proposal in pending.iter().filter(|p| p.document_id == document_id) {
            self.store.purge_pending_proposals_for(proposal.firefly_id, document_id).await?;
        }

        let extraction = self
            .store
            .get_extraction_by_document(document_id, owner)
            .await?
            .ok_or_else(|| ReconcileError::Validation(format!("no extraction for document {document_id}")))?;
        let candidates: Vec<LedgerSide> =
            self.store.list_unmatched_cache(owner).await?.iter().map(ledger_side).collect();
        let document = document_side(&extraction);
        let match_options =
            MatchOptions { date_tolerance_days: options.date_tolerance_days, max_results: options.max_results };
        let scored = match_candidates(&document, &candidates, match_options);

        let mut summary = RunSummary { phase: RunPhase::Proposing, ..RunSummary::default() };
        if !scored.is_empty() {
            summary.matched_documents = 1;
        }
        for candidate in &scored {
            let firefly_id = parse_firefly_id(&candidate.firefly_id)?;
            if options.dry_run {
                summary.proposals_created += 1;
                continue;
            }
            self.store
                .create_match_proposal(MatchProposalRow {
                    id: 0,
                    firefly_id,
                    document_id: document_id.to_string(),
                    match_score: candidate.total,
                    match_reasons: candidate.reasons.clone(),
                    status: ProposalStatus::Pending,
                    created_at: Utc::now(),
                    reviewed_at: None,
                    owner_user_id: owner.map(str::to_string),
                })
                .await?;
            summary.proposals_created += 1;
        }
        summary.phase = RunPhase::Completed;
        Ok(summary)
    }

    /// Creates a brand-new ledger transaction from a document's proposal,
    /// the one path that creates rather than links — it bypasses the
    /// bank-first default entirely because `run` never calls
    /// `create_transaction` itself.
    pub async fn create_manual_transaction(
        &self,
        owner: OwnerFilter<'_>,
        document_id: &str,
        default_source_account: Option<&str>,
    ) -> ReconcileResult<CreateOutcome> {
        let extraction = self
            .store
            .get_extraction_by_document(document_id, owner)
            .await?
            .ok_or_else(|| ReconcileError::Validation(format!("no extraction for document {document_id}")))?;

        let ctx = PayloadContext {
            overall_confidence: extraction.overall_confidence,
            review_state: review_state_label(extraction.review_state),
            default_source_account,
        };
        let payload = build_payload(&extraction.record, &ctx)?;
        let outcome = self.ledger.create_transaction(payload).await?;

        if let CreateOutcome::Created(transaction_group_id) = &outcome {
            self.store
                .create_interpretation_run(InterpretationRunRow {
                    id: 0,
                    document_id: document_id.to_string(),
                    firefly_id: None,
                    external_id: Some(extraction.record.proposal.external_id.clone()),
                    run_timestamp: Utc::now(),
                    duration_ms: 0,
                    pipeline_version: env!("CARGO_PKG_VERSION").to_string(),
                    algorithm_version: "reconcile-v1".to_string(),
                    inputs_summary: serde_json::json!({ "transaction_group_id": transaction_group_id }),
                    rules_applied: vec!["manual_create".to_string()],
                    llm_result: None,
                    final_state: FinalState::ManualCreated,
                    decision_source: DecisionSource::User,
                    auto_applied: false,
                    firefly_write_action: Some("create_transaction".to_string()),
                    firefly_target_id: None,
                    linkage_marker_written: None,
                    owner_user_id: owner.map(str::to_string),
                })
                .await?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use lk_ledger_client::{MockLedgerClient, TransactionGroupPayload, TransactionSplit};
    use lk_record::{CanonicalRecord, Classification, Document, FieldConfidence, LineItem, Proposal, Provenance, TransactionType};
    use lk_store::{ExtractionRow, SqliteStore};
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample_document(document_id: &str) -> Document {
        let now = Utc::now();
        Document {
            document_id: document_id.to_string(),
            source_hash: "hash".into(),
            title: "Invoice".into(),
            document_type: "invoice".into(),
            correspondent: "Acme".into(),
            tags: vec![],
            first_seen: now,
            last_seen: now,
        }
    }

    fn sample_record(document_id: &str, amount: &str, date: NaiveDate, vendor: &str) -> CanonicalRecord {
        CanonicalRecord {
            document_id: document_id.to_string(),
            source_hash: "hash".into(),
            document_url: "https://dms.local/doc/1".into(),
            raw_text: "raw".into(),
            proposal: Proposal {
                transaction_type: TransactionType::Withdrawal,
                date,
                amount: Money::parse(amount).expect("valid fixture amount"),
                currency: "EUR".into(),
                description: "Acme invoice".into(),
                source_account: Some("Checking".into()),
                destination_account: Some(vendor.into()),
                category: None,
                tags: vec![],
                notes: None,
                external_id: format!("deadbeefdeadbeef:pl:{document_id}"),
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
                total: Some(Money::parse(amount).expect("valid fixture amount")),
                tax_rate: None,
                position: 0,
            }],
        }
    }

    fn sample_extraction_row(document_id: &str, record: CanonicalRecord) -> ExtractionRow {
        ExtractionRow {
            id: format!("ext-{document_id}"),
            document_id: document_id.to_string(),
            external_id: record.proposal.external_id.clone(),
            record,
            overall_confidence: 0.92,
            review_state: ReviewState::Auto,
            created_at: Utc::now(),
            reviewed_at: None,
            review_decision: None,
            llm_opt_out: false,
            owner_user_id: None,
        }
    }

    async fn seed_document(store: &SqliteStore, document_id: &str, amount: &str, date: NaiveDate, vendor: &str) {
        store.upsert_document(sample_document(document_id), None).await.expect("upsert document");
        let record = sample_record(document_id, amount, date, vendor);
        store.save_extraction(sample_extraction_row(document_id, record)).await.expect("save extraction");
    }

    async fn orchestrator() -> (Arc<SqliteStore>, Arc<MockLedgerClient>, ReconciliationOrchestrator<SqliteStore, MockLedgerClient>) {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open in-memory store"));
        let ledger = MockLedgerClient::shared();
        let orchestrator = ReconciliationOrchestrator::new(store.clone(), ledger.clone());
        (store, ledger, orchestrator)
    }

    async fn seed_remote_transaction(ledger: &MockLedgerClient, amount: &str, date: NaiveDate, vendor: &str) -> String {
        let split = TransactionSplit {
            transaction_type: Some(lk_ledger_client::TransactionType::Withdrawal),
            date: Some(date),
            amount: Some(amount.to_string()),
            description: Some("Acme invoice".to_string()),
            source_name: Some("Checking".to_string()),
            destination_name: Some(vendor.to_string()),
            ..Default::default()
        };
        let outcome = ledger
            .create_transaction(TransactionGroupPayload::new(vec![split]))
            .await
            .expect("seed remote transaction");
        let CreateOutcome::Created(id) = outcome else {
            panic!("expected created outcome");
        };
        id
    }

    #[tokio::test]
    async fn concurrent_runs_for_same_owner_are_rejected() {
        let (_store, _ledger, orchestrator) = orchestrator().await;
        let lock = orchestrator.owner_lock(None);
        let _guard = lock.try_lock().expect("acquire test lock");

        let result = orchestrator.run(None, ReconcileOptions::default()).await;
        assert!(matches!(result, Err(ReconcileError::AlreadyRunning)));
    }

    #[tokio::test]
    async fn run_creates_proposals_for_scored_candidates() {
        let (store, ledger, orchestrator) = orchestrator().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).expect("valid fixture date");
        seed_document(&store, "doc-1", "50.00", date, "Coffee Shop").await;
        seed_remote_transaction(&ledger, "50.00", date + chrono::Duration::days(6), "Unrelated Vendor").await;

        let summary = orchestrator.run(None, ReconcileOptions::default()).await.expect("run ok");
        assert_eq!(summary.phase, RunPhase::Completed);
        assert_eq!(summary.matched_documents, 1);
        assert_eq!(summary.proposals_created, 1);
        assert_eq!(summary.auto_linked, 0);
    }

    #[tokio::test]
    async fn run_auto_links_single_qualifying_candidate() {
        let (store, ledger, orchestrator) = orchestrator().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).expect("valid fixture date");
        seed_document(&store, "doc-1", "99.99", date, "Amazon").await;
        let transaction_group_id = seed_remote_transaction(&ledger, "99.99", date, "Amazon").await;

        let summary = orchestrator.run(None, ReconcileOptions::default()).await.expect("run ok");
        assert_eq!(summary.auto_linked, 1);
        assert_eq!(summary.ambiguous, 0);

        let transaction = ledger.get_transaction(&transaction_group_id).await.expect("ok").expect("present");
        assert_eq!(transaction.internal_reference.as_deref(), Some("PAPERLESS:doc-1"));

        let cache = store.list_cache_matched_to_document("doc-1", None).await.expect("list cache");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache[0].match_status, MatchStatus::Matched);
    }

    #[tokio::test]
    async fn reject_updates_proposal_without_calling_ledger() {
        let (store, ledger, orchestrator) = orchestrator().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).expect("valid fixture date");
        seed_document(&store, "doc-1", "50.00", date, "Coffee Shop").await;
        let transaction_group_id =
            seed_remote_transaction(&ledger, "50.00", date + chrono::Duration::days(6), "Unrelated Vendor").await;

        orchestrator.run(None, ReconcileOptions::default()).await.expect("run ok");
        let pending = store.list_pending_proposals(None).await.expect("list proposals");
        assert_eq!(pending.len(), 1);

        orchestrator.reject(None, pending[0].id).await.expect("reject ok");

        let remaining = store.list_pending_proposals(None).await.expect("list proposals");
        assert!(remaining.is_empty());
        let transaction = ledger.get_transaction(&transaction_group_id).await.expect("ok").expect("present");
        assert!(transaction.internal_reference.is_none());
    }

    #[tokio::test]
    async fn rerun_interpretation_unmatches_and_rescores() {
        let (store, ledger, orchestrator) = orchestrator().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).expect("valid fixture date");
        seed_document(&store, "doc-1", "99.99", date, "Amazon").await;
        seed_remote_transaction(&ledger, "99.99", date, "Amazon").await;
        orchestrator.run(None, ReconcileOptions::default()).await.expect("run ok");
        assert_eq!(store.list_cache_matched_to_document("doc-1", None).await.expect("ok").len(), 1);

        let summary = orchestrator
            .rerun_interpretation(None, "doc-1", ReconcileOptions::default())
            .await
            .expect("rerun ok");
        assert_eq!(summary.proposals_created, 1);
        assert!(store.list_cache_matched_to_document("doc-1", None).await.expect("ok").is_empty());
        assert_eq!(store.list_unmatched_cache(None).await.expect("ok").len(), 1);
    }

    #[tokio::test]
    async fn sync_ledger_cache_upserts_from_remote_transactions() {
        let store = SqliteStore::open_in_memory().expect("open in-memory store");
        let ledger = MockLedgerClient::shared();
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).expect("valid fixture date");
        seed_remote_transaction(&ledger, "12.00", date, "Coffee Shop").await;

        let synced = sync::sync_ledger_cache(ledger.as_ref(), &store, None, true).await.expect("sync ok");
        assert_eq!(synced, 1);
        let cached = store.list_unmatched_cache(None).await.expect("list cache");
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].destination_account.as_deref(), Some("Coffee Shop"));
    }

    #[tokio::test]
    async fn create_manual_transaction_bypasses_bank_first() {
        let (store, ledger, orchestrator) = orchestrator().await;
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).expect("valid fixture date");
        seed_document(&store, "doc-1", "20.00", date, "Coffee Shop").await;

        let outcome = orchestrator
            .create_manual_transaction(None, "doc-1", Some("Checking"))
            .await
            .expect("manual create ok");
        assert!(matches!(outcome, CreateOutcome::Created(_)));

        let runs = store.list_runs_for_document("doc-1").await.expect("list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].final_state, FinalState::ManualCreated);
        let _ = &ledger;
    }
}
