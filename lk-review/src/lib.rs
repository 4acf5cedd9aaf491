#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use lk_record::{CanonicalRecord, FieldConfidence, Money, RecordError};
use lk_store::{ExtractionRow, OwnerFilter, ReviewDecision, ReviewState, StateStore, StoreError, StoreResult};
use thiserror::Error;
use tracing::warn;

pub type ReviewResult<T> = Result<T, ReviewError>;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    pub auto_overall: f32,
    pub auto_amount: f32,
    pub auto_date: f32,
    pub review_overall: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            auto_overall: 0.85,
            auto_amount: 0.70,
            auto_date: 0.60,
            review_overall: 0.60,
        }
    }
}

/// Multiplier applied to OCR-derived field confidences before
/// classification: an OCR strategy's raw confidence is rescaled around a
/// 0.50 baseline (`raw / 0.50`, clamped to 1.0) so that OCR output isn't
/// systematically under- or over-confident relative to structured/
/// text-layer extractions.
const OCR_BASELINE: f32 = 0.50;

#[must_use]
pub fn rescale_for_strategy(field_confidence: FieldConfidence, strategy_name: &str) -> FieldConfidence {
    if !strategy_name.contains("ocr") {
        return field_confidence;
    }
    let rescale = |value: f32| (value / OCR_BASELINE).min(1.0);
    FieldConfidence {
        amount: rescale(field_confidence.amount),
        date: rescale(field_confidence.date),
        vendor: rescale(field_confidence.vendor),
        description: rescale(field_confidence.description),
        currency: rescale(field_confidence.currency),
    }
}

#[must_use]
pub fn overall_confidence(field_confidence: &FieldConfidence) -> f32 {
    let remaining = (field_confidence.description + field_confidence.currency) / 2.0;
    0.40 * field_confidence.amount + 0.30 * field_confidence.date + 0.20 * field_confidence.vendor + 0.10 * remaining
}

/// AUTO requires the overall score and the amount/date signals to all
/// clear their own floors; REVIEW only needs the overall floor; anything
/// below that is MANUAL.
#[must_use]
pub fn classify(field_confidence: &FieldConfidence, thresholds: Thresholds) -> (ReviewState, f32) {
    let overall = overall_confidence(field_confidence);
    let state = if overall >= thresholds.auto_overall
        && field_confidence.amount >= thresholds.auto_amount
        && field_confidence.date >= thresholds.auto_date
    {
        ReviewState::Auto
    } else if overall >= thresholds.review_overall {
        ReviewState::Review
    } else {
        ReviewState::Manual
    };
    (state, overall)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    InvalidDate { field: &'static str },
    MissingField { field: &'static str },
    AmountOutOfRange { amount: Money },
    OverallFieldInconsistency { overall: String, amount_confidence: String },
}

const MAX_REASONABLE_AMOUNT_MINOR: i64 = 1_000_000_00;

/// Flags invalid dates, missing required fields, implausibly large
/// amounts, and overall-vs-field-confidence inconsistencies. Does not
/// reject the record; callers decide what to do with the issues.
#[must_use]
pub fn validate(record: &CanonicalRecord) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let today = Utc::now().date_naive();
    if record.proposal.date > today {
        issues.push(ValidationIssue::InvalidDate { field: "date" });
    }
    if let Some(due_date) = record.proposal.due_date
        && due_date < record.proposal.date - chrono::Duration::days(3650)
    {
        issues.push(ValidationIssue::InvalidDate { field: "due_date" });
    }
    if record.proposal.description.trim().is_empty() {
        issues.push(ValidationIssue::MissingField { field: "description" });
    }
    if record.proposal.destination_account.is_none() && record.proposal.source_account.is_none() {
        issues.push(ValidationIssue::MissingField { field: "destination_account" });
    }
    if record.proposal.amount.minor_units() > MAX_REASONABLE_AMOUNT_MINOR {
        issues.push(ValidationIssue::AmountOutOfRange { amount: record.proposal.amount });
    }
    let overall = overall_confidence(&record.field_confidence);
    if overall > 0.80 && record.field_confidence.amount < 0.30 {
        issues.push(ValidationIssue::OverallFieldInconsistency {
            overall: format!("{overall:.2}"),
            amount_confidence: format!("{:.2}", record.field_confidence.amount),
        });
    }
    issues
}

/// A single-field edit applied during manual review. Editing amount or
/// date requires regenerating the external-id afterward.
#[derive(Debug, Clone)]
pub enum FieldEdit {
    Amount(Money),
    Date(NaiveDate),
    Description(String),
    DestinationAccount(Option<String>),
    SourceAccount(Option<String>),
    Category(Option<String>),
    Currency(String),
    InvoiceNumber(Option<String>),
}

/// Applies `edits` to `record` in order, regenerating the external-id
/// once if any edit touched amount or date.
pub fn apply_edits(record: &mut CanonicalRecord, edits: &[FieldEdit]) {
    let mut regenerate = false;
    for edit in edits {
        match edit {
            FieldEdit::Amount(amount) => {
                record.proposal.amount = *amount;
                regenerate = true;
            }
            FieldEdit::Date(date) => {
                record.proposal.date = *date;
                regenerate = true;
            }
            FieldEdit::Description(description) => record.proposal.description = description.clone(),
            FieldEdit::DestinationAccount(value) => record.proposal.destination_account = value.clone(),
            FieldEdit::SourceAccount(value) => record.proposal.source_account = value.clone(),
            FieldEdit::Category(value) => record.proposal.category = value.clone(),
            FieldEdit::Currency(currency) => record.proposal.currency = currency.clone(),
            FieldEdit::InvoiceNumber(value) => record.proposal.invoice_number = value.clone(),
        }
    }
    if regenerate {
        record.regenerate_external_id();
    }
}

/// Returns the category with the largest summed amount across `splits`,
/// ties broken by first occurrence.
#[must_use]
pub fn weighted_category(splits: &[(String, Money)]) -> Option<&str> {
    let mut totals: Vec<(&str, i64)> = Vec::new();
    for (category, amount) in splits {
        match totals.iter_mut().find(|(name, _)| *name == category.as_str()) {
            Some((_, total)) => *total += amount.minor_units(),
            None => totals.push((category.as_str(), amount.minor_units())),
        }
    }
    let mut best: Option<(&str, i64)> = None;
    for (name, total) in totals {
        if best.is_none_or(|(_, best_total)| total > best_total) {
            best = Some((name, total));
        }
    }
    best.map(|(name, _)| name)
}

/// Orchestrates the manual-review surface over a `StateStore`: list
/// pending extractions, load one, record a decision, or apply edits.
pub struct ReviewWorkflow<S: StateStore> {
    store: Arc<S>,
}

impl<S: StateStore> ReviewWorkflow<S> {
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn pending(&self, owner: OwnerFilter<'_>) -> StoreResult<Vec<ExtractionRow>> {
        self.store.list_extractions_for_review(owner).await
    }

    pub async fn load(&self, document_id: &str, owner: OwnerFilter<'_>) -> StoreResult<Option<ExtractionRow>> {
        self.store.get_extraction_by_document(document_id, owner).await
    }

    pub async fn record_decision(
        &self,
        extraction_id: &str,
        decision: ReviewDecision,
        rewritten_record: Option<CanonicalRecord>,
    ) -> ReviewResult<()> {
        if matches!(decision, ReviewDecision::Edited) && rewritten_record.is_none() {
            return Err(ReviewError::Validation("EDITED decision requires a rewritten record".into()));
        }
        self.store.update_extraction_review(extraction_id, decision, rewritten_record).await?;
        Ok(())
    }

    pub async fn apply_edits(
        &self,
        extraction_id: &str,
        mut record: CanonicalRecord,
        edits: &[FieldEdit],
    ) -> ReviewResult<CanonicalRecord> {
        if edits.is_empty() {
            warn!(extraction_id, "apply_edits called with no edits");
        }
        apply_edits(&mut record, edits);
        self.store
            .update_extraction_review(extraction_id, ReviewDecision::Edited, Some(record.clone()))
            .await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lk_store::SqliteStore;
    use pretty_assertions::assert_eq;

    fn field_confidence(amount: f32, date: f32, vendor: f32) -> FieldConfidence {
        FieldConfidence { amount, date, vendor, description: 0.8, currency: 0.8 }
    }

    #[test]
    fn classify_auto_requires_amount_and_date_floors_too() {
        let thresholds = Thresholds::default();
        let (state, _) = classify(&field_confidence(0.95, 0.95, 0.95), thresholds);
        assert_eq!(state, ReviewState::Auto);

        let (state, _) = classify(&field_confidence(0.95, 0.40, 0.95), thresholds);
        assert_eq!(state, ReviewState::Review);
    }

    #[test]
    fn classify_below_review_floor_is_manual() {
        let thresholds = Thresholds::default();
        let (state, _) = classify(&field_confidence(0.1, 0.1, 0.1), thresholds);
        assert_eq!(state, ReviewState::Manual);
    }

    #[test]
    fn ocr_rescale_divides_by_baseline_and_clamps() {
        let fc = field_confidence(0.40, 0.30, 0.20);
        let rescaled = rescale_for_strategy(fc, "ocr_heuristics");
        assert!((rescaled.amount - 0.80).abs() < 1e-6);

        let fc = field_confidence(0.90, 0.90, 0.90);
        let rescaled = rescale_for_strategy(fc, "ocr_heuristics");
        assert_eq!(rescaled.amount, 1.0);

        let fc = field_confidence(0.40, 0.30, 0.20);
        let untouched = rescale_for_strategy(fc, "text_layer");
        assert_eq!(untouched.amount, 0.40);
    }

    #[test]
    fn weighted_category_picks_largest_summed_total() {
        let splits = vec![
            ("travel".to_string(), Money::from_minor(500).expect("valid")),
            ("meals".to_string(), Money::from_minor(200).expect("valid")),
            ("travel".to_string(), Money::from_minor(400).expect("valid")),
        ];
        assert_eq!(weighted_category(&splits), Some("travel"));
    }

    #[test]
    fn weighted_category_ties_keep_first_occurrence() {
        let splits = vec![
            ("a".to_string(), Money::from_minor(500).expect("valid")),
            ("b".to_string(), Money::from_minor(500).expect("valid")),
        ];
        assert_eq!(weighted_category(&splits), Some("a"));
    }

    #[tokio::test]
    async fn review_workflow_lists_pending_extractions() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let workflow = ReviewWorkflow::new(Arc::clone(&store));
        let pending = workflow.pending(None).await.expect("pending");
        assert_eq!(pending.len(), 0);
    }
}
