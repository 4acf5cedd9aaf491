#![deny(clippy::print_stdout, clippy::print_stderr)]

use lk_ledger_client::{AccountId, TransactionGroupPayload, TransactionSplit, internal_reference_for, notes_marker_for};
use lk_record::{CanonicalRecord, LineItem, Money, TransactionType};
use thiserror::Error;

pub type PayloadResult<T> = Result<T, PayloadError>;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("validation error: {0}")]
    Validation(String),
}

/// Amounts within one major unit of the proposal total are absorbed into
/// the last split rather than rejected.
const SPLIT_TOLERANCE_MINOR: i64 = 100;

/// Everything `build_payload` needs beyond the record itself: the
/// classification confidence and review outcome it must record in the
/// mandatory notes string, and the fallback account used when a
/// proposal leaves an asset-side account unset.
#[derive(Debug, Clone, Copy)]
pub struct PayloadContext<'a> {
    pub overall_confidence: f32,
    pub review_state: &'a str,
    pub default_source_account: Option<&'a str>,
}

fn map_transaction_type(transaction_type: TransactionType) -> lk_ledger_client::TransactionType {
    match transaction_type {
        TransactionType::Withdrawal => lk_ledger_client::TransactionType::Withdrawal,
        TransactionType::Deposit => lk_ledger_client::TransactionType::Deposit,
        TransactionType::Transfer => lk_ledger_client::TransactionType::Transfer,
    }
}

/// Resolves the asset-side and counterparty-side account names for a
/// split, following the spec's per-transaction-type fallback chains.
fn map_accounts(record: &CanonicalRecord, ctx: &PayloadContext<'_>) -> (AccountId, AccountId) {
    let proposal = &record.proposal;
    let correspondent = record.classification.as_ref().and_then(|c| c.correspondent.clone());
    let default_asset = || ctx.default_source_account.map(String::from);
    match proposal.transaction_type {
        TransactionType::Withdrawal => {
            let source = proposal.source_account.clone().or_else(default_asset).unwrap_or_else(|| "Unknown account".into());
            let destination = proposal
                .destination_account
                .clone()
                .or(correspondent)
                .unwrap_or_else(|| "Unknown Merchant".into());
            (source, destination)
        }
        TransactionType::Deposit => {
            let destination = proposal.destination_account.clone().or_else(default_asset).unwrap_or_else(|| "Unknown account".into());
            let source = proposal.source_account.clone().or(correspondent).unwrap_or_else(|| "Unknown Merchant".into());
            (source, destination)
        }
        TransactionType::Transfer => {
            let source = proposal.source_account.clone().or_else(default_asset).unwrap_or_else(|| "Unknown source account".into());
            let destination = proposal.destination_account.clone().unwrap_or_else(|| "Unknown destination account".into());
            (source, destination)
        }
    }
}

/// Builds the mandatory notes string: `Paperless doc_id=...;
/// source_hash=...; confidence=...; review_state=...`, plus `splits=N`
/// for multi-split groups, plus parser version and free-form notes.
fn build_notes(record: &CanonicalRecord, ctx: &PayloadContext<'_>, split_count: usize) -> String {
    let hash16 = record.source_hash.get(..16).unwrap_or(&record.source_hash);
    let mut notes = format!(
        "{}; source_hash={hash16}; confidence={:.2}; review_state={}",
        notes_marker_for(&record.document_id),
        ctx.overall_confidence,
        ctx.review_state,
    );
    if split_count > 1 {
        notes.push_str(&format!("; splits={split_count}"));
    }
    if !record.provenance.parser_version.trim().is_empty() {
        notes.push_str(&format!("; parser_version={}", record.provenance.parser_version));
    }
    if let Some(user_notes) = &record.proposal.notes
        && !user_notes.trim().is_empty()
    {
        notes.push_str(&format!("; {user_notes}"));
    }
    notes
}

fn tags_field(tags: &[String]) -> Option<Vec<String>> {
    if tags.is_empty() { None } else { Some(tags.to_vec()) }
}

fn required_fields_present(record: &CanonicalRecord) -> PayloadResult<()> {
    if record.document_id.trim().is_empty() {
        return Err(PayloadError::Validation("document_id must be provided".into()));
    }
    if record.proposal.description.trim().is_empty() {
        return Err(PayloadError::Validation("description must be provided".into()));
    }
    Ok(())
}

/// One synthetic split source: a description paired with the amount it
/// contributes before rounding absorption.
struct SplitSource {
    description: String,
    amount: Money,
}

/// Reduces a record to its split sources: one per positive line-item
/// amount when there are at least two line items, else a single source
/// carrying the whole proposal. There is no separate single-split code
/// path downstream of this; callers always iterate the returned list.
fn split_sources(record: &CanonicalRecord) -> PayloadResult<Vec<SplitSource>> {
    if record.line_items.len() < 2 {
        return Ok(vec![SplitSource {
            description: record.proposal.description.clone(),
            amount: record.proposal.amount,
        }]);
    }
    let mut items: Vec<&LineItem> = record.line_items.iter().collect();
    items.sort_by_key(|item| item.position);
    let mut sources: Vec<SplitSource> = items
        .into_iter()
        .filter_map(|item| item.split_amount().map(|amount| SplitSource { description: item.description.clone(), amount }))
        .collect();
    if sources.is_empty() {
        return Err(PayloadError::Validation("no line item produced a positive split amount".into()));
    }
    let split_sum: i64 = sources.iter().map(|source| source.amount.minor_units()).sum();
    let proposal_total = record.proposal.amount.minor_units();
    let diff = proposal_total - split_sum;
    if diff != 0 {
        if diff.abs() > SPLIT_TOLERANCE_MINOR {
            return Err(PayloadError::Validation(format!(
                "line item splits sum to {split_sum} minor units, proposal total is {proposal_total}, difference exceeds tolerance"
            )));
        }
        let last = sources.last_mut().expect("checked non-empty above");
        let absorbed = last.amount.minor_units() + diff;
        last.amount = Money::from_minor(absorbed)
            .map_err(|_| PayloadError::Validation("absorbing rounding residual produced a non-positive amount".into()))?;
    }
    Ok(sources)
}

fn base_split(
    record: &CanonicalRecord,
    ctx: &PayloadContext<'_>,
    transaction_type: lk_ledger_client::TransactionType,
    source_name: &str,
    destination_name: &str,
) -> TransactionSplit {
    TransactionSplit {
        transaction_type: Some(transaction_type),
        date: Some(record.proposal.date),
        amount: None,
        currency_code: Some(record.proposal.currency.clone()),
        description: None,
        source_name: Some(source_name.to_string()),
        destination_name: Some(destination_name.to_string()),
        category_name: record.proposal.category.clone(),
        tags: tags_field(&record.proposal.tags),
        order: None,
        external_id: None,
        internal_reference: None,
        notes: None,
        external_url: None,
        invoice_date: None,
        due_date: None,
        payment_date: None,
    }
}

/// Builds a ledger transaction group from a canonical record. Always
/// runs the split-aware path in `split_sources`; a record with fewer
/// than two line items produces exactly one split carrying the full
/// proposal amount, so there is no separate single-split code path here.
pub fn build_payload(record: &CanonicalRecord, ctx: &PayloadContext<'_>) -> PayloadResult<TransactionGroupPayload> {
    required_fields_present(record)?;
    if record.proposal.amount.minor_units() <= 0 {
        return Err(PayloadError::Validation("amount must be strictly positive".into()));
    }
    let transaction_type = map_transaction_type(record.proposal.transaction_type);
    let (source_name, destination_name) = map_accounts(record, ctx);
    let sources = split_sources(record)?;
    let split_count = sources.len();

    let splits = sources
        .into_iter()
        .enumerate()
        .map(|(index, source)| {
            let mut split = base_split(record, ctx, transaction_type, &source_name, &destination_name);
            split.amount = Some(source.amount.canonical());
            split.description = Some(source.description);
            split.order = Some(index as u32 + 1);
            if index == 0 {
                split.external_id = Some(record.proposal.external_id.clone());
                split.internal_reference = Some(internal_reference_for(&record.document_id));
                split.notes = Some(build_notes(record, ctx, split_count));
                split.invoice_date = Some(record.proposal.date);
                split.due_date = record.proposal.due_date;
            }
            split
        })
        .collect();

    Ok(TransactionGroupPayload::new(splits))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    MissingField { field: &'static str },
    SplitSumMismatch { expected_minor: i64, actual_minor: i64 },
}

/// A lighter validation pass than the review workflow's: required fields
/// and a diagnostic (non-rejecting) split-sum check.
#[must_use]
pub fn validate(record: &CanonicalRecord) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    if record.document_id.trim().is_empty() {
        issues.push(ValidationIssue::MissingField { field: "document_id" });
    }
    if record.proposal.description.trim().is_empty() {
        issues.push(ValidationIssue::MissingField { field: "description" });
    }
    if record.line_items.len() >= 2 {
        let sum: i64 = record.line_items.iter().filter_map(LineItem::split_amount).map(Money::minor_units).sum();
        let expected = record.proposal.amount.minor_units();
        if sum != expected {
            issues.push(ValidationIssue::SplitSumMismatch { expected_minor: expected, actual_minor: sum });
        }
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lk_record::{Classification, FieldConfidence, Proposal, Provenance};
    use pretty_assertions::assert_eq;

    fn base_record() -> CanonicalRecord {
        CanonicalRecord {
            document_id: "doc-1".into(),
            source_hash: "abcdef0123456789abcdef0123456789".into(),
            document_url: "https://dms.example/doc/doc-1".into(),
            raw_text: "invoice".into(),
            proposal: Proposal {
                transaction_type: TransactionType::Withdrawal,
                date: NaiveDate::from_ymd_opt(2026, 1, 15).expect("valid date"),
                amount: Money::from_minor(10_000).expect("valid"),
                currency: "USD".into(),
                description: "Office supplies".into(),
                source_account: None,
                destination_account: Some("Staples".into()),
                category: Some("Supplies".into()),
                tags: vec!["reimbursable".into()],
                notes: None,
                external_id: "ext-1".into(),
                invoice_number: None,
                due_date: None,
                tax_total: None,
            },
            field_confidence: FieldConfidence { amount: 0.9, date: 0.9, vendor: 0.9, description: 0.9, currency: 0.9 },
            provenance: Provenance {
                source_system: "paperless".into(),
                parser_version: "v3".into(),
                parsed_at: chrono::Utc::now(),
                extraction_strategy: "text_layer".into(),
            },
            classification: Some(Classification { category: Some("Supplies".into()), correspondent: Some("Staples Inc".into()) }),
            line_items: Vec::new(),
        }
    }

    fn ctx<'a>() -> PayloadContext<'a> {
        PayloadContext { overall_confidence: 0.91, review_state: "AUTO", default_source_account: Some("Checking") }
    }

    #[test]
    fn single_split_carries_all_linkage_fields() {
        let record = base_record();
        let payload = build_payload(&record, &ctx()).expect("build");
        assert_eq!(payload.transactions.len(), 1);
        let split = &payload.transactions[0];
        assert_eq!(split.amount.as_deref(), Some("100.00"));
        assert_eq!(split.source_name.as_deref(), Some("Checking"));
        assert_eq!(split.destination_name.as_deref(), Some("Staples"));
        assert_eq!(split.external_id.as_deref(), Some("ext-1"));
        assert_eq!(split.internal_reference.as_deref(), Some("PAPERLESS:doc-1"));
        let notes = split.notes.as_deref().expect("notes");
        assert!(notes.contains("Paperless doc_id=doc-1"));
        assert!(notes.contains("source_hash=abcdef0123456789"));
        assert!(notes.contains("confidence=0.91"));
        assert!(notes.contains("review_state=AUTO"));
        assert!(!notes.contains("splits="));
    }

    #[test]
    fn withdrawal_falls_back_to_unknown_merchant_with_no_destination_or_correspondent() {
        let mut record = base_record();
        record.proposal.destination_account = None;
        record.classification = None;
        let payload = build_payload(&record, &ctx()).expect("build");
        assert_eq!(payload.transactions[0].destination_name.as_deref(), Some("Unknown Merchant"));
    }

    #[test]
    fn deposit_swaps_asset_and_counterparty_roles() {
        let mut record = base_record();
        record.proposal.transaction_type = TransactionType::Deposit;
        record.proposal.destination_account = None;
        record.proposal.source_account = Some("Customer Inc".into());
        let payload = build_payload(&record, &ctx()).expect("build");
        let split = &payload.transactions[0];
        assert_eq!(split.destination_name.as_deref(), Some("Checking"));
        assert_eq!(split.source_name.as_deref(), Some("Customer Inc"));
    }

    #[test]
    fn multi_split_puts_linkage_only_on_first_split() {
        let mut record = base_record();
        record.proposal.amount = Money::from_minor(15_000).expect("valid");
        record.line_items = vec![
            LineItem {
                description: "Paper".into(),
                quantity: Some(1.0),
                unit_price: None,
                total: Some(Money::from_minor(10_000).expect("valid")),
                tax_rate: None,
                position: 0,
            },
            LineItem {
                description: "Toner".into(),
                quantity: Some(1.0),
                unit_price: None,
                total: Some(Money::from_minor(5_000).expect("valid")),
                tax_rate: None,
                position: 1,
            },
        ];
        let payload = build_payload(&record, &ctx()).expect("build");
        assert_eq!(payload.transactions.len(), 2);
        assert!(payload.transactions[0].external_id.is_some());
        assert!(payload.transactions[1].external_id.is_none());
        assert!(payload.transactions[0].notes.as_deref().expect("notes").contains("splits=2"));
        assert_eq!(payload.transactions[0].order, Some(1));
        assert_eq!(payload.transactions[1].order, Some(2));
    }

    #[test]
    fn multi_split_absorbs_small_rounding_residual_into_last_split() {
        let mut record = base_record();
        record.proposal.amount = Money::from_minor(15_001).expect("valid");
        record.line_items = vec![
            LineItem { description: "A".into(), quantity: None, unit_price: None, total: Some(Money::from_minor(10_000).expect("valid")), tax_rate: None, position: 0 },
            LineItem { description: "B".into(), quantity: None, unit_price: None, total: Some(Money::from_minor(5_000).expect("valid")), tax_rate: None, position: 1 },
        ];
        let payload = build_payload(&record, &ctx()).expect("build");
        assert_eq!(payload.transactions[1].amount.as_deref(), Some("50.01"));
    }

    #[test]
    fn multi_split_fails_loudly_when_residual_exceeds_tolerance() {
        let mut record = base_record();
        record.proposal.amount = Money::from_minor(20_000).expect("valid");
        record.line_items = vec![
            LineItem { description: "A".into(), quantity: None, unit_price: None, total: Some(Money::from_minor(10_000).expect("valid")), tax_rate: None, position: 0 },
            LineItem { description: "B".into(), quantity: None, unit_price: None, total: Some(Money::from_minor(5_000).expect("valid")), tax_rate: None, position: 1 },
        ];
        let result = build_payload(&record, &ctx());
        assert!(result.is_err());
    }

    #[test]
    fn validate_flags_split_sum_mismatch_without_rejecting() {
        let mut record = base_record();
        record.proposal.amount = Money::from_minor(20_000).expect("valid");
        record.line_items = vec![
            LineItem { description: "A".into(), quantity: None, unit_price: None, total: Some(Money::from_minor(10_000).expect("valid")), tax_rate: None, position: 0 },
            LineItem { description: "B".into(), quantity: None, unit_price: None, total: Some(Money::from_minor(5_000).expect("valid")), tax_rate: None, position: 1 },
        ];
        let issues = validate(&record);
        assert_eq!(
            issues,
            vec![ValidationIssue::SplitSumMismatch { expected_minor: 20_000, actual_minor: 15_000 }]
        );
    }

    #[test]
    fn build_rejects_empty_description() {
        let mut record = base_record();
        record.proposal.description = "   ".into();
        assert!(build_payload(&record, &ctx()).is_err());
    }
}
