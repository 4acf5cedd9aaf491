#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::NaiveDate;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

pub type DocumentId = String;
pub type ExtractionId = String;

pub type RecordResult<T> = Result<T, RecordError>;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("malformed external-id: {0}")]
    MalformedExternalId(String),
}

/// A monetary amount stored as integer minor units (cents), never negative.
///
/// Spec requires amounts stored to the ledger to be strictly positive and
/// quantised to two fractional digits using banker's round-half-up; minor
/// units sidestep binary-float drift entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Money(i64);

impl Money {
    pub fn from_minor(minor: i64) -> RecordResult<Self> {
        if minor <= 0 {
            return Err(RecordError::Validation(
                "amount must be strictly positive".into(),
            ));
        }
        Ok(Self(minor))
    }

    #[must_use]
    pub fn minor_units(self) -> i64 {
        self.0
    }

    /// Parses a decimal string like `"11.48"` or `"11"`, banker's
    /// round-half-up to two fractional digits.
    pub fn parse(value: &str) -> RecordResult<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(RecordError::Validation("amount must be provided".into()));
        }
        let negative = trimmed.starts_with('-');
        let digits = trimmed.trim_start_matches(['-', '+']).replace(',', "");
        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits.as_str(), ""),
        };
        let whole: i64 = whole
            .parse()
            .map_err(|_| RecordError::Validation(format!("invalid amount: {value}")))?;
        let minor = if frac.len() <= 2 {
            let scale = 10i64.pow(2 - frac.len() as u32);
            let frac_val: i64 = if frac.is_empty() {
                0
            } else {
                frac.parse()
                    .map_err(|_| RecordError::Validation(format!("invalid amount: {value}")))?
            };
            whole * 100 + frac_val * scale
        } else {
            // Round-half-up on the third fractional digit and beyond.
            let kept: String = frac.chars().take(3).collect();
            let micro: i64 = kept
                .parse()
                .map_err(|_| RecordError::Validation(format!("invalid amount: {value}")))?;
            let rounded = (micro + 5) / 10;
            whole * 100 + rounded
        };
        if negative {
            return Err(RecordError::Validation(
                "amount must be strictly positive".into(),
            ));
        }
        Self::from_minor(minor)
    }

    /// Canonical decimal form used in external-id derivation: dot
    /// separator, exactly two fractional digits, no thousands grouping.
    #[must_use]
    pub fn canonical(self) -> String {
        format!("{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl TryFrom<String> for Money {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Money::parse(&value)
    }
}

impl From<Money> for String {
    fn from(value: Money) -> Self {
        value.canonical()
    }
}

/// Deterministic dedup key for a proposal, in either of the two formats
/// the pipeline must be able to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalId {
    V2 {
        hash16: String,
        document_id: DocumentId,
    },
    Legacy {
        document_id: DocumentId,
        hash16: String,
        amount: String,
        date: String,
    },
}

impl ExternalId {
    #[must_use]
    pub fn document_id(&self) -> &str {
        match self {
            ExternalId::V2 { document_id, .. } | ExternalId::Legacy { document_id, .. } => {
                document_id
            }
        }
    }

    /// Derives the v2 external-id. All new writes use this form.
    #[must_use]
    pub fn derive_v2(
        amount: Money,
        date: NaiveDate,
        source: Option<&str>,
        destination: Option<&str>,
        document_id: &str,
    ) -> Self {
        let hash16 = hash16_of(
            amount.canonical(),
            date.format("%Y-%m-%d").to_string(),
            source.unwrap_or_default(),
            destination.unwrap_or_default(),
        );
        ExternalId::V2 {
            hash16,
            document_id: document_id.to_string(),
        }
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalId::V2 {
                hash16,
                document_id,
            } => write!(f, "{hash16}:pl:{document_id}"),
            ExternalId::Legacy {
                document_id,
                hash16,
                amount,
                date,
            } => write!(f, "paperless:{document_id}:{hash16}:{amount}:{date}"),
        }
    }
}

impl FromStr for ExternalId {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("paperless:") {
            let mut parts = rest.splitn(4, ':');
            let document_id = parts
                .next()
                .ok_or_else(|| RecordError::MalformedExternalId(s.into()))?;
            let hash16 = parts
                .next()
                .ok_or_else(|| RecordError::MalformedExternalId(s.into()))?;
            let amount = parts
                .next()
                .ok_or_else(|| RecordError::MalformedExternalId(s.into()))?;
            let date = parts
                .next()
                .ok_or_else(|| RecordError::MalformedExternalId(s.into()))?;
            return Ok(ExternalId::Legacy {
                document_id: document_id.to_string(),
                hash16: hash16.to_string(),
                amount: amount.to_string(),
                date: date.to_string(),
            });
        }

        if let Some((hash16, rest)) = s.split_once(":pl:")
            && hash16.len() == 16
            && !rest.is_empty()
        {
            return Ok(ExternalId::V2 {
                hash16: hash16.to_string(),
                document_id: rest.to_string(),
            });
        }

        Err(RecordError::MalformedExternalId(s.into()))
    }
}

fn hash16_of(amount: String, date: String, source: &str, destination: &str) -> String {
    let joined = format!("{amount}|{date}|{source}|{destination}");
    let digest = Sha256::digest(joined.as_bytes());
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

/// Where a "Spark-linked" marker was recovered from on a ledger
/// transaction already carrying one of our linkage markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerSource {
    ExternalId,
    InternalReference,
    Notes,
}

/// Tries to recover a document-id from whichever linkage marker is
/// present, in fixed precedence order (external-id, then
/// internal-reference, then notes).
#[must_use]
pub fn recover_linked_document_id(
    external_id: Option<&str>,
    internal_reference: Option<&str>,
    notes: Option<&str>,
) -> Option<(DocumentId, MarkerSource)> {
    if let Some(raw) = external_id
        && let Ok(parsed) = ExternalId::from_str(raw)
    {
        return Some((parsed.document_id().to_string(), MarkerSource::ExternalId));
    }
    if let Some(reference) = internal_reference
        && let Some(doc_id) = reference.strip_prefix("PAPERLESS:")
        && !doc_id.is_empty()
    {
        return Some((doc_id.to_string(), MarkerSource::InternalReference));
    }
    if let Some(notes) = notes {
        for segment in notes.split(';') {
            let segment = segment.trim();
            if let Some(doc_id) = segment.strip_prefix("Paperless doc_id=")
                && !doc_id.is_empty()
            {
                return Some((doc_id.to_string(), MarkerSource::Notes));
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Withdrawal,
    Deposit,
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit_price: Option<Money>,
    pub total: Option<Money>,
    pub tax_rate: Option<f64>,
    pub position: usize,
}

impl LineItem {
    /// Amount used when building a split: `total` else `unit_price`.
    #[must_use]
    pub fn split_amount(&self) -> Option<Money> {
        self.total.or(self.unit_price)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: Option<String>,
    pub correspondent: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldConfidence {
    pub amount: f32,
    pub date: f32,
    pub vendor: f32,
    pub description: f32,
    pub currency: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source_system: String,
    pub parser_version: String,
    pub parsed_at: DateTime<Utc>,
    pub extraction_strategy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub transaction_type: TransactionType,
    pub date: NaiveDate,
    pub amount: Money,
    pub currency: String,
    pub description: String,
    pub source_account: Option<String>,
    pub destination_account: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub external_id: String,
    pub invoice_number: Option<String>,
    pub due_date: Option<NaiveDate>,
    pub tax_total: Option<Money>,
}

impl Proposal {
    pub fn validate(&self) -> RecordResult<()> {
        if self.description.trim().is_empty() {
            return Err(RecordError::Validation(
                "proposal description must be provided".into(),
            ));
        }
        if self.currency.trim().len() != 3
            || !self.currency.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(RecordError::Validation(format!(
                "currency must be a 3-letter ISO code: {}",
                self.currency
            )));
        }
        Ok(())
    }
}

/// The payload stored inside `Extraction.extraction_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub document_id: DocumentId,
    pub source_hash: String,
    pub document_url: String,
    pub raw_text: String,
    pub proposal: Proposal,
    pub field_confidence: FieldConfidence,
    pub provenance: Provenance,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl CanonicalRecord {
    /// Regenerates `proposal.external_id` from the current amount/date;
    /// callers invoke this whenever amount or date is edited.
    pub fn regenerate_external_id(&mut self) {
        let id = ExternalId::derive_v2(
            self.proposal.amount,
            self.proposal.date,
            self.proposal.source_account.as_deref(),
            self.proposal.destination_account.as_deref(),
            &self.document_id,
        );
        self.proposal.external_id = id.to_string();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub document_id: DocumentId,
    pub source_hash: String,
    pub title: String,
    pub document_type: String,
    pub correspondent: String,
    pub tags: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Document {
    /// Normalises a freshly-observed document: trims strings and dedupes
    /// tags case-insensitively, first occurrence wins.
    pub fn normalize(mut self) -> RecordResult<Self> {
        if self.document_id.trim().is_empty() {
            return Err(RecordError::Validation(
                "document_id must be provided".into(),
            ));
        }
        self.title = self.title.trim().to_string();
        self.document_type = self.document_type.trim().to_string();
        self.correspondent = self.correspondent.trim().to_string();

        let mut seen = std::collections::HashSet::new();
        self.tags = self
            .tags
            .into_iter()
            .map(|tag| tag.trim().to_string())
            .filter(|tag| !tag.is_empty())
            .filter(|tag| seen.insert(tag.to_ascii_lowercase()))
            .collect();

        Ok(self)
    }

    /// Merges a re-observation: only `last_seen` and metadata move
    /// forward, content is never rewritten by the core.
    pub fn observe_again(&mut self, observed_at: DateTime<Utc>) {
        self.last_seen = observed_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn money_parses_and_rounds_half_up() {
        assert_eq!(Money::parse("11.48").unwrap().minor_units(), 1148);
        assert_eq!(Money::parse("10").unwrap().minor_units(), 1000);
        assert_eq!(Money::parse("3.335").unwrap().minor_units(), 334);
        assert_eq!(Money::parse("1,234.50").unwrap().minor_units(), 123450);
    }

    #[test]
    fn money_rejects_non_positive() {
        assert!(Money::parse("-1.00").is_err());
        assert!(Money::parse("0").is_err());
    }

    #[test]
    fn deterministic_external_id_seed_scenario() {
        let amount = Money::parse("11.48").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 11, 18).unwrap();
        let first =
            ExternalId::derive_v2(amount, date, Some("checking"), Some("vendor"), "12345");
        let second =
            ExternalId::derive_v2(amount, date, Some("checking"), Some("vendor"), "12345");
        assert_eq!(first, second);
        let rendered = first.to_string();
        assert!(rendered.ends_with(":pl:12345"));
        assert_eq!(rendered.split(':').next().unwrap().len(), 16);
    }

    #[test]
    fn external_id_round_trips_through_display_and_parse() {
        let amount = Money::parse("99.99").unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap();
        let id = ExternalId::derive_v2(amount, date, None, Some("Amazon"), "doc-7");
        let rendered = id.to_string();
        let parsed: ExternalId = rendered.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn legacy_external_id_parses_read_only() {
        let parsed: ExternalId = "paperless:777:abcd1234abcd1234:10.00:2024-01-01"
            .parse()
            .unwrap();
        assert_eq!(parsed.document_id(), "777");
        match parsed {
            ExternalId::Legacy { hash16, .. } => assert_eq!(hash16, "abcd1234abcd1234"),
            ExternalId::V2 { .. } => panic!("expected legacy variant"),
        }
    }

    #[test]
    fn recovers_linked_document_id_in_precedence_order() {
        let amount = Money::parse("5.00").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let ext_id = ExternalId::derive_v2(amount, date, None, None, "doc-1").to_string();

        let (doc_id, source) =
            recover_linked_document_id(Some(&ext_id), Some("PAPERLESS:doc-2"), None).unwrap();
        assert_eq!(doc_id, "doc-1");
        assert_eq!(source, MarkerSource::ExternalId);

        let (doc_id, source) =
            recover_linked_document_id(None, Some("PAPERLESS:doc-2"), None).unwrap();
        assert_eq!(doc_id, "doc-2");
        assert_eq!(source, MarkerSource::InternalReference);

        let (doc_id, source) =
            recover_linked_document_id(None, None, Some("Paperless doc_id=doc-3; other=x"))
                .unwrap();
        assert_eq!(doc_id, "doc-3");
        assert_eq!(source, MarkerSource::Notes);

        assert!(recover_linked_document_id(None, None, None).is_none());
    }

    #[test]
    fn document_normalize_trims_and_dedupes_tags() {
        let doc = Document {
            document_id: "12345".into(),
            source_hash: "abc".into(),
            title: "  Invoice  ".into(),
            document_type: " invoice ".into(),
            correspondent: " ACME ".into(),
            tags: vec!["Retail".into(), "retail".into(), "".into(), " Q1 ".into()],
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
        .normalize()
        .unwrap();

        assert_eq!(doc.title, "Invoice");
        assert_eq!(doc.tags, vec!["Retail".to_string(), "Q1".to_string()]);
    }

    #[test]
    fn proposal_rejects_invalid_currency() {
        let proposal = Proposal {
            transaction_type: TransactionType::Withdrawal,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            amount: Money::parse("1.00").unwrap(),
            currency: "us".into(),
            description: "Coffee".into(),
            source_account: None,
            destination_account: None,
            category: None,
            tags: vec![],
            notes: None,
            external_id: String::new(),
            invoice_number: None,
            due_date: None,
            tax_total: None,
        };
        assert!(proposal.validate().is_err());
    }
}
