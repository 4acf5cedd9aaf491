#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::BTreeSet;

use chrono::NaiveDate;
use lk_record::Money;
use thiserror::Error;

pub type FireflyId = String;
pub type DocumentId = String;

pub type MatchResult<T> = Result<T, MatchError>;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("validation error: {0}")]
    Validation(String),
}

const WEIGHT_AMOUNT: f32 = 0.40;
const WEIGHT_DATE: f32 = 0.25;
const WEIGHT_DESCRIPTION: f32 = 0.20;
const WEIGHT_VENDOR: f32 = 0.15;

const DEFAULT_DATE_TOLERANCE_DAYS: i64 = 7;
const DEFAULT_MAX_RESULTS: usize = 5;
const DISCARD_BELOW: f32 = 0.20;
const EXACT_MATCH_FLOOR: f32 = 0.99;

/// The document-side half of a candidate pair.
#[derive(Debug, Clone)]
pub struct DocumentSide {
    pub document_id: DocumentId,
    pub amount: Option<Money>,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
    /// `proposal.destination_account`, falling back to `correspondent`.
    pub vendor: Option<String>,
    pub source_account: Option<String>,
}

/// The ledger-cache-side half of a candidate pair.
#[derive(Debug, Clone)]
pub struct LedgerSide {
    pub firefly_id: FireflyId,
    pub amount: Option<Money>,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
    pub destination_name: Option<String>,
    pub source_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SignalBreakdown {
    pub amount: f32,
    pub date: f32,
    pub description: f32,
    pub vendor: f32,
}

#[derive(Debug, Clone)]
pub struct ScoredMatch {
    pub firefly_id: FireflyId,
    pub document_id: DocumentId,
    pub total: f32,
    pub breakdown: SignalBreakdown,
    pub reasons: Vec<String>,
    pub is_exact_match: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchOptions {
    pub date_tolerance_days: i64,
    pub max_results: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            date_tolerance_days: DEFAULT_DATE_TOLERANCE_DAYS,
            max_results: DEFAULT_MAX_RESULTS,
        }
    }
}

/// Scores all cache candidates against one document, discards anything
/// below the floor, and returns the top `max_results` sorted descending.
#[must_use]
pub fn match_candidates(
    document: &DocumentSide,
    candidates: &[LedgerSide],
    options: MatchOptions,
) -> Vec<ScoredMatch> {
    let mut scored: Vec<ScoredMatch> = candidates
        .iter()
        .map(|candidate| score_single_candidate(document, candidate, options))
        .filter(|result| result.total >= DISCARD_BELOW)
        .collect();
    scored.sort_by(|a, b| b.total.partial_cmp(&a.total).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(options.max_results);
    scored
}

/// Scores exactly one (document, ledger-cache-row) pair. Exposed
/// separately so a UI preview can score a single candidate without
/// running the full ranking pass.
#[must_use]
pub fn score_single_candidate(
    document: &DocumentSide,
    candidate: &LedgerSide,
    options: MatchOptions,
) -> ScoredMatch {
    let mut reasons = Vec::new();

    let amount = score_amount(document.amount, candidate.amount);
    if amount >= 0.95 {
        reasons.push("amount_match".to_string());
    }

    let date = score_date(document.date, candidate.date, options.date_tolerance_days);
    if date >= 0.7 {
        reasons.push("date_close".to_string());
    }

    let description = score_description(document.description.as_deref(), candidate.description.as_deref());
    if description >= 0.6 {
        reasons.push("description_match".to_string());
    }

    let vendor = score_vendor(
        document.vendor.as_deref(),
        candidate.destination_name.as_deref().or(candidate.source_name.as_deref()),
    );
    if vendor >= 0.6 {
        reasons.push("vendor_match".to_string());
    }

    let breakdown = SignalBreakdown {
        amount,
        date,
        description,
        vendor,
    };
    let mut total =
        WEIGHT_AMOUNT * amount + WEIGHT_DATE * date + WEIGHT_DESCRIPTION * description + WEIGHT_VENDOR * vendor;

    let amounts_equal = matches!((document.amount, candidate.amount), (Some(a), Some(b)) if a == b);
    let same_day = matches!((document.date, candidate.date), (Some(a), Some(b)) if a == b);
    let account_match = account_names_match(document.vendor.as_deref(), candidate.destination_name.as_deref())
        || account_names_match(document.vendor.as_deref(), candidate.source_name.as_deref())
        || account_names_match(document.source_account.as_deref(), candidate.destination_name.as_deref())
        || account_names_match(document.source_account.as_deref(), candidate.source_name.as_deref());

    let is_exact_match = amounts_equal && same_day && account_match;
    if is_exact_match {
        total = total.max(EXACT_MATCH_FLOOR);
        reasons.push("EXACT_MATCH (amount+date+account)".to_string());
    }

    ScoredMatch {
        firefly_id: candidate.firefly_id.clone(),
        document_id: document.document_id.clone(),
        total,
        breakdown,
        reasons,
        is_exact_match,
    }
}

fn score_amount(lhs: Option<Money>, rhs: Option<Money>) -> f32 {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return 0.0;
    };
    if lhs == rhs {
        return 1.0;
    }
    let lhs_minor = lhs.minor_units() as f64;
    let rhs_minor = rhs.minor_units() as f64;
    if rhs_minor == 0.0 {
        return 0.0;
    }
    let delta_ratio = (lhs_minor - rhs_minor).abs() / rhs_minor.abs();
    if delta_ratio <= 0.01 {
        0.95
    } else if delta_ratio <= 0.05 {
        0.70
    } else if delta_ratio <= 0.10 {
        0.40
    } else if delta_ratio <= 0.20 {
        0.20
    } else {
        0.0
    }
}

fn score_date(lhs: Option<NaiveDate>, rhs: Option<NaiveDate>, tolerance_days: i64) -> f32 {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return 0.0;
    };
    let delta = (lhs - rhs).num_days().abs();
    if delta == 0 {
        return 1.0;
    }
    if delta <= tolerance_days {
        let decay = 1.0 - (delta as f32 / tolerance_days as f32) * 0.7;
        return decay.clamp(0.3, 1.0);
    }
    if delta <= tolerance_days * 2 {
        return 0.2;
    }
    if delta <= 30 {
        return 0.1;
    }
    0.0
}

fn normalize_text(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn score_description(lhs: Option<&str>, rhs: Option<&str>) -> f32 {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return 0.0;
    };
    let lhs = normalize_text(lhs);
    let rhs = normalize_text(rhs);
    if lhs.is_empty() || rhs.is_empty() {
        return 0.0;
    }
    if lhs == rhs {
        return 1.0;
    }
    if lhs.contains(&rhs) || rhs.contains(&lhs) {
        return 0.8;
    }
    let jaccard = jaccard_similarity(&lhs, &rhs);
    if jaccard > 0.3 { jaccard } else { 0.0 }
}

fn jaccard_similarity(lhs: &str, rhs: &str) -> f32 {
    let lhs_words: BTreeSet<&str> = lhs.split_whitespace().collect();
    let rhs_words: BTreeSet<&str> = rhs.split_whitespace().collect();
    if lhs_words.is_empty() || rhs_words.is_empty() {
        return 0.0;
    }
    let intersection = lhs_words.intersection(&rhs_words).count();
    let union = lhs_words.union(&rhs_words).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

fn score_vendor(lhs: Option<&str>, rhs: Option<&str>) -> f32 {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return 0.0;
    };
    let lhs = normalize_text(lhs);
    let rhs = normalize_text(rhs);
    if lhs.is_empty() || rhs.is_empty() {
        return 0.0;
    }
    if lhs == rhs {
        return 1.0;
    }
    if lhs.contains(&rhs) || rhs.contains(&lhs) {
        return 0.85;
    }
    let lhs_first = lhs.split_whitespace().next();
    let rhs_first = rhs.split_whitespace().next();
    if lhs_first.is_some() && lhs_first == rhs_first {
        return 0.6;
    }
    0.0
}

fn account_names_match(lhs: Option<&str>, rhs: Option<&str>) -> bool {
    let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
        return false;
    };
    let lhs = normalize_text(lhs);
    let rhs = normalize_text(rhs);
    !lhs.is_empty() && !rhs.is_empty() && (lhs == rhs || lhs.contains(&rhs) || rhs.contains(&lhs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn doc(amount: &str, date: (i32, u32, u32), vendor: &str) -> DocumentSide {
        DocumentSide {
            document_id: "doc-1".into(),
            amount: Some(Money::parse(amount).unwrap_or_else(|e| panic!("{e}"))),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            description: Some("Amazon order".into()),
            vendor: Some(vendor.into()),
            source_account: None,
        }
    }

    fn candidate(firefly_id: &str, amount: &str, date: (i32, u32, u32), destination: &str) -> LedgerSide {
        LedgerSide {
            firefly_id: firefly_id.into(),
            amount: Some(Money::parse(amount).unwrap_or_else(|e| panic!("{e}"))),
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2),
            description: Some("AMAZON.COM order".into()),
            destination_name: Some(destination.into()),
            source_name: None,
        }
    }

    #[test]
    fn exact_match_short_circuits_to_floor() {
        let document = doc("99.99", (2025, 1, 15), "Amazon");
        let candidate = candidate("100", "99.99", (2025, 1, 15), "Amazon.com");

        let result = score_single_candidate(&document, &candidate, MatchOptions::default());
        assert!(result.is_exact_match);
        assert!(result.total >= 0.99);
        assert!(
            result
                .reasons
                .iter()
                .any(|r| r == "EXACT_MATCH (amount+date+account)")
        );
    }

    #[test]
    fn amount_bands_decay_as_spec_describes() {
        let exact = Money::parse("100.00").unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(score_amount(Some(exact), Some(exact)), 1.0);
        assert_eq!(
            score_amount(Some(Money::parse("100.50").unwrap_or_else(|e| panic!("{e}"))), Some(exact)),
            0.95
        );
        assert_eq!(
            score_amount(Some(Money::parse("104.00").unwrap_or_else(|e| panic!("{e}"))), Some(exact)),
            0.70
        );
        assert_eq!(
            score_amount(Some(Money::parse("109.00").unwrap_or_else(|e| panic!("{e}"))), Some(exact)),
            0.40
        );
        assert_eq!(
            score_amount(Some(Money::parse("119.00").unwrap_or_else(|e| panic!("{e}"))), Some(exact)),
            0.20
        );
        assert_eq!(
            score_amount(Some(Money::parse("500.00").unwrap_or_else(|e| panic!("{e}"))), Some(exact)),
            0.0
        );
        assert_eq!(score_amount(None, Some(exact)), 0.0);
    }

    #[test]
    fn date_bands_match_spec_boundaries() {
        let base = NaiveDate::from_ymd_opt(2025, 1, 15).unwrap_or_else(|| panic!("invalid fixture date"));
        assert_eq!(score_date(Some(base), Some(base), 7), 1.0);
        assert!(score_date(Some(base), Some(base + chrono::Duration::days(7)), 7) >= 0.3);
        assert_eq!(
            score_date(Some(base), Some(base + chrono::Duration::days(15)), 7),
            0.1
        );
        assert_eq!(
            score_date(Some(base), Some(base + chrono::Duration::days(40)), 7),
            0.0
        );
    }

    #[test]
    fn discards_low_scores_and_sorts_descending() {
        let document = doc("50.00", (2025, 3, 1), "Coffee Shop");
        let candidates = vec![
            candidate("low", "9999.00", (2020, 1, 1), "Nothing Related"),
            candidate("high", "50.00", (2025, 3, 1), "Coffee Shop"),
        ];
        let results = match_candidates(&document, &candidates, MatchOptions::default());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].firefly_id, "high");
    }

    #[test]
    fn results_are_capped_at_max_results() {
        let document = doc("50.00", (2025, 3, 1), "Coffee Shop");
        let candidates: Vec<LedgerSide> = (0..10)
            .map(|i| candidate(&format!("c{i}"), "50.00", (2025, 3, 1), "Coffee Shop"))
            .collect();
        let options = MatchOptions {
            max_results: 5,
            ..MatchOptions::default()
        };
        let results = match_candidates(&document, &candidates, options);
        assert_eq!(results.len(), 5);
    }
}
