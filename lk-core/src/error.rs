use lk_dms_client::DmsError;
use lk_extract::ExtractError;
use lk_ledger_client::LedgerError;
use lk_llm::LlmError;
use lk_match::MatchError;
use lk_payload::PayloadError;
use lk_reconcile::ReconcileError;
use lk_review::ReviewError;
use lk_store::StoreError;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Composed top-level error for everything the pipeline wires together.
/// Each sub-crate keeps its own `thiserror` enum; this one only adds the
/// cases that belong to composition itself (config, a document missing
/// upstream) and otherwise forwards.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Dms(#[from] DmsError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Review(#[from] ReviewError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
