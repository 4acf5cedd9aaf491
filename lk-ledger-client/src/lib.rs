#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

pub type LedgerResult<T> = Result<T, LedgerError>;
pub type TransactionId = String;
pub type AccountId = String;

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];
const INTERNAL_REFERENCE_PREFIX: &str = "PAPERLESS:";
const NOTES_MARKER_PREFIX: &str = "Paperless doc_id=";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("remote API error {status}: {message}")]
    RemoteApi {
        status: u16,
        message: String,
        field_errors: HashMap<String, Vec<String>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Withdrawal,
    Deposit,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Expense,
    Revenue,
    Liability,
}

/// One split of a transaction group, matching the wire fields of the
/// payload builder (type/date/amount/accounts/category/tags/order, plus
/// linkage fields that only the first split in a group carries).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransactionSplit {
    #[serde(rename = "type")]
    pub transaction_type: Option<TransactionType>,
    pub date: Option<NaiveDate>,
    pub amount: Option<String>,
    pub currency_code: Option<String>,
    pub description: Option<String>,
    pub source_name: Option<String>,
    pub destination_name: Option<String>,
    pub category_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub order: Option<u32>,
    pub external_id: Option<String>,
    pub internal_reference: Option<String>,
    pub notes: Option<String>,
    pub external_url: Option<String>,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub payment_date: Option<NaiveDate>,
}

/// A transaction group wire object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionGroupPayload {
    pub error_if_duplicate_hash: bool,
    pub apply_rules: bool,
    pub fire_webhooks: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_title: Option<String>,
    pub transactions: Vec<TransactionSplit>,
}

impl TransactionGroupPayload {
    #[must_use]
    pub fn new(transactions: Vec<TransactionSplit>) -> Self {
        Self {
            error_if_duplicate_hash: false,
            apply_rules: true,
            fire_webhooks: true,
            group_title: None,
            transactions,
        }
    }
}

#[must_use]
pub fn internal_reference_for(document_id: &str) -> String {
    format!("{INTERNAL_REFERENCE_PREFIX}{document_id}")
}

#[must_use]
pub fn notes_marker_for(document_id: &str) -> String {
    format!("{NOTES_MARKER_PREFIX}{document_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTransaction {
    pub transaction_group_id: TransactionId,
    pub external_id: Option<String>,
    pub internal_reference: Option<String>,
    pub splits: Vec<TransactionSplit>,
    pub created: DateTime<Utc>,
}

/// Outcome of `create_transaction`: either a genuinely new group, or the
/// existing one the ledger (or our own duplicate check) resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(TransactionId),
    AlreadyExists(TransactionId),
    SkippedDuplicateHash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteAccount {
    pub account_id: AccountId,
    pub name: String,
    pub account_type: AccountType,
    pub currency_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedResource {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Consumed ledger interface: create/fetch transactions, find-or-create
/// accounts, list supporting resources, and update linkage markers on an
/// existing transaction after the fact.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn ping(&self) -> LedgerResult<()>;
    async fn create_transaction(&self, payload: TransactionGroupPayload) -> LedgerResult<CreateOutcome>;
    async fn find_by_external_id(&self, external_id: &str) -> LedgerResult<Option<RemoteTransaction>>;
    async fn get_transaction(&self, transaction_group_id: &str) -> LedgerResult<Option<RemoteTransaction>>;
    /// Lists transactions updated on or after `since`, oldest-querying
    /// page first, following pagination to exhaustion. Used to rebuild
    /// or refresh the local ledger cache.
    async fn list_transactions(&self, since: Option<NaiveDate>) -> LedgerResult<Vec<RemoteTransaction>>;
    async fn list_accounts(&self, account_type: AccountType) -> LedgerResult<Vec<RemoteAccount>>;
    async fn find_or_create_account(
        &self,
        name: &str,
        account_type: AccountType,
        currency_code: Option<&str>,
    ) -> LedgerResult<RemoteAccount>;
    async fn list_categories(&self) -> LedgerResult<Vec<NamedResource>>;
    async fn create_category(&self, name: &str) -> LedgerResult<NamedResource>;
    async fn list_tags(&self) -> LedgerResult<Vec<NamedResource>>;
    async fn create_tag(&self, name: &str) -> LedgerResult<NamedResource>;
    async fn list_budgets(&self) -> LedgerResult<Vec<NamedResource>>;
    async fn create_budget(&self, name: &str) -> LedgerResult<NamedResource>;
    async fn list_rule_groups(&self) -> LedgerResult<Vec<NamedResource>>;
    async fn create_rule_group(&self, name: &str) -> LedgerResult<NamedResource>;
    async fn list_piggy_banks(&self) -> LedgerResult<Vec<NamedResource>>;
    async fn create_piggy_bank(&self, name: &str) -> LedgerResult<NamedResource>;
    async fn list_bills(&self) -> LedgerResult<Vec<NamedResource>>;
    async fn create_bill(&self, name: &str) -> LedgerResult<NamedResource>;
    async fn update_linkage(
        &self,
        transaction_group_id: &str,
        external_id: Option<&str>,
        internal_reference: Option<&str>,
        append_notes: Option<&str>,
    ) -> LedgerResult<()>;
}

/// Retries `operation` on retryable transport/status failures with
/// exponential backoff. Kept local to this crate rather than shared
/// through `lk-core`, which composes this client and would otherwise form
/// a dependency cycle.
async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = LedgerResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.base_delay * 2u32.pow(attempt - 1);
                warn!(attempt, ?delay, error = %err, "retrying ledger request");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_retryable(err: &LedgerError) -> bool {
    match err {
        LedgerError::Connection(_) => true,
        LedgerError::RemoteApi { status, .. } => RETRYABLE_STATUS.contains(status),
        LedgerError::Validation(_) => false,
    }
}

#[derive(Debug, Deserialize)]
struct PaginatedResponse<T> {
    results: Vec<T>,
    next: Option<String>,
}

pub struct HttpLedgerClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, retry: RetryPolicy) -> LedgerResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(retry.connect_timeout)
            .timeout(retry.read_timeout)
            .build()
            .map_err(|e| LedgerError::Connection(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            token: token.into(),
            client,
            retry,
        })
    }

    fn auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header("Authorization", format!("Bearer {}", self.token))
    }

    async fn get(&self, path: &str) -> LedgerResult<reqwest::Response> {
        with_backoff(self.retry, || async {
            let response = self
                .auth(self.client.get(format!("{}{}", self.base_url, path)))
                .send()
                .await
                .map_err(|e| LedgerError::Connection(e.to_string()))?;
            map_status(response).await
        })
        .await
    }

    async fn post_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> LedgerResult<reqwest::Response> {
        with_backoff(self.retry, || async {
            let response = self
                .auth(self.client.post(format!("{}{}", self.base_url, path)))
                .json(body)
                .send()
                .await
                .map_err(|e| LedgerError::Connection(e.to_string()))?;
            map_status(response).await
        })
        .await
    }

    async fn put_json<B: Serialize + Sync>(&self, path: &str, body: &B) -> LedgerResult<reqwest::Response> {
        with_backoff(self.retry, || async {
            let response = self
                .auth(self.client.put(format!("{}{}", self.base_url, path)))
                .json(body)
                .send()
                .await
                .map_err(|e| LedgerError::Connection(e.to_string()))?;
            map_status(response).await
        })
        .await
    }

    async fn list_named(&self, path: &str) -> LedgerResult<Vec<NamedResource>> {
        let mut path = path.to_string();
        let mut results = Vec::new();
        loop {
            let response = self.get(&path).await?;
            let page: PaginatedResponse<NamedResource> =
                response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))?;
            results.extend(page.results);
            match page.next {
                Some(next) => path = next,
                None => break,
            }
        }
        Ok(results)
    }

    async fn create_named(&self, path: &str, name: &str) -> LedgerResult<NamedResource> {
        #[derive(Serialize)]
        struct CreateRequest<'a> {
            name: &'a str,
        }
        let response = self.post_json(path, &CreateRequest { name }).await?;
        response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))
    }
}

async fn map_status(response: reqwest::Response) -> LedgerResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let status_code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(LedgerError::RemoteApi {
        status: status_code,
        message: body,
        field_errors: HashMap::new(),
    })
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn ping(&self) -> LedgerResult<()> {
        self.get("/api/v1/about").await.map(|_| ())
    }

    async fn create_transaction(&self, payload: TransactionGroupPayload) -> LedgerResult<CreateOutcome> {
        let external_id = payload.transactions.first().and_then(|t| t.external_id.clone());
        let response = self.post_json("/api/v1/transactions", &payload).await;
        match response {
            Ok(response) => {
                let group: RemoteTransaction =
                    response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))?;
                Ok(CreateOutcome::Created(group.transaction_group_id))
            }
            Err(LedgerError::RemoteApi { status: 422, message, field_errors })
                if message.to_lowercase().contains("duplicate") =>
            {
                if let Some(external_id) = external_id
                    && let Some(existing) = self.find_by_external_id(&external_id).await?
                {
                    return Ok(CreateOutcome::AlreadyExists(existing.transaction_group_id));
                }
                if message.to_lowercase().contains("hash") {
                    return Ok(CreateOutcome::SkippedDuplicateHash);
                }
                Err(LedgerError::RemoteApi { status: 422, message, field_errors })
            }
            Err(other) => Err(other),
        }
    }

    async fn find_by_external_id(&self, external_id: &str) -> LedgerResult<Option<RemoteTransaction>> {
        let path = format!("/api/v1/search/transactions?query=external_id:{external_id}");
        let response = self.get(&path).await?;
        let page: PaginatedResponse<RemoteTransaction> =
            response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))?;
        Ok(page.results.into_iter().next())
    }

    async fn get_transaction(&self, transaction_group_id: &str) -> LedgerResult<Option<RemoteTransaction>> {
        let response = self.get(&format!("/api/v1/transactions/{transaction_group_id}")).await;
        match response {
            Ok(response) => Ok(Some(
                response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))?,
            )),
            Err(LedgerError::RemoteApi { status: 404, .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn list_transactions(&self, since: Option<NaiveDate>) -> LedgerResult<Vec<RemoteTransaction>> {
        let mut path = match since {
            Some(date) => format!("/api/v1/transactions?start={date}"),
            None => "/api/v1/transactions".to_string(),
        };
        let mut results = Vec::new();
        loop {
            let response = self.get(&path).await?;
            let page: PaginatedResponse<RemoteTransaction> =
                response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))?;
            results.extend(page.results);
            match page.next {
                Some(next) => path = next,
                None => break,
            }
        }
        Ok(results)
    }

    async fn list_accounts(&self, account_type: AccountType) -> LedgerResult<Vec<RemoteAccount>> {
        let type_param = match account_type {
            AccountType::Asset => "asset",
            AccountType::Expense => "expense",
            AccountType::Revenue => "revenue",
            AccountType::Liability => "liability",
        };
        let mut path = format!("/api/v1/accounts?type={type_param}");
        let mut results = Vec::new();
        loop {
            let response = self.get(&path).await?;
            let page: PaginatedResponse<RemoteAccount> =
                response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))?;
            results.extend(page.results);
            match page.next {
                Some(next) => path = next,
                None => break,
            }
        }
        Ok(results)
    }

    async fn find_or_create_account(
        &self,
        name: &str,
        account_type: AccountType,
        currency_code: Option<&str>,
    ) -> LedgerResult<RemoteAccount> {
        let existing = self
            .list_accounts(account_type)
            .await?
            .into_iter()
            .find(|a| a.name.eq_ignore_ascii_case(name));
        if let Some(account) = existing {
            return Ok(account);
        }
        #[derive(Serialize)]
        struct CreateAccountRequest<'a> {
            name: &'a str,
            #[serde(rename = "type")]
            account_type: AccountType,
            #[serde(skip_serializing_if = "Option::is_none")]
            currency_code: Option<&'a str>,
        }
        let response = self
            .post_json("/api/v1/accounts", &CreateAccountRequest { name, account_type, currency_code })
            .await?;
        response.json().await.map_err(|e| LedgerError::Connection(e.to_string()))
    }

    async fn list_categories(&self) -> LedgerResult<Vec<NamedResource>> {
        self.list_named("/api/v1/categories").await
    }

    async fn create_category(&self, name: &str) -> LedgerResult<NamedResource> {
        self.create_named("/api/v1/categories", name).await
    }

    async fn list_tags(&self) -> LedgerResult<Vec<NamedResource>> {
        self.list_named("/api/v1/tags").await
    }

    async fn create_tag(&self, name: &str) -> LedgerResult<NamedResource> {
        self.create_named("/api/v1/tags", name).await
    }

    async fn list_budgets(&self) -> LedgerResult<Vec<NamedResource>> {
        self.list_named("/api/v1/budgets").await
    }

    async fn create_budget(&self, name: &str) -> LedgerResult<NamedResource> {
        self.create_named("/api/v1/budgets", name).await
    }

    async fn list_rule_groups(&self) -> LedgerResult<Vec<NamedResource>> {
        self.list_named("/api/v1/rule-groups").await
    }

    async fn create_rule_group(&self, name: &str) -> LedgerResult<NamedResource> {
        self.create_named("/api/v1/rule-groups", name).await
    }

    async fn list_piggy_banks(&self) -> LedgerResult<Vec<NamedResource>> {
        self.list_named("/api/v1/piggy-banks").await
    }

    async fn create_piggy_bank(&self, name: &str) -> LedgerResult<NamedResource> {
        self.create_named("/api/v1/piggy-banks", name).await
    }

    async fn list_bills(&self) -> LedgerResult<Vec<NamedResource>> {
        self.list_named("/api/v1/bills").await
    }

    async fn create_bill(&self, name: &str) -> LedgerResult<NamedResource> {
        self.create_named("/api/v1/bills", name).await
    }

    async fn update_linkage(
        &self,
        transaction_group_id: &str,
        external_id: Option<&str>,
        internal_reference: Option<&str>,
        append_notes: Option<&str>,
    ) -> LedgerResult<()> {
        #[derive(Serialize)]
        struct LinkageUpdate<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            external_id: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            internal_reference: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            notes: Option<&'a str>,
        }
        self.put_json(
            &format!("/api/v1/transactions/{transaction_group_id}"),
            &LinkageUpdate { external_id, internal_reference, notes: append_notes },
        )
        .await?;
        Ok(())
    }
}

/// In-memory double for tests, mirroring `lk_dms_client::MockDmsClient`.
#[derive(Default)]
pub struct MockLedgerClient {
    transactions: RwLock<Vec<RemoteTransaction>>,
    accounts: RwLock<Vec<RemoteAccount>>,
    named: RwLock<HashMap<&'static str, Vec<NamedResource>>>,
    next_id: RwLock<u64>,
}

impl MockLedgerClient {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn seed_account(&self, account: RemoteAccount) {
        self.accounts.write().await.push(account);
    }

    async fn next_id(&self) -> String {
        let mut next = self.next_id.write().await;
        *next += 1;
        next.to_string()
    }

    async fn create_in(&self, bucket: &'static str, name: &str) -> NamedResource {
        let resource = NamedResource { id: self.next_id().await, name: name.to_string() };
        self.named.write().await.entry(bucket).or_default().push(resource.clone());
        resource
    }

    async fn list_in(&self, bucket: &'static str) -> Vec<NamedResource> {
        self.named.read().await.get(bucket).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn ping(&self) -> LedgerResult<()> {
        Ok(())
    }

    async fn create_transaction(&self, payload: TransactionGroupPayload) -> LedgerResult<CreateOutcome> {
        let external_id = payload.transactions.first().and_then(|t| t.external_id.clone());
        if let Some(external_id) = &external_id
            && let Some(existing) = self.find_by_external_id(external_id).await?
        {
            return Ok(CreateOutcome::AlreadyExists(existing.transaction_group_id));
        }
        let id = self.next_id().await;
        self.transactions.write().await.push(RemoteTransaction {
            transaction_group_id: id.clone(),
            external_id,
            internal_reference: payload.transactions.first().and_then(|t| t.internal_reference.clone()),
            splits: payload.transactions,
            created: Utc::now(),
        });
        Ok(CreateOutcome::Created(id))
    }

    async fn find_by_external_id(&self, external_id: &str) -> LedgerResult<Option<RemoteTransaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .find(|t| t.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn get_transaction(&self, transaction_group_id: &str) -> LedgerResult<Option<RemoteTransaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .find(|t| t.transaction_group_id == transaction_group_id)
            .cloned())
    }

    async fn list_transactions(&self, since: Option<NaiveDate>) -> LedgerResult<Vec<RemoteTransaction>> {
        Ok(self
            .transactions
            .read()
            .await
            .iter()
            .filter(|t| match since {
                Some(date) => t.splits.iter().any(|split| split.date.is_none_or(|d| d >= date)),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn list_accounts(&self, account_type: AccountType) -> LedgerResult<Vec<RemoteAccount>> {
        Ok(self
            .accounts
            .read()
            .await
            .iter()
            .filter(|a| a.account_type == account_type)
            .cloned()
            .collect())
    }

    async fn find_or_create_account(
        &self,
        name: &str,
        account_type: AccountType,
        currency_code: Option<&str>,
    ) -> LedgerResult<RemoteAccount> {
        if let Some(existing) = self
            .accounts
            .read()
            .await
            .iter()
            .find(|a| a.account_type == account_type && a.name.eq_ignore_ascii_case(name))
        {
            return Ok(existing.clone());
        }
        let account = RemoteAccount {
            account_id: self.next_id().await,
            name: name.to_string(),
            account_type,
            currency_code: currency_code.map(str::to_string),
        };
        self.accounts.write().await.push(account.clone());
        Ok(account)
    }

    async fn list_categories(&self) -> LedgerResult<Vec<NamedResource>> {
        Ok(self.list_in("categories").await)
    }

    async fn create_category(&self, name: &str) -> LedgerResult<NamedResource> {
        Ok(self.create_in("categories", name).await)
    }

    async fn list_tags(&self) -> LedgerResult<Vec<NamedResource>> {
        Ok(self.list_in("tags").await)
    }

    async fn create_tag(&self, name: &str) -> LedgerResult<NamedResource> {
        Ok(self.create_in("tags", name).await)
    }

    async fn list_budgets(&self) -> LedgerResult<Vec<NamedResource>> {
        Ok(self.list_in("budgets").await)
    }

    async fn create_budget(&self, name: &str) -> LedgerResult<NamedResource> {
        Ok(self.create_in("budgets", name).await)
    }

    async fn list_rule_groups(&self) -> LedgerResult<Vec<NamedResource>> {
        Ok(self.list_in("rule_groups").await)
    }

    async fn create_rule_group(&self, name: &str) -> LedgerResult<NamedResource> {
        Ok(self.create_in("rule_groups", name).await)
    }

    async fn list_piggy_banks(&self) -> LedgerResult<Vec<NamedResource>> {
        Ok(self.list_in("piggy_banks").await)
    }

    async fn create_piggy_bank(&self, name: &str) -> LedgerResult<NamedResource> {
        Ok(self.create_in("piggy_banks", name).await)
    }

    async fn list_bills(&self) -> LedgerResult<Vec<NamedResource>> {
        Ok(self.list_in("bills").await)
    }

    async fn create_bill(&self, name: &str) -> LedgerResult<NamedResource> {
        Ok(self.create_in("bills", name).await)
    }

    async fn update_linkage(
        &self,
        transaction_group_id: &str,
        external_id: Option<&str>,
        internal_reference: Option<&str>,
        append_notes: Option<&str>,
    ) -> LedgerResult<()> {
        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .iter_mut()
            .find(|t| t.transaction_group_id == transaction_group_id)
            .ok_or_else(|| LedgerError::Validation(format!("no such transaction group {transaction_group_id}")))?;
        if let Some(external_id) = external_id {
            transaction.external_id = Some(external_id.to_string());
        }
        if let Some(internal_reference) = internal_reference {
            transaction.internal_reference = Some(internal_reference.to_string());
        }
        if let (Some(split), Some(notes)) = (transaction.splits.first_mut(), append_notes) {
            let combined = match &split.notes {
                Some(existing) => format!("{existing}; {notes}"),
                None => notes.to_string(),
            };
            split.notes = Some(combined);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_split(external_id: &str) -> TransactionSplit {
        TransactionSplit {
            transaction_type: Some(TransactionType::Withdrawal),
            amount: Some("42.00".to_string()),
            description: Some("Invoice".to_string()),
            source_name: Some("Checking".to_string()),
            destination_name: Some("Acme".to_string()),
            external_id: Some(external_id.to_string()),
            internal_reference: Some(internal_reference_for("doc-1")),
            notes: Some(notes_marker_for("doc-1")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_transaction_returns_new_id() {
        let client = MockLedgerClient::shared();
        let outcome = client
            .create_transaction(TransactionGroupPayload::new(vec![sample_split("ext-1")]))
            .await
            .expect("ok");
        assert!(matches!(outcome, CreateOutcome::Created(_)));
    }

    #[tokio::test]
    async fn create_transaction_is_idempotent_on_external_id() {
        let client = MockLedgerClient::shared();
        let first = client
            .create_transaction(TransactionGroupPayload::new(vec![sample_split("ext-1")]))
            .await
            .expect("ok");
        let second = client
            .create_transaction(TransactionGroupPayload::new(vec![sample_split("ext-1")]))
            .await
            .expect("ok");
        let (CreateOutcome::Created(id), CreateOutcome::AlreadyExists(id2)) = (first, second) else {
            panic!("expected created then already-exists");
        };
        assert_eq!(id, id2);
    }

    #[tokio::test]
    async fn find_or_create_account_reuses_existing_by_name() {
        let client = MockLedgerClient::shared();
        let first = client
            .find_or_create_account("Checking", AccountType::Asset, Some("USD"))
            .await
            .expect("ok");
        let second = client
            .find_or_create_account("checking", AccountType::Asset, Some("USD"))
            .await
            .expect("ok");
        assert_eq!(first.account_id, second.account_id);
        assert_eq!(client.list_accounts(AccountType::Asset).await.expect("ok").len(), 1);
    }

    #[tokio::test]
    async fn update_linkage_appends_to_existing_notes() {
        let client = MockLedgerClient::shared();
        let CreateOutcome::Created(id) = client
            .create_transaction(TransactionGroupPayload::new(vec![sample_split("ext-1")]))
            .await
            .expect("ok")
        else {
            panic!("expected created");
        };
        client
            .update_linkage(&id, None, None, Some("confidence=0.91"))
            .await
            .expect("ok");
        let transaction = client.get_transaction(&id).await.expect("ok").expect("present");
        let notes = transaction.splits[0].notes.as_deref().expect("notes");
        assert!(notes.contains("Paperless doc_id=doc-1"));
        assert!(notes.contains("confidence=0.91"));
    }

    #[test]
    fn retryable_status_codes_match_spec_set() {
        for status in RETRYABLE_STATUS {
            let err = LedgerError::RemoteApi { status, message: String::new(), field_errors: HashMap::new() };
            assert!(is_retryable(&err));
        }
        let non_retryable = LedgerError::RemoteApi { status: 404, message: String::new(), field_errors: HashMap::new() };
        assert!(!is_retryable(&non_retryable));
    }

    #[test]
    fn reference_and_notes_markers_use_spec_prefixes() {
        assert_eq!(internal_reference_for("doc-9"), "PAPERLESS:doc-9");
        assert_eq!(notes_marker_for("doc-9"), "Paperless doc_id=doc-9");
    }
}
