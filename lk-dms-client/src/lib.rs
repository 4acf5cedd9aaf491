#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

pub type DmsResult<T> = Result<T, DmsError>;
pub type DocumentId = String;

const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum DmsError {
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

#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub tag_names: Vec<String>,
    pub document_type: Option<String>,
    pub correspondent: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub document_id: DocumentId,
    pub title: String,
    pub document_type: Option<String>,
    pub correspondent: Option<String>,
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
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

/// Consumed DMS interface: list with filters, fetch one with resolved
/// names, download original bytes. Implementations follow pagination
/// transparently and retry transport failures with bounded backoff.
#[async_trait]
pub trait DmsClient: Send + Sync {
    async fn list_documents(&self, filter: DocumentFilter) -> DmsResult<Vec<RemoteDocument>>;
    async fn get_document(&self, document_id: &str) -> DmsResult<Option<RemoteDocument>>;
    async fn download_document(&self, document_id: &str) -> DmsResult<Option<(Vec<u8>, String)>>;
}

/// Retries `operation` on retryable transport/status failures with
/// exponential backoff. No teacher crate in the pack makes outbound
/// HTTP calls, so this stays local to each client rather than shared
/// through `lk-core` (which composes these clients and would otherwise
/// form a dependency cycle).
async fn with_backoff<T, F, Fut>(policy: RetryPolicy, mut operation: F) -> DmsResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = DmsResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_retryable(&err) => {
                let delay = policy.base_delay * 2u32.pow(attempt - 1);
                warn!(attempt, ?delay, error = %err, "retrying DMS request");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_retryable(err: &DmsError) -> bool {
    match err {
        DmsError::Connection(_) => true,
        DmsError::RemoteApi { status, .. } => RETRYABLE_STATUS.contains(status),
        DmsError::Validation(_) => false,
    }
}

#[derive(Debug, Deserialize)]
struct PaginatedResponse<T> {
    results: Vec<T>,
    next: Option<String>,
}

pub struct HttpDmsClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HttpDmsClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, retry: RetryPolicy) -> DmsResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(retry.connect_timeout)
            .timeout(retry.read_timeout)
            .build()
            .map_err(|e| DmsError::Connection(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            token: token.into(),
            client,
            retry,
        })
    }

    async fn get(&self, path: &str) -> DmsResult<reqwest::Response> {
        with_backoff(self.retry, || async {
            let response = self
                .client
                .get(format!("{}{}", self.base_url, path))
                .header("Authorization", format!("Token {}", self.token))
                .send()
                .await
                .map_err(|e| DmsError::Connection(e.to_string()))?;
            map_status(response).await
        })
        .await
    }
}

async fn map_status(response: reqwest::Response) -> DmsResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let status_code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(DmsError::RemoteApi {
        status: status_code,
        message: body,
        field_errors: HashMap::new(),
    })
}

#[async_trait]
impl DmsClient for HttpDmsClient {
    async fn list_documents(&self, filter: DocumentFilter) -> DmsResult<Vec<RemoteDocument>> {
        let mut query = Vec::new();
        for tag in &filter.tag_names {
            query.push(format!("tags__name__iexact={tag}"));
        }
        if let Some(doc_type) = &filter.document_type {
            query.push(format!("document_type__name__iexact={doc_type}"));
        }
        if let Some(correspondent) = &filter.correspondent {
            query.push(format!("correspondent__name__iexact={correspondent}"));
        }
        if let Some(q) = &filter.query {
            query.push(format!("query={q}"));
        }
        let mut path = format!("/api/documents/?{}", query.join("&"));
        let mut results = Vec::new();
        loop {
            let response = self.get(&path).await?;
            let page: PaginatedResponse<RemoteDocument> = response
                .json()
                .await
                .map_err(|e| DmsError::Connection(e.to_string()))?;
            results.extend(page.results);
            match page.next {
                Some(next) => path = next,
                None => break,
            }
        }
        Ok(results)
    }

    async fn get_document(&self, document_id: &str) -> DmsResult<Option<RemoteDocument>> {
        let response = self.get(&format!("/api/documents/{document_id}/")).await;
        match response {
            Ok(response) => Ok(Some(
                response.json().await.map_err(|e| DmsError::Connection(e.to_string()))?,
            )),
            Err(DmsError::RemoteApi { status: 404, .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn download_document(&self, document_id: &str) -> DmsResult<Option<(Vec<u8>, String)>> {
        let response = self.get(&format!("/api/documents/{document_id}/download/")).await;
        let response = match response {
            Ok(response) => response,
            Err(DmsError::RemoteApi { status: 404, .. }) => return Ok(None),
            Err(other) => return Err(other),
        };
        let filename = response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split("filename=").nth(1))
            .map(|v| v.trim_matches('"').to_string())
            .unwrap_or_else(|| format!("{document_id}.bin"));
        let bytes = response.bytes().await.map_err(|e| DmsError::Connection(e.to_string()))?;
        Ok(Some((bytes.to_vec(), filename)))
    }
}

/// In-memory double for tests.
#[derive(Default)]
pub struct MockDmsClient {
    documents: RwLock<Vec<RemoteDocument>>,
    bytes: RwLock<HashMap<DocumentId, (Vec<u8>, String)>>,
}

impl MockDmsClient {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn seed_document(&self, document: RemoteDocument) {
        self.documents.write().await.push(document);
    }

    pub async fn seed_bytes(&self, document_id: &str, bytes: Vec<u8>, filename: &str) {
        self.bytes
            .write()
            .await
            .insert(document_id.to_string(), (bytes, filename.to_string()));
    }
}

#[async_trait]
impl DmsClient for MockDmsClient {
    async fn list_documents(&self, filter: DocumentFilter) -> DmsResult<Vec<RemoteDocument>> {
        let documents = self.documents.read().await;
        Ok(documents
            .iter()
            .filter(|doc| {
                filter.tag_names.is_empty() || filter.tag_names.iter().all(|tag| doc.tags.contains(tag))
            })
            .filter(|doc| {
                filter
                    .document_type
                    .as_deref()
                    .is_none_or(|t| doc.document_type.as_deref() == Some(t))
            })
            .cloned()
            .collect())
    }

    async fn get_document(&self, document_id: &str) -> DmsResult<Option<RemoteDocument>> {
        let documents = self.documents.read().await;
        Ok(documents.iter().find(|doc| doc.document_id == document_id).cloned())
    }

    async fn download_document(&self, document_id: &str) -> DmsResult<Option<(Vec<u8>, String)>> {
        Ok(self.bytes.read().await.get(document_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_document(id: &str) -> RemoteDocument {
        RemoteDocument {
            document_id: id.to_string(),
            title: "Invoice".into(),
            document_type: Some("invoice".into()),
            correspondent: Some("Acme".into()),
            tags: vec!["finance".into()],
            created: Utc::now(),
        }
    }

    #[tokio::test]
    async fn mock_round_trips_document_and_bytes() {
        let client = MockDmsClient::shared();
        client.seed_document(sample_document("12345")).await;
        client.seed_bytes("12345", b"%PDF-1.4".to_vec(), "invoice.pdf").await;

        let fetched = client.get_document("12345").await.expect("ok").expect("present");
        assert_eq!(fetched.title, "Invoice");

        let (bytes, filename) = client.download_document("12345").await.expect("ok").expect("present");
        assert_eq!(filename, "invoice.pdf");
        assert_eq!(bytes, b"%PDF-1.4".to_vec());
    }

    #[tokio::test]
    async fn mock_filters_by_tag() {
        let client = MockDmsClient::shared();
        client.seed_document(sample_document("a")).await;
        let mut other = sample_document("b");
        other.tags = vec!["personal".into()];
        client.seed_document(other).await;

        let results = client
            .list_documents(DocumentFilter {
                tag_names: vec!["finance".into()],
                ..DocumentFilter::default()
            })
            .await
            .expect("ok");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].document_id, "a");
    }

    #[tokio::test]
    async fn missing_document_returns_none_not_error() {
        let client = MockDmsClient::shared();
        let result = client.get_document("missing").await.expect("ok");
        assert!(result.is_none());
    }

    #[test]
    fn retryable_status_codes_match_spec_set() {
        for status in RETRYABLE_STATUS {
            let err = DmsError::RemoteApi {
                status,
                message: String::new(),
                field_errors: HashMap::new(),
            };
            assert!(is_retryable(&err));
        }
        let non_retryable = DmsError::RemoteApi {
            status: 404,
            message: String::new(),
            field_errors: HashMap::new(),
        };
        assert!(!is_retryable(&non_retryable));
    }
}
