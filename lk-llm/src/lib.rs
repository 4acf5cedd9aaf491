#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lk_record::ExtractionId;
use lk_store::{
    AiJobId, AiJobRow, AiJobStatus, FeedbackKind, LlmCacheRow, LlmFeedbackRow, StateStore,
    StoreError,
};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

pub type LlmResult<T> = Result<T, LlmError>;

/// Bumped whenever a prompt template's wording changes; part of every
/// cache key so a template edit invalidates prior responses.
const PROMPT_VERSION: &str = "v1";
const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];
const VALID_TRANSACTION_TYPES: [&str; 3] = ["withdrawal", "deposit", "transfer"];

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("remote API error {status}: {message}")]
    RemoteApi { status: u16, message: String },
    #[error("could not parse LLM response as JSON: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn is_retryable(err: &LlmError) -> bool {
    match err {
        LlmError::Connection(_) => true,
        LlmError::RemoteApi { status, .. } => RETRYABLE_STATUS.contains(status),
        LlmError::Validation(_) | LlmError::Parse(_) | LlmError::Store(_) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Category,
    Split,
    Review,
    Chat,
}

impl SuggestionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Split => "split",
            Self::Review => "review",
            Self::Chat => "chat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Local,
    Remote,
    Disabled,
}

impl EndpointClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub enabled: bool,
    pub ollama_url: String,
    pub model_fast: String,
    pub model_fallback: Option<String>,
    pub connect_timeout: Duration,
    pub timeout_seconds: u64,
    pub max_concurrent: usize,
    pub max_retries: u32,
    pub green_threshold: f32,
    pub calibration_count: i64,
    pub auth_header: Option<String>,
    pub cache_ttl: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ollama_url: "http://localhost:11434".into(),
            model_fast: "qwen2.5:7b".into(),
            model_fallback: None,
            connect_timeout: Duration::from_secs(10),
            timeout_seconds: 60,
            max_concurrent: 2,
            max_retries: 3,
            green_threshold: 0.90,
            calibration_count: 50,
            auth_header: None,
            cache_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl LlmConfig {
    #[must_use]
    pub fn is_remote(&self) -> bool {
        !(self.ollama_url.contains("localhost") || self.ollama_url.contains("127.0.0.1"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategorySuggestion {
    pub category: String,
    pub confidence: f32,
    pub reason: String,
    pub model: String,
    #[serde(default)]
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitLine {
    pub category: String,
    pub amount: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitSuggestion {
    pub should_split: bool,
    pub splits: Vec<SplitLine>,
    pub confidence: f32,
    pub reason: String,
    pub model: String,
    #[serde(default)]
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSuggestion {
    pub value: String,
    pub confidence: f32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSuggestion {
    pub suggestions: HashMap<String, FieldSuggestion>,
    pub overall_confidence: f32,
    pub analysis_notes: String,
    pub model: String,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_transactions: Option<Vec<SplitLine>>,
}

/// Caller-supplied context for a per-field review suggestion. Borrowed
/// rather than owned since the caller (job worker) already holds all of
/// this in its own extraction/cache rows.
#[derive(Debug, Clone, Default)]
pub struct ReviewContext<'a> {
    pub amount: &'a str,
    pub date: &'a str,
    pub vendor: Option<&'a str>,
    pub description: Option<&'a str>,
    pub current_category: Option<&'a str>,
    pub current_type: Option<&'a str>,
    pub invoice_number: Option<&'a str>,
    pub ocr_confidence: f32,
    pub document_content: Option<&'a str>,
    pub bank_amount: Option<&'a str>,
    pub source_accounts: &'a [String],
    pub current_source_account: Option<&'a str>,
}

/// A chat model completion backend. `HttpLlmBackend` talks to a real
/// Ollama-compatible `/api/chat` endpoint; `MockLlmBackend` replays
/// scripted responses for tests.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        user_message: &str,
        json_mode: bool,
    ) -> LlmResult<String>;
}

async fn with_backoff<T, F, Fut>(max_attempts: u32, mut operation: F) -> LlmResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = LlmResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < max_attempts && is_retryable(&err) => {
                let delay = Duration::from_millis(250) * 2u32.pow(attempt - 1);
                warn!(attempt, ?delay, error = %err, "retrying LLM request");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

pub struct HttpLlmBackend {
    base_url: String,
    client: reqwest::Client,
    auth_header: Option<(String, String)>,
    max_retries: u32,
}

impl HttpLlmBackend {
    pub fn new(config: &LlmConfig) -> LlmResult<Self> {
        if config.ollama_url.trim().is_empty() {
            return Err(LlmError::Validation("ollama_url must not be empty".into()));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;
        let auth_header = config.auth_header.as_ref().map(|raw| match raw.split_once(':') {
            Some((key, value)) => (key.trim().to_string(), value.trim().to_string()),
            None => ("Authorization".to_string(), raw.clone()),
        });
        Ok(Self {
            base_url: config.ollama_url.clone(),
            client,
            auth_header,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    async fn complete(
        &self,
        model: &str,
        system_prompt: &str,
        user_message: &str,
        json_mode: bool,
    ) -> LlmResult<String> {
        with_backoff(self.max_retries, || async {
            let request = ChatRequest {
                model,
                messages: [
                    ChatMessage { role: "system", content: system_prompt },
                    ChatMessage { role: "user", content: user_message },
                ],
                stream: false,
                format: json_mode.then_some("json"),
            };
            debug!(model, "calling LLM backend");
            let mut builder = self.client.post(format!("{}/api/chat", self.base_url)).json(&request);
            if let Some((key, value)) = &self.auth_header {
                builder = builder.header(key.as_str(), value.as_str());
            }
            let response = builder.send().await.map_err(|e| LlmError::Connection(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::RemoteApi { status: status.as_u16(), message: body });
            }
            let parsed: ChatResponse =
                response.json().await.map_err(|e| LlmError::Connection(e.to_string()))?;
            debug!(model, chars = parsed.message.content.len(), "LLM backend returned content");
            Ok(parsed.message.content)
        })
        .await
    }
}

/// Scripted in-memory backend for tests: a FIFO queue of results per
/// model name, so a test can make the fast model fail once and the
/// fallback model succeed.
#[derive(Default)]
pub struct MockLlmBackend {
    queued: RwLock<HashMap<String, Vec<LlmResult<String>>>>,
    calls: RwLock<Vec<(String, bool)>>,
}

impl MockLlmBackend {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn push(&self, model: impl Into<String>, result: LlmResult<String>) {
        self.queued.write().await.entry(model.into()).or_default().push(result);
    }

    pub async fn calls(&self) -> Vec<(String, bool)> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl LlmBackend for MockLlmBackend {
    async fn complete(
        &self,
        model: &str,
        _system_prompt: &str,
        _user_message: &str,
        json_mode: bool,
    ) -> LlmResult<String> {
        self.calls.write().await.push((model.to_string(), json_mode));
        let mut guard = self.queued.write().await;
        match guard.get_mut(model).filter(|queue| !queue.is_empty()).map(|queue| queue.remove(0)) {
            Some(result) => result,
            None => Err(LlmError::Connection(format!("no scripted response for model {model}"))),
        }
    }
}

#[must_use]
fn taxonomy_version(categories: &[String]) -> String {
    if categories.is_empty() {
        return "empty".to_string();
    }
    let mut sorted: Vec<&str> = categories.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let joined = sorted.join("|");
    let digest = Sha256::digest(joined.as_bytes());
    hex_prefix(&digest, 12)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes.iter().take(len.div_ceil(2)).map(|b| format!("{b:02x}")).collect::<String>()[..len].to_string()
}

#[must_use]
fn cache_key(kind: SuggestionKind, taxonomy_version: &str, components: &[&str]) -> String {
    let mut parts = vec![kind.as_str(), PROMPT_VERSION, taxonomy_version];
    parts.extend_from_slice(components);
    let joined = parts.join("|");
    format!("{:x}", Sha256::digest(joined.as_bytes()))
}

fn short_hash(content: &str) -> String {
    hex_prefix(&Sha256::digest(content.as_bytes()), 8)
}

fn match_category(raw: &str, categories: &[String]) -> Option<String> {
    let raw_trimmed = raw.trim();
    if raw_trimmed.is_empty() {
        return None;
    }
    let raw_lower = raw_trimmed.to_lowercase();

    if let Some(exact) = categories.iter().find(|c| c.to_lowercase() == raw_lower) {
        return Some(exact.clone());
    }
    if let Some(substr) = categories
        .iter()
        .find(|c| raw_lower.contains(&c.to_lowercase()) || c.to_lowercase().contains(&raw_lower))
    {
        return Some(substr.clone());
    }
    let raw_words: std::collections::HashSet<&str> = raw_lower.split_whitespace().collect();
    let mut best: Option<(&String, usize)> = None;
    for category in categories {
        let cat_lower = category.to_lowercase();
        let overlap = cat_lower.split_whitespace().filter(|w| raw_words.contains(w)).count();
        if overlap > 0 && best.is_none_or(|(_, best_overlap)| overlap > best_overlap) {
            best = Some((category, overlap));
        }
    }
    best.map(|(category, _)| category.clone())
}

/// Lenient JSON extraction, mirroring the recovery ladder used by the
/// original service: direct parse, then array extraction (splits), then
/// outermost-object extraction, then trailing-comma/unquoted-key cleanup,
/// then a last-resort key-value scrape.
fn parse_lenient_json(content: &str) -> LlmResult<serde_json::Value> {
    let stripped = strip_markdown_fence(content.trim());
    if stripped.is_empty() {
        return Err(LlmError::Parse("empty response".into()));
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(stripped) {
        return Ok(value);
    }

    if stripped.contains('[')
        && let Some(array) = extract_balanced(stripped, '[', ']')
        && let Ok(serde_json::Value::Array(items)) = serde_json::from_str::<serde_json::Value>(&array)
        && !items.is_empty()
    {
        return Ok(serde_json::json!({
            "should_split": true,
            "splits": items,
            "confidence": 0.5,
            "reason": "extracted from malformed response",
        }));
    }

    if let Some(object) = extract_balanced(stripped, '{', '}')
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(&object)
    {
        return Ok(value);
    }

    let cleaned = clean_json_candidate(stripped);
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&cleaned) {
        return Ok(value);
    }

    scrape_key_value_pairs(stripped).ok_or_else(|| {
        LlmError::Parse(format!("could not parse JSON from response: {}", truncate(stripped, 200)))
    })
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn strip_markdown_fence(content: &str) -> &str {
    let without_open = content
        .strip_prefix("```json")
        .or_else(|| content.strip_prefix("```"))
        .unwrap_or(content);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}

/// Finds the first `open`...`close` span that balances correctly,
/// skipping over nested pairs of the same kind.
fn extract_balanced(content: &str, open: char, close: char) -> Option<String> {
    let start = content.find(open)?;
    let mut depth = 0i32;
    for (offset, ch) in content[start..].char_indices() {
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(content[start..start + offset + ch.len_utf8()].to_string());
            }
        }
    }
    None
}

fn clean_json_candidate(content: &str) -> String {
    let control_stripped: String =
        content.chars().filter(|c| !c.is_control() || *c == '\n' || *c == '\t').collect();
    let trailing_comma = Regex::new(r",\s*([}\]])").expect("static regex is valid");
    let no_trailing_commas = trailing_comma.replace_all(&control_stripped, "$1");
    let unquoted_key = Regex::new(r#"([{,])\s*([a-zA-Z_][a-zA-Z0-9_]*)\s*:"#).expect("static regex is valid");
    unquoted_key.replace_all(&no_trailing_commas, "$1\"$2\":").into_owned()
}

fn scrape_key_value_pairs(content: &str) -> Option<serde_json::Value> {
    let mut result = serde_json::Map::new();

    if let Some(caps) = Regex::new(r#"(?i)"?should_split"?\s*:\s*(true|false)"#)
        .expect("static regex is valid")
        .captures(content)
    {
        result.insert("should_split".into(), serde_json::Value::Bool(&caps[1].to_lowercase() == "true"));
    }
    if let Some(caps) = Regex::new(r#""?confidence"?\s*:\s*([0-9.]+)"#)
        .expect("static regex is valid")
        .captures(content)
        && let Ok(value) = caps[1].parse::<f64>()
        && let Some(number) = serde_json::Number::from_f64(value)
    {
        result.insert("confidence".into(), serde_json::Value::Number(number));
    }
    if let Some(caps) =
        Regex::new(r#""?category"?\s*:\s*"([^"]+)""#).expect("static regex is valid").captures(content)
    {
        result.insert("category".into(), serde_json::Value::String(caps[1].to_string()));
    }
    let reason = Regex::new(r#""?reason"?\s*:\s*"([^"]+)""#)
        .expect("static regex is valid")
        .captures(content)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "extracted from malformed response".to_string());
    result.insert("reason".into(), serde_json::Value::String(reason));

    if result.len() <= 1 {
        None
    } else {
        Some(serde_json::Value::Object(result))
    }
}

/// LLM-assisted suggestion service. The single enforcement point for the
/// global enable flag and per-document opt-out: every public suggestion
/// method checks both before doing any network work.
pub struct LlmService<S: StateStore, B: LlmBackend> {
    store: Arc<S>,
    backend: Arc<B>,
    config: LlmConfig,
    categories: RwLock<Vec<String>>,
    taxonomy_version: RwLock<String>,
    semaphore: Arc<Semaphore>,
    active_requests: AtomicI64,
}

impl<S: StateStore, B: LlmBackend> LlmService<S, B> {
    pub fn new(store: Arc<S>, backend: Arc<B>, config: LlmConfig, categories: Vec<String>) -> Self {
        let taxonomy = taxonomy_version(&categories);
        Self {
            store,
            backend,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            config,
            categories: RwLock::new(categories),
            taxonomy_version: RwLock::new(taxonomy),
            active_requests: AtomicI64::new(0),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn endpoint_class(&self) -> EndpointClass {
        if !self.config.enabled {
            EndpointClass::Disabled
        } else if self.config.is_remote() {
            EndpointClass::Remote
        } else {
            EndpointClass::Local
        }
    }

    #[must_use]
    pub fn active_requests(&self) -> i64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    pub async fn set_categories(&self, categories: Vec<String>) {
        let taxonomy = taxonomy_version(&categories);
        *self.categories.write().await = categories;
        *self.taxonomy_version.write().await = taxonomy;
    }

    pub async fn is_calibrating(&self) -> LlmResult<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let produced = self.store.llm_suggestion_count().await?;
        Ok(produced < self.config.calibration_count)
    }

    pub async fn should_auto_apply(&self, confidence: f32) -> LlmResult<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        if self.is_calibrating().await? {
            return Ok(false);
        }
        Ok(confidence >= self.config.green_threshold)
    }

    /// Per-document opt-out check, the single enforcement point referenced
    /// by every suggestion method. `llm_opt_out` is carried on the
    /// extraction row, not re-derived here.
    fn check_opt_out(&self, llm_opt_out: bool) -> bool {
        !self.config.enabled || llm_opt_out
    }

    pub async fn record_feedback(
        &self,
        run_id: lk_store::RunId,
        suggested_category: Option<String>,
        actual_category: Option<String>,
        notes: Option<String>,
    ) -> LlmResult<i64> {
        let feedback_kind = if suggested_category == actual_category {
            FeedbackKind::Correct
        } else {
            FeedbackKind::Wrong
        };
        let id = self
            .store
            .record_llm_feedback(LlmFeedbackRow {
                id: 0,
                run_id,
                suggested_category,
                actual_category,
                feedback_kind,
                notes,
            })
            .await?;
        Ok(id)
    }

    async fn call_with_fallback(
        &self,
        system_prompt: &str,
        user_message: &str,
        json_mode: bool,
    ) -> LlmResult<(String, String)> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| LlmError::Connection("LLM concurrency semaphore closed".into()))?;
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        let result = self.call_with_fallback_inner(system_prompt, user_message, json_mode).await;
        self.active_requests.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn call_with_fallback_inner(
        &self,
        system_prompt: &str,
        user_message: &str,
        json_mode: bool,
    ) -> LlmResult<(String, String)> {
        let fast = self.config.model_fast.clone();
        match self.backend.complete(&fast, system_prompt, user_message, json_mode).await {
            Ok(content) => Ok((content, fast)),
            Err(err) => {
                let Some(fallback) = self.config.model_fallback.clone() else {
                    return Err(err);
                };
                info!(fast = %fast, fallback = %fallback, error = %err, "fast model failed, trying fallback");
                let content = self.backend.complete(&fallback, system_prompt, user_message, json_mode).await?;
                Ok((content, fallback))
            }
        }
    }

    async fn cached(&self, key: &str) -> LlmResult<Option<LlmCacheRow>> {
        Ok(self.store.get_llm_cache(key).await?)
    }

    async fn store_cache(&self, key: String, model: String, response: &serde_json::Value) -> LlmResult<()> {
        let taxonomy = self.taxonomy_version.read().await.clone();
        self.store
            .set_llm_cache(LlmCacheRow {
                cache_key: key,
                model_name: model,
                prompt_version: PROMPT_VERSION.to_string(),
                taxonomy_version: taxonomy,
                response_text: response.to_string(),
                hit_count: 0,
                expires_at: Utc::now() + self.config.cache_ttl,
            })
            .await?;
        Ok(())
    }

    pub async fn suggest_category(
        &self,
        amount: &str,
        date: &str,
        vendor: Option<&str>,
        description: Option<&str>,
        llm_opt_out: bool,
        use_cache: bool,
    ) -> LlmResult<Option<CategorySuggestion>> {
        if self.check_opt_out(llm_opt_out) {
            return Ok(None);
        }
        let categories = self.categories.read().await.clone();
        if categories.is_empty() {
            warn!("no categories configured for LLM category suggestions");
            return Ok(None);
        }
        let taxonomy = self.taxonomy_version.read().await.clone();
        let key = cache_key(
            SuggestionKind::Category,
            &taxonomy,
            &[amount, date, vendor.unwrap_or_default(), description.unwrap_or_default()],
        );

        if use_cache
            && let Some(cached) = self.cached(&key).await?
        {
            let data: serde_json::Value = serde_json::from_str(&cached.response_text)
                .map_err(|e| LlmError::Parse(e.to_string()))?;
            return Ok(Some(CategorySuggestion {
                category: data["category"].as_str().unwrap_or_default().to_string(),
                confidence: data["confidence"].as_f64().unwrap_or(0.0) as f32,
                reason: data["reason"].as_str().unwrap_or_default().to_string(),
                model: cached.model_name,
                from_cache: true,
            }));
        }

        let categories_list = categories.join(", ");
        let system_prompt = "Suggest exactly one category for this transaction from the allowed list. Respond with JSON {\"category\": str, \"confidence\": number 0-1, \"reason\": str}.";
        let user_message = format!(
            "amount={amount} date={date} vendor={} description={} categories=[{categories_list}]",
            vendor.unwrap_or("unknown"),
            description.unwrap_or("")
        );

        let (content, model) = self.call_with_fallback(system_prompt, &user_message, true).await?;
        let data = parse_lenient_json(&content)?;
        let category = data["category"].as_str().unwrap_or_default().to_string();
        if !categories.contains(&category) {
            warn!(category = %category, "LLM suggested a category outside the taxonomy");
            return Ok(None);
        }
        let suggestion = CategorySuggestion {
            category,
            confidence: data["confidence"].as_f64().unwrap_or(0.0) as f32,
            reason: data["reason"].as_str().unwrap_or_default().to_string(),
            model: model.clone(),
            from_cache: false,
        };
        self.store_cache(key, model, &data).await?;
        Ok(Some(suggestion))
    }

    pub async fn suggest_splits(
        &self,
        amount: &str,
        date: &str,
        vendor: Option<&str>,
        description: Option<&str>,
        content_text: Option<&str>,
        llm_opt_out: bool,
        use_cache: bool,
    ) -> LlmResult<Option<SplitSuggestion>> {
        if self.check_opt_out(llm_opt_out) {
            return Ok(None);
        }
        let categories = self.categories.read().await.clone();
        if categories.is_empty() {
            return Ok(None);
        }
        let taxonomy = self.taxonomy_version.read().await.clone();
        let content_hash = short_hash(content_text.unwrap_or_default());
        let key = cache_key(
            SuggestionKind::Split,
            &taxonomy,
            &[amount, date, vendor.unwrap_or_default(), description.unwrap_or_default(), &content_hash],
        );

        if use_cache
            && let Some(cached) = self.cached(&key).await?
        {
            let data: serde_json::Value = serde_json::from_str(&cached.response_text)
                .map_err(|e| LlmError::Parse(e.to_string()))?;
            return Ok(Some(deserialize_split(&data, cached.model_name, true)));
        }

        let categories_list = categories.join(", ");
        let system_prompt = "Decompose this receipt into categorised line items that sum to the total. Respond with JSON {\"should_split\": bool, \"splits\": [{\"category\": str, \"amount\": number, \"description\": str}], \"confidence\": number, \"reason\": str}.";
        let user_message = format!(
            "total={amount} date={date} vendor={} description={} content={} categories=[{categories_list}]",
            vendor.unwrap_or("unknown"),
            description.unwrap_or(""),
            content_text.unwrap_or(""),
        );
        let model = self.config.model_fallback.clone().unwrap_or_else(|| self.config.model_fast.clone());
        let content = self.backend.complete(&model, system_prompt, &user_message, true).await?;
        let data = parse_lenient_json(&content)?;

        let normalized: Vec<SplitLine> = data["splits"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|split| {
                let raw_amount = parse_loose_amount(split.get("amount")?)?;
                let raw_category = split.get("category")?.as_str().unwrap_or_default();
                let matched = match_category(raw_category, &categories)?;
                if raw_amount <= 0.0 {
                    return None;
                }
                Some(SplitLine {
                    category: matched,
                    amount: (raw_amount * 100.0).round() / 100.0,
                    description: split.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                })
            })
            .collect();

        let suggestion = SplitSuggestion {
            should_split: data["should_split"].as_bool().unwrap_or(false) && !normalized.is_empty(),
            splits: normalized,
            confidence: data["confidence"].as_f64().unwrap_or(0.0) as f32,
            reason: data["reason"].as_str().unwrap_or_default().to_string(),
            model: model.clone(),
            from_cache: false,
        };
        if !suggestion.splits.is_empty() {
            let cache_payload = serde_json::json!({
                "should_split": suggestion.should_split,
                "splits": suggestion.splits,
                "confidence": suggestion.confidence,
                "reason": suggestion.reason,
            });
            self.store_cache(key, model, &cache_payload).await?;
        }
        Ok(Some(suggestion))
    }

    pub async fn suggest_for_review(
        &self,
        ctx: &ReviewContext<'_>,
        llm_opt_out: bool,
        use_cache: bool,
    ) -> LlmResult<Option<ReviewSuggestion>> {
        if self.check_opt_out(llm_opt_out) {
            return Ok(None);
        }
        let categories = self.categories.read().await.clone();
        if categories.is_empty() {
            warn!("no categories configured for LLM review suggestions");
            return Ok(None);
        }
        let taxonomy = self.taxonomy_version.read().await.clone();
        let context_hash = short_hash(&format!(
            "{}|{}|{}|{}|{}|{}|{}",
            ctx.amount,
            ctx.date,
            ctx.vendor.unwrap_or_default(),
            ctx.description.unwrap_or_default(),
            ctx.current_category.unwrap_or_default(),
            ctx.current_type.unwrap_or_default(),
            short_hash(ctx.document_content.unwrap_or_default()),
        ));
        let key = format!("review:{context_hash}:{taxonomy}");

        if use_cache
            && let Some(cached) = self.cached(&key).await?
        {
            let data: serde_json::Value = serde_json::from_str(&cached.response_text)
                .map_err(|e| LlmError::Parse(e.to_string()))?;
            return Ok(Some(deserialize_review(&data, cached.model_name, true)));
        }

        let accounts_list = ctx.source_accounts.join(", ");
        let categories_list = categories.join(", ");
        let system_prompt = "Suggest values for category, transaction_type, destination account and description for this transaction, plus an optional split list. Respond with JSON {\"suggestions\": {field: {\"value\": str, \"confidence\": number, \"reason\": str}}, \"overall_confidence\": number, \"analysis_notes\": str, \"split_transactions\": [...]? }.";
        let user_message = format!(
            "amount={} date={} vendor={} description={} current_category={} current_type={} invoice_number={} ocr_confidence={} bank_amount={} current_source_account={} content={} categories=[{categories_list}] source_accounts=[{accounts_list}]",
            ctx.amount,
            ctx.date,
            ctx.vendor.unwrap_or("unknown"),
            ctx.description.unwrap_or(""),
            ctx.current_category.unwrap_or(""),
            ctx.current_type.unwrap_or(""),
            ctx.invoice_number.unwrap_or(""),
            ctx.ocr_confidence,
            ctx.bank_amount.unwrap_or(""),
            ctx.current_source_account.unwrap_or(""),
            ctx.document_content.unwrap_or(""),
        );

        let (content, model) = self.call_with_fallback(system_prompt, &user_message, true).await?;
        let data = parse_lenient_json(&content)?;
        let suggestion = build_review_suggestion(&data, model.clone(), &categories);
        self.store_cache(key, model, &data).await?;
        Ok(Some(suggestion))
    }

    pub async fn chat(
        &self,
        question: &str,
        documentation: Option<&str>,
        page_context: Option<&str>,
    ) -> LlmResult<Option<String>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let system_prompt = "You answer questions about this application's documentation concisely and never invent features that are not documented.";
        let user_message = format!(
            "question={question}\ndocumentation={}\npage_context={}",
            documentation.unwrap_or(""),
            page_context.unwrap_or(""),
        );
        let (content, _model) = self.call_with_fallback(system_prompt, &user_message, false).await?;
        Ok(Some(content))
    }

    /// Schedules a background AI job for a document unless one is already
    /// non-terminal, matching the "at most one active job per document"
    /// invariant enforced by the store's `schedule_ai_job`.
    pub async fn schedule_job(
        &self,
        document_id: String,
        extraction_id: Option<ExtractionId>,
        external_id: Option<String>,
        priority: i32,
        created_by: Option<String>,
    ) -> LlmResult<AiJobId> {
        let row = AiJobRow {
            id: 0,
            document_id,
            extraction_id,
            external_id,
            priority,
            status: AiJobStatus::Pending,
            retry_count: 0,
            max_retries: self.config.max_retries as i32,
            scheduled_for: None,
            created_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            suggestions_json: None,
        };
        Ok(self.store.schedule_ai_job(row).await?)
    }

    /// Pulls and runs the next ready job through `run`, handling the
    /// opt-out skip, completion, and retry-on-failure bookkeeping. Returns
    /// `Ok(None)` when the queue has nothing ready.
    pub async fn process_next_job<F, Fut>(&self, run: F) -> LlmResult<Option<AiJobId>>
    where
        F: FnOnce(AiJobRow) -> Fut,
        Fut: std::future::Future<Output = LlmResult<Option<serde_json::Value>>>,
    {
        let Some(job) = self.store.get_next_ai_job().await? else {
            return Ok(None);
        };
        let job_id = job.id;

        let opted_out = match self.store.get_extraction_by_document(&job.document_id, None).await {
            Ok(Some(extraction)) => extraction.llm_opt_out,
            Ok(None) => false,
            Err(err) => {
                warn!(job_id, error = %err, "could not check opt-out before starting job");
                false
            }
        };
        if opted_out {
            self.store.start_ai_job(job_id).await?;
            let skipped = serde_json::json!({"skipped": true, "reason": "AI opted out for this document"});
            self.store.complete_ai_job(job_id, &skipped.to_string()).await?;
            return Ok(Some(job_id));
        }

        self.store.start_ai_job(job_id).await?;
        match run(job).await {
            Ok(suggestions) => {
                let payload = suggestions.unwrap_or(serde_json::Value::Null).to_string();
                self.store.complete_ai_job(job_id, &payload).await?;
            }
            Err(err) => {
                warn!(job_id, error = %err, "AI job failed");
                self.store.fail_ai_job_with_retry(job_id, &err.to_string()).await?;
            }
        }
        Ok(Some(job_id))
    }

    pub async fn cancel_job(&self, job_id: AiJobId) -> LlmResult<()> {
        Ok(self.store.cancel_ai_job(job_id).await?)
    }

    pub async fn cleanup_jobs(&self, older_than: DateTime<Utc>) -> LlmResult<usize> {
        Ok(self.store.cleanup_ai_jobs(older_than).await?)
    }

    pub async fn sweep_expired_cache(&self) -> LlmResult<usize> {
        Ok(self.store.sweep_expired_llm_cache().await?)
    }
}

fn parse_loose_amount(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => {
            let cleaned: String =
                s.chars().filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',').collect();
            cleaned.replace(',', ".").parse().ok()
        }
        _ => None,
    }
}

fn deserialize_split(data: &serde_json::Value, model: String, from_cache: bool) -> SplitSuggestion {
    let splits = data["splits"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|split| {
            Some(SplitLine {
                category: split.get("category")?.as_str()?.to_string(),
                amount: split.get("amount")?.as_f64()?,
                description: split.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
            })
        })
        .collect();
    SplitSuggestion {
        should_split: data["should_split"].as_bool().unwrap_or(false),
        splits,
        confidence: data["confidence"].as_f64().unwrap_or(0.0) as f32,
        reason: data["reason"].as_str().unwrap_or_default().to_string(),
        model,
        from_cache,
    }
}

fn build_review_suggestion(
    data: &serde_json::Value,
    model: String,
    categories: &[String],
) -> ReviewSuggestion {
    let mut suggestions = HashMap::new();
    if let Some(map) = data["suggestions"].as_object() {
        for (field, field_data) in map {
            let Some(value) = field_data.get("value").and_then(|v| v.as_str()) else {
                continue;
            };
            if field == "category" && !categories.contains(&value.to_string()) {
                warn!(category = %value, "LLM suggested invalid category, skipping field");
                continue;
            }
            if field == "transaction_type" && !VALID_TRANSACTION_TYPES.contains(&value) {
                warn!(transaction_type = %value, "LLM suggested invalid transaction type, skipping field");
                continue;
            }
            suggestions.insert(
                field.clone(),
                FieldSuggestion {
                    value: value.to_string(),
                    confidence: field_data.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.5) as f32,
                    reason: field_data.get("reason").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                },
            );
        }
    }

    let split_transactions = data["split_transactions"].as_array().and_then(|raw| {
        let valid: Vec<SplitLine> = raw
            .iter()
            .filter_map(|split| {
                let category = split.get("category").and_then(|v| v.as_str()).unwrap_or_default();
                let category = if categories.contains(&category.to_string()) {
                    category.to_string()
                } else {
                    String::new()
                };
                Some(SplitLine {
                    category,
                    amount: split.get("amount").and_then(|v| v.as_f64()).unwrap_or(0.0),
                    description: split.get("description").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                })
            })
            .collect();
        (!valid.is_empty()).then_some(valid)
    });

    ReviewSuggestion {
        suggestions,
        overall_confidence: data["overall_confidence"].as_f64().unwrap_or(0.0) as f32,
        analysis_notes: data["analysis_notes"].as_str().unwrap_or_default().to_string(),
        model,
        from_cache: false,
        split_transactions,
    }
}

fn deserialize_review(data: &serde_json::Value, model: String, from_cache: bool) -> ReviewSuggestion {
    let mut suggestion = build_review_suggestion(data, model, &[]);
    suggestion.from_cache = from_cache;
    suggestion
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lk_store::SqliteStore;
    use pretty_assertions::assert_eq;

    use super::*;

    async fn service(
        config: LlmConfig,
        categories: Vec<String>,
    ) -> (Arc<SqliteStore>, Arc<MockLlmBackend>, LlmService<SqliteStore, MockLlmBackend>) {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
        let backend = MockLlmBackend::shared();
        let service = LlmService::new(store.clone(), backend.clone(), config, categories);
        (store, backend, service)
    }

    fn enabled_config() -> LlmConfig {
        LlmConfig {
            enabled: true,
            model_fast: "fast-model".into(),
            model_fallback: Some("fallback-model".into()),
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn disabled_service_returns_none_without_calling_backend() {
        let (_store, backend, service) =
            service(LlmConfig { enabled: false, ..enabled_config() }, vec!["Groceries".into()]).await;
        let result = service
            .suggest_category("10.00", "2025-01-01", Some("Shop"), None, false, true)
            .await
            .expect("suggest_category ok");
        assert!(result.is_none());
        assert!(backend.calls().await.is_empty());
        assert_eq!(service.active_requests(), 0);
    }

    #[tokio::test]
    async fn opted_out_document_returns_none_without_calling_backend() {
        let (_store, backend, service) = service(enabled_config(), vec!["Groceries".into()]).await;
        let result = service
            .suggest_category("10.00", "2025-01-01", Some("Shop"), None, true, true)
            .await
            .expect("suggest_category ok");
        assert!(result.is_none());
        assert!(backend.calls().await.is_empty());
    }

    #[tokio::test]
    async fn category_suggestion_falls_back_after_fast_model_failure() {
        let (_store, backend, service) = service(enabled_config(), vec!["Groceries".into()]).await;
        backend.push("fast-model", Err(LlmError::Connection("timed out".into()))).await;
        backend
            .push(
                "fallback-model",
                Ok(r#"{"category": "Groceries", "confidence": 0.92, "reason": "matches vendor"}"#.into()),
            )
            .await;

        let suggestion = service
            .suggest_category("42.10", "2025-02-01", Some("Corner Shop"), None, false, true)
            .await
            .expect("suggest_category ok")
            .expect("suggestion present");

        assert_eq!(suggestion.category, "Groceries");
        assert_eq!(suggestion.model, "fallback-model");
        assert!(!suggestion.from_cache);
        let calls = backend.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "fast-model");
        assert_eq!(calls[1].0, "fallback-model");
    }

    #[tokio::test]
    async fn category_suggestion_second_call_hits_cache() {
        let (_store, backend, service) = service(enabled_config(), vec!["Groceries".into()]).await;
        backend
            .push("fast-model", Ok(r#"{"category": "Groceries", "confidence": 0.8, "reason": "ok"}"#.into()))
            .await;

        let first = service
            .suggest_category("9.50", "2025-03-01", Some("Market"), None, false, true)
            .await
            .expect("ok")
            .expect("present");
        assert!(!first.from_cache);

        let second = service
            .suggest_category("9.50", "2025-03-01", Some("Market"), None, false, true)
            .await
            .expect("ok")
            .expect("present");
        assert!(second.from_cache);
        assert_eq!(backend.calls().await.len(), 1);
    }

    #[tokio::test]
    async fn lenient_json_recovers_markdown_fenced_object() {
        let content = "```json\n{\"category\": \"Utilities\", \"confidence\": 0.7, \"reason\": \"bill\"}\n```";
        let value = parse_lenient_json(content).expect("parses");
        assert_eq!(value["category"], "Utilities");
    }

    #[tokio::test]
    async fn lenient_json_scrapes_key_value_pairs_as_last_resort() {
        let content = "here is the answer: category: \"Travel\" confidence: 0.42 reason: \"flight booking\" and some trailing prose";
        let value = parse_lenient_json(content).expect("parses via scrape");
        assert_eq!(value["category"], "Travel");
        assert!((value["confidence"].as_f64().unwrap() - 0.42).abs() < 1e-9);
    }

    #[tokio::test]
    async fn lenient_json_extracts_array_as_splits() {
        let content = "Sure, here are the splits:\n[{\"category\": \"Food\", \"amount\": 12.5, \"description\": \"lunch\"}]";
        let value = parse_lenient_json(content).expect("parses");
        assert_eq!(value["should_split"], true);
        assert_eq!(value["splits"][0]["category"], "Food");
    }

    #[test]
    fn category_matching_falls_back_to_word_overlap() {
        let categories = vec!["Home Improvement".to_string(), "Groceries".to_string()];
        assert_eq!(match_category("improvement supplies", &categories), Some("Home Improvement".to_string()));
        assert_eq!(match_category("Unrelated Nonsense", &categories), None);
    }

    #[tokio::test]
    async fn calibration_gates_auto_apply_until_threshold() {
        let (store, _backend, service) =
            service(LlmConfig { calibration_count: 2, ..enabled_config() }, vec!["Groceries".into()]).await;

        assert!(service.is_calibrating().await.expect("ok"));
        assert!(!service.should_auto_apply(0.99).await.expect("ok"));

        for i in 0..2 {
            store
                .set_llm_cache(LlmCacheRow {
                    cache_key: format!("k{i}"),
                    model_name: "fast-model".into(),
                    prompt_version: PROMPT_VERSION.into(),
                    taxonomy_version: "t".into(),
                    response_text: "{}".into(),
                    hit_count: 0,
                    expires_at: Utc::now() + Duration::from_secs(60),
                })
                .await
                .expect("seed cache");
        }

        assert!(!service.is_calibrating().await.expect("ok"));
        assert!(service.should_auto_apply(0.95).await.expect("ok"));
        assert!(!service.should_auto_apply(0.5).await.expect("ok"));
    }

    #[tokio::test]
    async fn process_next_job_skips_opted_out_document_without_network_call() {
        let (store, backend, service) = service(enabled_config(), vec!["Groceries".into()]).await;
        store
            .upsert_document(sample_document(), None)
            .await
            .expect("seed document");
        let mut extraction = sample_extraction_row();
        extraction.llm_opt_out = true;
        store.save_extraction(extraction).await.expect("seed extraction");
        service
            .schedule_job("doc-1".into(), None, None, 0, Some("AUTO".into()))
            .await
            .expect("schedule job");

        let processed = service
            .process_next_job(|_job| async { Ok(Some(serde_json::json!({"never": "reached"}))) })
            .await
            .expect("process ok")
            .expect("a job ran");

        let jobs = store.list_ai_jobs(Some(AiJobStatus::Completed)).await.expect("list jobs");
        let job = jobs.into_iter().find(|j| j.id == processed).expect("job present");
        assert_eq!(job.suggestions_json.as_deref(), Some(r#"{"reason":"AI opted out for this document","skipped":true}"#));
        assert!(backend.calls().await.is_empty());
        assert_eq!(service.active_requests(), 0);
    }

    #[tokio::test]
    async fn process_next_job_retries_on_failure_then_fails_terminally() {
        let (store, _backend, service) = service(enabled_config(), vec!["Groceries".into()]).await;
        store.upsert_document(sample_document(), None).await.expect("seed document");
        store.save_extraction(sample_extraction_row()).await.expect("seed extraction");
        let job_id = service
            .schedule_job("doc-1".into(), None, None, 0, Some("AUTO".into()))
            .await
            .expect("schedule job");

        for _ in 0..3 {
            service
                .process_next_job(|_job| async { Err(LlmError::Parse("malformed".into())) })
                .await
                .expect("process ok");
        }

        let jobs = store.list_ai_jobs(Some(AiJobStatus::Failed)).await.expect("list jobs");
        assert!(jobs.iter().any(|j| j.id == job_id));
    }

    fn sample_document() -> lk_record::Document {
        lk_record::Document {
            document_id: "doc-1".into(),
            source_hash: "h".repeat(64),
            title: "Invoice".into(),
            document_type: "invoice".into(),
            correspondent: "Acme".into(),
            tags: Vec::new(),
            first_seen: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    fn sample_extraction_row() -> lk_store::ExtractionRow {
        lk_store::ExtractionRow {
            id: "ext-1".into(),
            document_id: "doc-1".into(),
            external_id: "ext-1".into(),
            record: sample_record(),
            overall_confidence: 0.9,
            review_state: lk_store::ReviewState::Auto,
            created_at: Utc::now(),
            reviewed_at: None,
            review_decision: None,
            llm_opt_out: false,
            owner_user_id: None,
        }
    }

    fn sample_record() -> lk_record::CanonicalRecord {
        lk_record::CanonicalRecord {
            document_id: "doc-1".into(),
            source_hash: "h".repeat(64),
            document_url: "https://dms.example/doc-1".into(),
            raw_text: "invoice text".into(),
            proposal: lk_record::Proposal {
                transaction_type: lk_record::TransactionType::Withdrawal,
                date: chrono::NaiveDate::from_ymd_opt(2025, 2, 1).expect("valid date"),
                amount: lk_record::Money::from_minor(4_210).expect("valid amount"),
                currency: "USD".into(),
                description: "Corner Shop".into(),
                source_account: None,
                destination_account: Some("Corner Shop".into()),
                category: None,
                tags: Vec::new(),
                notes: None,
                external_id: "ext-1".into(),
                invoice_number: None,
                due_date: None,
                tax_total: None,
            },
            field_confidence: lk_record::FieldConfidence::default(),
            provenance: lk_record::Provenance {
                source_system: "test".into(),
                parser_version: "1".into(),
                parsed_at: Utc::now(),
                extraction_strategy: "test".into(),
            },
            classification: None,
            line_items: Vec::new(),
        }
    }
}
