use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::StackConfig;
use crate::labels::Label;

/// Error code the management API uses for payload validation failures.
/// Duplicate titles and broken references both arrive under this code and are
/// told apart by the details payload.
const INVALID_DATA_CODE: i64 = 119;

const ENTRY_PAGE_SIZE: usize = 100;

/// Any syncable resource record: a server-assigned uid (may be a local
/// placeholder for items not yet created) and a human primary key, with all
/// remaining wire fields riding along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    pub title: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Item {
    pub fn new(uid: &str, title: &str) -> Self {
        Self {
            uid: uid.to_string(),
            title: title.to_string(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// The locale this record belongs to, when the wire payload carries one.
    pub fn locale(&self) -> Option<&str> {
        self.fields.get("locale").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocaleInfo {
    pub code: String,
    pub name: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_locale: Option<String>,
}

/// Resource kinds whose transfer logic is structurally identical: a flat
/// remote collection mirrored as one YAML file per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResourceKind {
    GlobalField,
    Taxonomy,
    Asset,
    ContentType,
}

impl ResourceKind {
    /// Dependency order for sync passes: content types come last because
    /// their schemas reference global fields and taxonomies.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::GlobalField,
        ResourceKind::Taxonomy,
        ResourceKind::Asset,
        ResourceKind::ContentType,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Self::GlobalField => "global_fields",
            Self::Taxonomy => "taxonomies",
            Self::Asset => "assets",
            Self::ContentType => "content_types",
        }
    }

    /// Plural envelope key in list responses.
    pub fn envelope(self) -> &'static str {
        self.path()
    }

    /// Singular envelope key in item requests/responses.
    pub fn singular(self) -> &'static str {
        match self {
            Self::GlobalField => "global_field",
            Self::Taxonomy => "taxonomy",
            Self::Asset => "asset",
            Self::ContentType => "content_type",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            Self::GlobalField => "global-fields",
            Self::Taxonomy => "taxonomies",
            Self::Asset => "assets",
            Self::ContentType => "content-types",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::GlobalField => "Global Fields",
            Self::Taxonomy => "Taxonomies",
            Self::Asset => "Assets",
            Self::ContentType => "Content Types",
        }
    }
}

/// Errors crossing the management API boundary. Duplicate-title and
/// invalid-reference conditions are decided here, once, so callers match on a
/// variant instead of sniffing codes and payload shapes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("remote reported a duplicate title for {key}")]
    DuplicateTitle { key: String, details: Value },
    #[error("remote rejected {key} for an invalid reference: {detail}")]
    InvalidReference { key: String, detail: String },
    #[error("management API error [{code}]: {message}")]
    Api {
        code: i64,
        message: String,
        details: Value,
    },
    #[error("management API request failed with HTTP {status}")]
    Http { status: StatusCode },
    #[error("failed to call management API")]
    Transport(#[from] reqwest::Error),
    #[error("failed to decode management API response: {0}")]
    Decode(String),
}

/// The narrow remote-store contract the sync core needs. Implemented by the
/// HTTP client and by in-memory mocks in tests.
#[async_trait]
pub trait CmsApi: Send + Sync {
    async fn get_items(&self, kind: ResourceKind) -> Result<Vec<Item>, ApiError>;
    async fn create_item(&self, kind: ResourceKind, item: &Item) -> Result<Item, ApiError>;
    async fn update_item(
        &self,
        kind: ResourceKind,
        uid: &str,
        item: &Item,
    ) -> Result<Item, ApiError>;
    async fn delete_item(&self, kind: ResourceKind, uid: &str) -> Result<(), ApiError>;

    async fn get_labels(&self) -> Result<Vec<Label>, ApiError>;
    async fn create_label(&self, label: &Label) -> Result<Label, ApiError>;
    async fn update_label(&self, uid: &str, label: &Label) -> Result<Label, ApiError>;
    async fn delete_label(&self, uid: &str) -> Result<(), ApiError>;

    async fn get_entries(&self, content_type_uid: &str) -> Result<Vec<Item>, ApiError>;
    async fn get_entry(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
        locale: Option<&str>,
    ) -> Result<Item, ApiError>;
    async fn get_entry_locales(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
    ) -> Result<Vec<LocaleInfo>, ApiError>;
    /// Create or overwrite one locale version of an entry. `locale` of `None`
    /// targets the default locale via the import endpoint; a locale code
    /// targets the localization endpoint and requires `entry.uid`.
    async fn import_entry(
        &self,
        content_type_uid: &str,
        entry: &Item,
        overwrite: bool,
        locale: Option<&str>,
    ) -> Result<Item, ApiError>;
    async fn delete_entry(&self, content_type_uid: &str, entry_uid: &str)
    -> Result<(), ApiError>;

    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct CmsClientConfig {
    pub api_url: String,
    pub api_key: String,
    pub management_token: String,
    pub branch: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl CmsClientConfig {
    pub fn from_config(config: &StackConfig) -> anyhow::Result<Self> {
        let api_url = config
            .api_url()
            .ok_or_else(|| anyhow::anyhow!("missing API URL (set STACKSYNC_API_URL)"))?;
        let api_key = config
            .api_key()
            .ok_or_else(|| anyhow::anyhow!("missing API key (set STACKSYNC_API_KEY)"))?;
        let management_token = config
            .management_token()
            .ok_or_else(|| anyhow::anyhow!("missing management token (set STACKSYNC_TOKEN)"))?;
        Ok(Self {
            api_url,
            api_key,
            management_token,
            branch: config.branch(),
            user_agent: config.user_agent(),
            timeout_ms: 30_000,
            rate_limit_ms: 150,
            max_retries: 2,
            retry_delay_ms: 500,
        })
    }
}

pub struct HttpCmsClient {
    client: Client,
    config: CmsClientConfig,
    last_request_at: Mutex<Option<Instant>>,
    request_count: AtomicUsize,
}

impl HttpCmsClient {
    pub fn new(config: CmsClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            config,
            last_request_at: Mutex::new(None),
            request_count: AtomicUsize::new(0),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let base = format!("{}/v3/{}", self.config.api_url.trim_end_matches('/'), path);
        Url::parse(&base).map_err(|_| ApiError::Decode(format!("invalid API URL: {base}")))
    }

    async fn apply_rate_limit(&self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        let mut last = self.last_request_at.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < delay {
                tokio::time::sleep(delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    async fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(base.saturating_add(jitter))).await;
    }

    /// One paced, retried JSON exchange. HTTP-level failures are retried;
    /// API-level errors in the payload are left for `take_api_error` so the
    /// caller can attach the item key.
    async fn request_json(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(path)?;

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit().await;
            let mut request = self
                .client
                .request(method.clone(), url.clone())
                .header("api_key", &self.config.api_key)
                .header("authorization", &self.config.management_token)
                .header("branch", &self.config.branch)
                .header("User-Agent", &self.config.user_agent)
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt).await;
                            continue;
                        }
                        // Error payloads still carry a useful code/message.
                        if let Ok(payload) = response.json::<Value>().await
                            && payload.get("error_code").is_some()
                        {
                            return Ok(payload);
                        }
                        return Err(ApiError::Http { status });
                    }
                    return response
                        .json::<Value>()
                        .await
                        .map_err(|error| ApiError::Decode(error.to_string()));
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt).await;
                        continue;
                    }
                    return Err(ApiError::Transport(error));
                }
            }
        }

        Err(ApiError::Decode(
            "management API request exhausted retry budget".to_string(),
        ))
    }

    fn decode<T: serde::de::DeserializeOwned>(
        payload: &Value,
        envelope: &str,
    ) -> Result<T, ApiError> {
        let inner = payload
            .get(envelope)
            .ok_or_else(|| ApiError::Decode(format!("missing `{envelope}` in API response")))?;
        serde_json::from_value(inner.clone()).map_err(|error| ApiError::Decode(error.to_string()))
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect()
}

/// Classify an API error payload, attaching the item key the caller was
/// operating on. Returns `None` when the payload reports no error.
fn take_api_error(payload: &Value, key: &str) -> Option<ApiError> {
    let code = payload.get("error_code")?.as_i64()?;
    let message = payload
        .get("error_message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let details = payload.get("errors").cloned().unwrap_or(Value::Null);

    if code == INVALID_DATA_CODE {
        if details.get("title") == Some(&json!(["is not unique."])) {
            return Some(ApiError::DuplicateTitle {
                key: key.to_string(),
                details,
            });
        }
        if let Some(detail) = invalid_reference_detail(&details) {
            return Some(ApiError::InvalidReference {
                key: key.to_string(),
                detail,
            });
        }
    }

    Some(ApiError::Api {
        code,
        message,
        details,
    })
}

fn invalid_reference_detail(details: &Value) -> Option<String> {
    let map = details.as_object()?;
    for value in map.values() {
        let Some(items) = value.as_array() else {
            continue;
        };
        for item in items {
            if let Some(text) = item.as_str()
                && (text.contains("is not valid") || text.contains("Invalid reference"))
            {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn check(payload: &Value, key: &str) -> Result<(), ApiError> {
    match take_api_error(payload, key) {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

#[async_trait]
impl CmsApi for HttpCmsClient {
    async fn get_items(&self, kind: ResourceKind) -> Result<Vec<Item>, ApiError> {
        let payload = self
            .request_json(Method::GET, kind.path(), &[], None)
            .await?;
        check(&payload, kind.display_name())?;
        Self::decode(&payload, kind.envelope())
    }

    async fn create_item(&self, kind: ResourceKind, item: &Item) -> Result<Item, ApiError> {
        let body = json!({ kind.singular(): item });
        let payload = self
            .request_json(Method::POST, kind.path(), &[], Some(&body))
            .await?;
        check(&payload, &item.title)?;
        Self::decode(&payload, kind.singular())
    }

    async fn update_item(
        &self,
        kind: ResourceKind,
        uid: &str,
        item: &Item,
    ) -> Result<Item, ApiError> {
        let body = json!({ kind.singular(): item });
        let path = format!("{}/{uid}", kind.path());
        let payload = self
            .request_json(Method::PUT, &path, &[], Some(&body))
            .await?;
        check(&payload, &item.title)?;
        Self::decode(&payload, kind.singular())
    }

    async fn delete_item(&self, kind: ResourceKind, uid: &str) -> Result<(), ApiError> {
        let path = format!("{}/{uid}", kind.path());
        let payload = self
            .request_json(Method::DELETE, &path, &[], None)
            .await?;
        check(&payload, uid)
    }

    async fn get_labels(&self) -> Result<Vec<Label>, ApiError> {
        let payload = self.request_json(Method::GET, "labels", &[], None).await?;
        check(&payload, "labels")?;
        Self::decode(&payload, "labels")
    }

    async fn create_label(&self, label: &Label) -> Result<Label, ApiError> {
        let body = json!({ "label": label });
        let payload = self
            .request_json(Method::POST, "labels", &[], Some(&body))
            .await?;
        check(&payload, &label.name)?;
        Self::decode(&payload, "label")
    }

    async fn update_label(&self, uid: &str, label: &Label) -> Result<Label, ApiError> {
        let body = json!({ "label": label });
        let path = format!("labels/{uid}");
        let payload = self
            .request_json(Method::PUT, &path, &[], Some(&body))
            .await?;
        check(&payload, &label.name)?;
        Self::decode(&payload, "label")
    }

    async fn delete_label(&self, uid: &str) -> Result<(), ApiError> {
        let path = format!("labels/{uid}");
        let payload = self
            .request_json(Method::DELETE, &path, &[], None)
            .await?;
        check(&payload, uid)
    }

    async fn get_entries(&self, content_type_uid: &str) -> Result<Vec<Item>, ApiError> {
        let path = format!("content_types/{content_type_uid}/entries");
        let mut entries = Vec::new();
        let mut skip = 0usize;

        loop {
            let query = [
                ("include_count", "true".to_string()),
                ("limit", ENTRY_PAGE_SIZE.to_string()),
                ("skip", skip.to_string()),
            ];
            let payload = self
                .request_json(Method::GET, &path, &query, None)
                .await?;
            check(&payload, content_type_uid)?;
            let page: Vec<Item> = Self::decode(&payload, "entries")?;
            let count = payload
                .get("count")
                .and_then(Value::as_u64)
                .map(|value| value as usize)
                .unwrap_or(entries.len() + page.len());
            let page_len = page.len();
            entries.extend(page);
            skip += page_len;
            if page_len == 0 || entries.len() >= count {
                break;
            }
        }

        Ok(entries)
    }

    async fn get_entry(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
        locale: Option<&str>,
    ) -> Result<Item, ApiError> {
        let path = format!("content_types/{content_type_uid}/entries/{entry_uid}");
        let mut query = Vec::new();
        if let Some(locale) = locale {
            query.push(("locale", locale.to_string()));
        }
        let payload = self.request_json(Method::GET, &path, &query, None).await?;
        check(&payload, entry_uid)?;
        Self::decode(&payload, "entry")
    }

    async fn get_entry_locales(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
    ) -> Result<Vec<LocaleInfo>, ApiError> {
        let path = format!("content_types/{content_type_uid}/entries/{entry_uid}/locales");
        let payload = self.request_json(Method::GET, &path, &[], None).await?;
        check(&payload, entry_uid)?;
        Self::decode(&payload, "locales")
    }

    async fn import_entry(
        &self,
        content_type_uid: &str,
        entry: &Item,
        overwrite: bool,
        locale: Option<&str>,
    ) -> Result<Item, ApiError> {
        let body = json!({ "entry": entry });
        let payload = match locale {
            None => {
                let path = format!("content_types/{content_type_uid}/entries/import");
                let query = [("overwrite", overwrite.to_string())];
                self.request_json(Method::POST, &path, &query, Some(&body))
                    .await?
            }
            Some(locale) => {
                if entry.uid.is_empty() {
                    return Err(ApiError::Decode(format!(
                        "entry uid required to localize {} to {locale}",
                        entry.title
                    )));
                }
                let path = format!(
                    "content_types/{content_type_uid}/entries/{}",
                    entry.uid
                );
                let query = [("locale", locale.to_string())];
                self.request_json(Method::PUT, &path, &query, Some(&body))
                    .await?
            }
        };
        check(&payload, &entry.title)?;
        Self::decode(&payload, "entry")
    }

    async fn delete_entry(
        &self,
        content_type_uid: &str,
        entry_uid: &str,
    ) -> Result<(), ApiError> {
        let path = format!("content_types/{content_type_uid}/entries/{entry_uid}");
        let payload = self
            .request_json(Method::DELETE, &path, &[], None)
            .await?;
        check(&payload, entry_uid)
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_title_is_classified_from_code_and_details() {
        let payload = json!({
            "error_code": 119,
            "error_message": "Invalid data.",
            "errors": { "title": ["is not unique."] }
        });
        match take_api_error(&payload, "Home Page") {
            Some(ApiError::DuplicateTitle { key, .. }) => assert_eq!(key, "Home Page"),
            other => panic!("expected DuplicateTitle, got {other:?}"),
        }
    }

    #[test]
    fn invalid_reference_is_classified_from_details_text() {
        let payload = json!({
            "error_code": 119,
            "error_message": "Invalid data.",
            "errors": { "related": ["Invalid reference provided."] }
        });
        match take_api_error(&payload, "Home Page") {
            Some(ApiError::InvalidReference { key, detail }) => {
                assert_eq!(key, "Home Page");
                assert!(detail.contains("Invalid reference"));
            }
            other => panic!("expected InvalidReference, got {other:?}"),
        }
    }

    #[test]
    fn other_codes_stay_generic() {
        let payload = json!({
            "error_code": 422,
            "error_message": "Something else.",
            "errors": { "title": ["is not unique."] }
        });
        match take_api_error(&payload, "Home Page") {
            Some(ApiError::Api { code, .. }) => assert_eq!(code, 422),
            other => panic!("expected Api, got {other:?}"),
        }
    }

    #[test]
    fn clean_payload_reports_no_error() {
        let payload = json!({ "entry": { "title": "Home", "uid": "blt1" } });
        assert!(take_api_error(&payload, "Home").is_none());
    }

    #[test]
    fn item_locale_reads_wire_field() {
        let item = Item::new("blt1", "Home").with_field("locale", json!("fr-fr"));
        assert_eq!(item.locale(), Some("fr-fr"));
        assert_eq!(Item::new("blt1", "Home").locale(), None);
    }
}
