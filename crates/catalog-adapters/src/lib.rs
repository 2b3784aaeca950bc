//! Source adapter contracts plus the JSON API, HTML and fixture-backed implementations.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use catalog_core::{json_path, json_scalar_string, RawRecord};
use catalog_storage::{FetchError, FetchRequest, HttpFetcher};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub mod nintendo;

pub use nintendo::{parse_listing_html, NintendoHtmlAdapter, NINTENDO_SEED_PAGES};

pub const CRATE_NAME: &str = "catalog-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crawlability {
    Api,
    PublicHtml,
    Fixture,
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    /// Fires when the run is shutting down; fetches stop retrying once it does.
    pub cancel: CancellationToken,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// One page of raw listings. `next_cursor == None` ends pagination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected payload from {source_id}: {message}")]
    Payload { source_id: String, message: String },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    fn payload(source_id: &str, message: impl Into<String>) -> Self {
        Self::Payload {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fetch(FetchError::Cancelled))
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn crawlability(&self) -> Crawlability;

    /// Fetch the page addressed by `cursor` (`None` for the first page).
    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: Option<&str>,
    ) -> Result<Page, AdapterError>;
}

fn first_scalar(value: &JsonValue, paths: &[String]) -> Option<String> {
    paths
        .iter()
        .find_map(|path| json_path(value, path).and_then(json_scalar_string))
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn page_index(cursor: Option<&str>) -> Result<usize, AdapterError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| AdapterError::Message(format!("invalid page cursor {raw:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pagination {
    /// `{offset}` / `{count}` placeholders; a short page ends the listing.
    Offset { page_size: usize },
    /// Opaque continuation token read from the response body, sent back as `{cursor}`.
    CursorField { path: String },
    Single,
}

#[derive(Debug, Clone)]
pub struct JsonApiAdapter {
    source_id: String,
    url_template: String,
    items_path: String,
    id_paths: Vec<String>,
    url_paths: Vec<String>,
    pagination: Pagination,
    headers: Vec<(String, String)>,
}

impl JsonApiAdapter {
    pub fn new(
        source_id: impl Into<String>,
        url_template: impl Into<String>,
        items_path: impl Into<String>,
        pagination: Pagination,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            url_template: url_template.into(),
            items_path: items_path.into(),
            id_paths: vec!["id".to_string()],
            url_paths: vec!["url".to_string()],
            pagination,
            headers: vec![("Accept".to_string(), "application/json".to_string())],
        }
    }

    pub fn with_id_paths(mut self, paths: &[&str]) -> Self {
        self.id_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_url_paths(mut self, paths: &[&str]) -> Self {
        self.url_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn page_url(&self, cursor: Option<&str>) -> Result<String, AdapterError> {
        let url = match &self.pagination {
            Pagination::Offset { page_size } => {
                let offset = page_index(cursor)?;
                self.url_template
                    .replace("{offset}", &offset.to_string())
                    .replace("{count}", &page_size.to_string())
            }
            Pagination::CursorField { .. } => {
                self.url_template.replace("{cursor}", cursor.unwrap_or(""))
            }
            Pagination::Single => self.url_template.clone(),
        };
        Ok(url)
    }

    /// Turn one response body into a page. Items without a native id are skipped.
    pub fn parse_page(&self, body: &[u8], cursor: Option<&str>) -> Result<Page, AdapterError> {
        let doc: JsonValue = serde_json::from_slice(body)
            .map_err(|e| AdapterError::payload(&self.source_id, e.to_string()))?;
        let items: &[JsonValue] = match json_path(&doc, &self.items_path) {
            Some(JsonValue::Array(items)) => items.as_slice(),
            Some(JsonValue::Null) | None => &[],
            Some(_) => {
                return Err(AdapterError::payload(
                    &self.source_id,
                    format!("`{}` is not an array", self.items_path),
                ))
            }
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let JsonValue::Object(payload) = item else {
                continue;
            };
            let Some(native_id) = first_scalar(item, &self.id_paths) else {
                warn!(source_id = %self.source_id, "listing item without native id skipped");
                continue;
            };
            let mut record = RawRecord::new(self.source_id.clone(), native_id, payload.clone());
            record.source_url = first_scalar(item, &self.url_paths);
            records.push(record);
        }

        let next_cursor = match &self.pagination {
            Pagination::Offset { page_size } => {
                let offset = page_index(cursor)?;
                (*page_size > 0 && items.len() >= *page_size)
                    .then(|| (offset + items.len()).to_string())
            }
            Pagination::CursorField { path } => json_path(&doc, path)
                .and_then(json_scalar_string)
                .filter(|next| Some(next.as_str()) != cursor),
            Pagination::Single => None,
        };

        Ok(Page {
            records,
            next_cursor,
        })
    }
}

#[async_trait]
impl SourceAdapter for JsonApiAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: Option<&str>,
    ) -> Result<Page, AdapterError> {
        let url = self.page_url(cursor)?;
        let request = self
            .headers
            .iter()
            .fold(FetchRequest::get(url), |req, (name, value)| {
                req.header(name.clone(), value.clone())
            });
        let response = http.fetch_until(&self.source_id, &request, &ctx.cancel).await?;
        self.parse_page(&response.body, cursor)
    }
}

pub const STEAM_LISTING_URL: &str =
    "https://store.steampowered.com/search/results/?json=1&start={offset}&count={count}&cc=us&l=english";
pub const PSN_LISTING_URL: &str =
    "https://store.playstation.com/api/graphql/v1/op?operationName=categoryGridRetrieve&offset={offset}&size={count}";
pub const XBOX_LISTING_URL: &str =
    "https://emerald.xboxservices.com/xboxcomfd/browse?locale=en-US&continuationToken={cursor}";

pub fn steam_adapter(url_template: &str, page_size: usize) -> JsonApiAdapter {
    JsonApiAdapter::new(
        "steam",
        url_template,
        "items",
        Pagination::Offset { page_size },
    )
    .with_id_paths(&["appid", "id"])
    .with_url_paths(&["url", "store_url"])
}

pub fn psn_adapter(url_template: &str, page_size: usize) -> JsonApiAdapter {
    JsonApiAdapter::new(
        "psn",
        url_template,
        "data.categoryGridRetrieve.products",
        Pagination::Offset { page_size },
    )
    .with_id_paths(&["id", "npTitleId"])
    .with_url_paths(&["storeUrl", "url"])
    .with_header("x-psn-store-locale-override", "en-US")
}

pub fn xbox_adapter(url_template: &str) -> JsonApiAdapter {
    JsonApiAdapter::new(
        "xbox",
        url_template,
        "productSummaries",
        Pagination::CursorField {
            path: "continuationToken".to_string(),
        },
    )
    .with_id_paths(&["productId", "ProductId"])
    .with_url_paths(&["productUrl", "url"])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub source_id: String,
    #[serde(default)]
    pub captured_from_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    pub pages: Vec<FixturePage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub records: Vec<FixtureRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub source_native_id: String,
    #[serde(default)]
    pub source_url: Option<String>,
    pub payload: Map<String, JsonValue>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let bundle: FixtureBundle = read_json_file(path)?;
    if bundle.pages.is_empty() {
        debug!(path = %path.display(), "fixture bundle has no pages");
    }
    Ok(bundle)
}

/// Replays captured pages without touching the network.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source_id: String,
    bundle: FixtureBundle,
}

impl FixtureAdapter {
    pub fn new(source_id: impl Into<String>, bundle: FixtureBundle) -> Self {
        Self {
            source_id: source_id.into(),
            bundle,
        }
    }

    pub fn from_path(source_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(source_id, load_fixture_bundle(path)?))
    }

    pub fn page_count(&self) -> usize {
        self.bundle.pages.len()
    }
}

#[async_trait]
impl SourceAdapter for FixtureAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Fixture
    }

    async fn fetch_page(
        &self,
        _http: &HttpFetcher,
        _ctx: &AdapterContext,
        cursor: Option<&str>,
    ) -> Result<Page, AdapterError> {
        let index = page_index(cursor)?;
        let Some(page) = self.bundle.pages.get(index) else {
            return Ok(Page::default());
        };
        let records = page
            .records
            .iter()
            .map(|r| {
                let mut record = RawRecord::new(
                    self.source_id.clone(),
                    r.source_native_id.clone(),
                    r.payload.clone(),
                );
                record.source_url = r.source_url.clone();
                record
            })
            .collect();
        let next_cursor = (index + 1 < self.bundle.pages.len()).then(|| (index + 1).to_string());
        Ok(Page {
            records,
            next_cursor,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSettings {
    pub source_id: String,
    pub crawlability: Crawlability,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page_size() -> usize {
    50
}

pub fn default_fixture_path(workspace_root: &Path, source_id: &str) -> PathBuf {
    workspace_root
        .join("fixtures")
        .join(source_id)
        .join("pages.json")
}

/// Build the adapter a configured source asks for. Relative fixture paths resolve
/// against `workspace_root`.
pub fn adapter_for_source(
    settings: &AdapterSettings,
    workspace_root: &Path,
) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    let id = settings.source_id.as_str();
    let first_url = |fallback: &str| {
        settings
            .listing_urls
            .first()
            .cloned()
            .unwrap_or_else(|| fallback.to_string())
    };

    let adapter: Arc<dyn SourceAdapter> = match settings.crawlability {
        Crawlability::Fixture => {
            let path = match &settings.fixture_path {
                Some(p) if p.is_absolute() => p.clone(),
                Some(p) => workspace_root.join(p),
                None => default_fixture_path(workspace_root, id),
            };
            Arc::new(FixtureAdapter::from_path(id, &path)?)
        }
        Crawlability::Api => match id {
            "steam" => Arc::new(steam_adapter(&first_url(STEAM_LISTING_URL), settings.page_size)),
            "psn" => Arc::new(psn_adapter(&first_url(PSN_LISTING_URL), settings.page_size)),
            "xbox" => Arc::new(xbox_adapter(&first_url(XBOX_LISTING_URL))),
            other => {
                return Err(AdapterError::Message(format!(
                    "no API adapter registered for source `{other}`"
                )))
            }
        },
        Crawlability::PublicHtml => match id {
            "nintendo" if settings.listing_urls.is_empty() => {
                Arc::new(NintendoHtmlAdapter::with_default_seeds(id))
            }
            "nintendo" => Arc::new(NintendoHtmlAdapter::new(id, settings.listing_urls.clone())),
            other => {
                return Err(AdapterError::Message(format!(
                    "no HTML adapter registered for source `{other}`"
                )))
            }
        },
    };
    Ok(adapter)
}
