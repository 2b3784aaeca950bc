//! Nintendo store listings: product arrays embedded in HTML, either in the
//! `__NEXT_DATA__` blob or in JSON-LD `Product` / `VideoGame` blocks.

use async_trait::async_trait;
use catalog_core::{json_scalar_string, RawRecord};
use catalog_storage::{FetchRequest, HttpFetcher};
use scraper::{Html, Selector};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

use crate::{page_index, AdapterContext, AdapterError, Crawlability, Page, SourceAdapter};

const STORE_ORIGIN: &str = "https://www.nintendo.com";
const PRODUCT_ARRAY_KEYS: [&str; 4] = ["products", "items", "results", "tiles"];
const TITLE_KEYS: [&str; 3] = ["title", "name", "productTitle"];
const ID_KEYS: [&str; 6] = ["nsuid", "id", "productId", "productID", "sku", "mpn"];
const URL_KEYS: [&str; 4] = ["productUrl", "url", "webUrl", "href"];
const JSON_LD_TYPES: [&str; 2] = ["product", "videogame"];

/// The full games listing plus the filtered views that surface titles the
/// unfiltered grid pages past.
pub const NINTENDO_SEED_PAGES: [&str; 5] = [
    "https://www.nintendo.com/us/store/games/",
    "https://www.nintendo.com/us/store/games/?f=available-now",
    "https://www.nintendo.com/us/store/games/?f=on-sale",
    "https://www.nintendo.com/us/store/games/?f=new-releases",
    "https://www.nintendo.com/us/store/games/?f=coming-soon",
];

/// Walks a fixed list of seed listing pages; the cursor is the seed index.
#[derive(Debug, Clone)]
pub struct NintendoHtmlAdapter {
    source_id: String,
    seed_pages: Vec<String>,
}

impl NintendoHtmlAdapter {
    pub fn new(source_id: impl Into<String>, seed_pages: Vec<String>) -> Self {
        Self {
            source_id: source_id.into(),
            seed_pages,
        }
    }

    pub fn with_default_seeds(source_id: impl Into<String>) -> Self {
        Self::new(
            source_id,
            NINTENDO_SEED_PAGES.iter().map(|url| url.to_string()).collect(),
        )
    }

    pub fn seed_pages(&self) -> &[String] {
        &self.seed_pages
    }
}

#[async_trait]
impl SourceAdapter for NintendoHtmlAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::PublicHtml
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        cursor: Option<&str>,
    ) -> Result<Page, AdapterError> {
        let index = page_index(cursor)?;
        let Some(url) = self.seed_pages.get(index) else {
            return Ok(Page::default());
        };
        let request = FetchRequest::get(url.clone()).header("Accept", "text/html");
        let response = http.fetch_until(&self.source_id, &request, &ctx.cancel).await?;
        let records = parse_listing_html(&self.source_id, &response.text())?;
        debug!(source_id = %self.source_id, url = %url, records = records.len(), "parsed listing page");

        let next_cursor = (index + 1 < self.seed_pages.len()).then(|| (index + 1).to_string());
        Ok(Page {
            records,
            next_cursor,
        })
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn script_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .map(|n| n.text().collect::<String>())
        .filter(|text| !text.trim().is_empty())
        .collect())
}

fn has_title(obj: &Map<String, JsonValue>) -> bool {
    TITLE_KEYS
        .iter()
        .any(|key| obj.get(*key).and_then(JsonValue::as_str).is_some_and(|s| !s.trim().is_empty()))
}

fn collect_next_data_products(value: &JsonValue, out: &mut Vec<Map<String, JsonValue>>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                if PRODUCT_ARRAY_KEYS.contains(&key.as_str()) {
                    if let JsonValue::Array(items) = child {
                        let products = items
                            .iter()
                            .filter_map(JsonValue::as_object)
                            .filter(|obj| has_title(obj))
                            .cloned()
                            .collect::<Vec<_>>();
                        if !products.is_empty() {
                            out.extend(products);
                            continue;
                        }
                    }
                }
                collect_next_data_products(child, out);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                collect_next_data_products(item, out);
            }
        }
        _ => {}
    }
}

fn is_json_ld_product(obj: &Map<String, JsonValue>) -> bool {
    let matches = |t: &str| JSON_LD_TYPES.contains(&t.to_ascii_lowercase().as_str());
    match obj.get("@type") {
        Some(JsonValue::String(t)) => matches(t),
        Some(JsonValue::Array(types)) => types.iter().filter_map(JsonValue::as_str).any(matches),
        _ => false,
    }
}

fn collect_json_ld_products(value: &JsonValue, out: &mut Vec<Map<String, JsonValue>>) {
    match value {
        JsonValue::Array(blocks) => {
            for block in blocks {
                collect_json_ld_products(block, out);
            }
        }
        JsonValue::Object(obj) => {
            if let Some(graph) = obj.get("@graph") {
                collect_json_ld_products(graph, out);
            } else if is_json_ld_product(obj) && has_title(obj) {
                out.push(obj.clone());
            }
        }
        _ => {}
    }
}

fn absolute_url(raw: &str) -> String {
    if raw.starts_with('/') {
        format!("{STORE_ORIGIN}{raw}")
    } else {
        raw.to_string()
    }
}

fn product_url(obj: &Map<String, JsonValue>) -> Option<String> {
    URL_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(JsonValue::as_str))
        .filter(|s| !s.trim().is_empty())
        .map(absolute_url)
        .or_else(|| {
            obj.get("slug")
                .and_then(JsonValue::as_str)
                .map(|slug| format!("{STORE_ORIGIN}/us/store/products/{slug}/"))
        })
}

fn native_id(source_id: &str, obj: &Map<String, JsonValue>, url: Option<&str>) -> String {
    if let Some(id) = ID_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(json_scalar_string))
    {
        return id;
    }
    let title = TITLE_KEYS
        .iter()
        .find_map(|key| obj.get(*key).and_then(JsonValue::as_str))
        .unwrap_or_default();
    let seed = format!("{source_id}:{}", url.unwrap_or(title));
    Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
}

/// Extract raw product records from a listing page. Pages without embedded product
/// data yield an empty list; malformed JSON blocks are skipped.
pub fn parse_listing_html(source_id: &str, html: &str) -> Result<Vec<RawRecord>, AdapterError> {
    let document = Html::parse_document(html);
    let mut products = Vec::new();

    for text in script_texts(&document, "script#__NEXT_DATA__")? {
        match serde_json::from_str::<JsonValue>(&text) {
            Ok(value) => collect_next_data_products(&value, &mut products),
            Err(err) => debug!(source_id, error = %err, "skipping malformed __NEXT_DATA__"),
        }
    }
    for text in script_texts(&document, r#"script[type="application/ld+json"]"#)? {
        match serde_json::from_str::<JsonValue>(&text) {
            Ok(value) => collect_json_ld_products(&value, &mut products),
            Err(err) => debug!(source_id, error = %err, "skipping malformed JSON-LD block"),
        }
    }

    Ok(products
        .into_iter()
        .map(|obj| {
            let url = product_url(&obj);
            let id = native_id(source_id, &obj, url.as_deref());
            let mut record = RawRecord::new(source_id, id, obj);
            record.source_url = url;
            record
        })
        .collect())
}
