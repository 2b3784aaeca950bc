//! Core domain model for the game store catalog: raw adapter payloads, normalized
//! records, clusters and the shard partitioning rule.

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

pub const CRATE_NAME: &str = "catalog-core";

/// Catch-all shard for canonical titles that do not start with `a`-`z`.
pub const CATCH_ALL_SHARD: char = '!';

/// Source-specific payload as emitted by an adapter. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source: String,
    pub source_native_id: String,
    pub source_url: Option<String>,
    pub payload: Map<String, JsonValue>,
}

impl RawRecord {
    pub fn new(
        source: impl Into<String>,
        source_native_id: impl Into<String>,
        payload: Map<String, JsonValue>,
    ) -> Self {
        Self {
            source: source.into(),
            source_native_id: source_native_id.into(),
            source_url: None,
            payload,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.source, &self.source_native_id)
    }

    /// Resolve a dotted path (`price_overview.final`, `images.0.url`) inside the payload.
    pub fn lookup(&self, path: &str) -> Option<&JsonValue> {
        match path.split_once('.') {
            Some((first, rest)) => json_path(self.payload.get(first)?, rest),
            None => self.payload.get(path),
        }
    }
}

/// Walk a dotted path through objects and (numerically indexed) arrays.
/// The empty path resolves to `value` itself.
pub fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |cur, segment| match cur {
        JsonValue::Object(map) => map.get(segment),
        JsonValue::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render a scalar JSON value as an identifier string.
pub fn json_scalar_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Identity of a record across the whole pipeline and the staging backend.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub source: String,
    pub source_native_id: String,
}

impl RecordKey {
    pub fn new(source: impl Into<String>, source_native_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            source_native_id: source_native_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.source_native_id)
    }
}

/// Price in integer minor currency units. A free title is `amount_minor == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount_minor: u64,
    pub currency: String,
}

impl Price {
    pub fn new(amount_minor: u64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into(),
        }
    }

    pub fn free(currency: impl Into<String>) -> Self {
        Self::new(0, currency)
    }

    pub fn is_free(&self) -> bool {
        self.amount_minor == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatePrecision {
    Day,
    Month,
    Year,
    Unknown,
}

/// Release date at the granularity the source actually published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "precision", rename_all = "snake_case")]
pub enum ReleaseDate {
    Day { date: NaiveDate },
    Month { year: i32, month: u32 },
    Year { year: i32 },
    #[default]
    Unknown,
}

impl ReleaseDate {
    pub fn day(date: NaiveDate) -> Self {
        Self::Day { date }
    }

    pub fn month(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|_| Self::Month { year, month })
    }

    pub fn year(year: i32) -> Self {
        Self::Year { year }
    }

    pub fn precision(&self) -> DatePrecision {
        match self {
            Self::Day { .. } => DatePrecision::Day,
            Self::Month { .. } => DatePrecision::Month,
            Self::Year { .. } => DatePrecision::Year,
            Self::Unknown => DatePrecision::Unknown,
        }
    }

    pub fn year_value(&self) -> Option<i32> {
        match self {
            Self::Day { date } => Some(date.year()),
            Self::Month { year, .. } | Self::Year { year } => Some(*year),
            Self::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Comparable calendar date. Coarse precisions synthesize the middle of their
    /// period; the synthesized day is never displayed.
    pub fn comparison_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Day { date } => Some(*date),
            Self::Month { year, month } => NaiveDate::from_ymd_opt(*year, *month, 15),
            Self::Year { year } => NaiveDate::from_ymd_opt(*year, 7, 1),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ReleaseDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Day { date } => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Self::Year { year } => write!(f, "{year:04}"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "ps4")]
    PlayStation4,
    #[serde(rename = "ps5")]
    PlayStation5,
    #[serde(rename = "xbox_one")]
    XboxOne,
    #[serde(rename = "xbox_series")]
    XboxSeries,
    #[serde(rename = "switch")]
    Switch,
    #[serde(rename = "windows")]
    Windows,
    #[serde(rename = "macos")]
    MacOs,
    #[serde(rename = "linux")]
    Linux,
    #[serde(rename = "other")]
    Other,
}

impl Platform {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PlayStation4 => "PlayStation 4",
            Self::PlayStation5 => "PlayStation 5",
            Self::XboxOne => "Xbox One",
            Self::XboxSeries => "Xbox Series X|S",
            Self::Switch => "Nintendo Switch",
            Self::Windows => "Windows",
            Self::MacOs => "macOS",
            Self::Linux => "Linux",
            Self::Other => "Other",
        }
    }
}

/// Canonical platform plus the label the source used, so unmapped values survive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLabel {
    pub platform: Platform,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source: String,
    pub source_native_id: String,
    pub source_url: Option<String>,
    /// Display form: decorations removed, case preserved.
    pub title: String,
    /// Comparison form: case-folded, punctuation-free, single-spaced.
    pub title_key: String,
    pub edition: Option<String>,
    pub price: Option<Price>,
    pub release_date: ReleaseDate,
    pub platforms: Vec<PlatformLabel>,
    pub publisher: Option<String>,
    pub developer: Option<String>,
    pub image_url: Option<String>,
    pub rating: Option<String>,
}

impl NormalizedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.source, &self.source_native_id)
    }

    /// Number of populated fields that make a record a good cluster representative.
    pub fn completeness(&self) -> usize {
        [
            self.price.is_some(),
            self.release_date.is_known(),
            self.publisher.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

/// Records judged to be the same product, with the chosen representative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: Uuid,
    pub confidence: f64,
    pub canonical: NormalizedRecord,
    pub members: Vec<NormalizedRecord>,
}

impl Cluster {
    pub fn singleton(record: NormalizedRecord) -> Self {
        Self {
            cluster_id: cluster_id_for(&[record.key()]),
            confidence: 1.0,
            canonical: record.clone(),
            members: vec![record],
        }
    }

    pub fn member_keys(&self) -> Vec<RecordKey> {
        self.members.iter().map(NormalizedRecord::key).collect()
    }
}

/// Deterministic cluster id derived from the (order-independent) member keys.
pub fn cluster_id_for(keys: &[RecordKey]) -> Uuid {
    let mut sorted = keys.iter().map(ToString::to_string).collect::<Vec<_>>();
    sorted.sort();
    Uuid::new_v5(&Uuid::NAMESPACE_OID, sorted.join("\n").as_bytes())
}

/// Shard for a comparison title: its first character when it is `a`-`z`, else `!`.
pub fn shard_key(title_key: &str) -> char {
    match title_key.trim_start().chars().next() {
        Some(ch) if ch.is_ascii_lowercase() => ch,
        _ => CATCH_ALL_SHARD,
    }
}

/// Every shard in output order: `a`..`z` then the catch-all.
pub fn all_shard_keys() -> impl Iterator<Item = char> {
    ('a'..='z').chain(std::iter::once(CATCH_ALL_SHARD))
}

pub fn shard_file_name(key: char) -> String {
    format!("{key}.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(source: &str, id: &str) -> NormalizedRecord {
        NormalizedRecord {
            source: source.to_string(),
            source_native_id: id.to_string(),
            source_url: None,
            title: "Example".to_string(),
            title_key: "example".to_string(),
            edition: None,
            price: None,
            release_date: ReleaseDate::Unknown,
            platforms: Vec::new(),
            publisher: None,
            developer: None,
            image_url: None,
            rating: None,
        }
    }

    #[test]
    fn shard_key_buckets_letters_and_catch_all() {
        assert_eq!(shard_key("zelda"), 'z');
        assert_eq!(shard_key("1942"), '!');
        assert_eq!(shard_key(""), '!');
        assert_eq!(all_shard_keys().count(), 27);
        assert_eq!(all_shard_keys().last(), Some('!'));
    }

    #[test]
    fn coarse_dates_synthesize_comparison_day_only() {
        let year = ReleaseDate::year(2020);
        assert_eq!(year.precision(), DatePrecision::Year);
        assert_eq!(year.comparison_date(), NaiveDate::from_ymd_opt(2020, 7, 1));
        assert_eq!(year.to_string(), "2020");

        let month = ReleaseDate::month(2021, 3).unwrap();
        assert_eq!(month.to_string(), "2021-03");
        assert!(ReleaseDate::month(2021, 13).is_none());
        assert_eq!(ReleaseDate::Unknown.comparison_date(), None);
    }

    #[test]
    fn release_date_serializes_with_precision_tag() {
        let value = serde_json::to_value(ReleaseDate::year(2019)).unwrap();
        assert_eq!(value, json!({"precision": "year", "year": 2019}));
        let unknown = serde_json::to_value(ReleaseDate::Unknown).unwrap();
        assert_eq!(unknown, json!({"precision": "unknown"}));
    }

    #[test]
    fn cluster_id_ignores_member_order() {
        let a = RecordKey::new("steam", "1");
        let b = RecordKey::new("psn", "x");
        assert_eq!(cluster_id_for(&[a.clone(), b.clone()]), cluster_id_for(&[b, a]));
    }

    #[test]
    fn payload_lookup_walks_objects_and_arrays() {
        let payload = json!({"price": {"final": 1999}, "images": [{"url": "https://img"}]});
        let raw = RawRecord::new("steam", "10", payload.as_object().cloned().unwrap());
        assert_eq!(raw.lookup("price.final"), Some(&json!(1999)));
        assert_eq!(raw.lookup("images.0.url"), Some(&json!("https://img")));
        assert_eq!(raw.lookup("price.missing"), None);
    }

    #[test]
    fn completeness_counts_price_date_and_publisher() {
        let mut rec = record("steam", "1");
        assert_eq!(rec.completeness(), 0);
        rec.price = Some(Price::free("USD"));
        rec.release_date = ReleaseDate::year(2020);
        assert_eq!(rec.completeness(), 2);
        assert!(Cluster::singleton(rec).confidence >= 1.0);
    }
}
