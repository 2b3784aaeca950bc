//! Rule-driven canonicalization of raw store payloads into `NormalizedRecord`s.
//!
//! Field locations, lookup tables and edition words come from `rules/normalize.yaml`;
//! the parsing of prices, dates and platform lists is shared by every source.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use catalog_core::{NormalizedRecord, Platform, PlatformLabel, Price, RawRecord, ReleaseDate};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

pub const BUILTIN_RULES: &str = include_str!("../../../rules/normalize.yaml");

const FREE_WORDS: [&str; 5] = ["free", "free to play", "free-to-play", "free download", "gratis"];
const PRICE_AMOUNT_KEYS: [&str; 10] = [
    "final",
    "finalPrice",
    "amount",
    "value",
    "current",
    "discounted",
    "discountedPrice",
    "regular",
    "regPrice",
    "basePrice",
];
const PRICE_CURRENCY_KEYS: [&str; 3] = ["currency", "currencyCode", "priceCurrency"];
const NAME_KEYS: [&str; 4] = ["name", "label", "displayName", "platform"];
const ZERO_DECIMAL_CURRENCIES: [&str; 6] = ["JPY", "KRW", "VND", "CLP", "ISK", "HUF"];
const CURRENCY_SYMBOLS: [(&str, &str); 10] = [
    ("US$", "USD"),
    ("CA$", "CAD"),
    ("C$", "CAD"),
    ("A$", "AUD"),
    ("R$", "BRL"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("₩", "KRW"),
    ("$", "USD"),
];
const DAY_FORMATS: [&str; 8] = [
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d %B, %Y",
    "%d %B %Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%m/%d/%Y",
    "%d.%m.%Y",
];

static AMOUNT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d[\d.,'\s]*").expect("amount pattern is valid"));
static CURRENCY_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Z]{3})\b").expect("currency pattern is valid"));
static YEAR_ONLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:q[1-4]|h[12]|early|mid|late|spring|summer|fall|autumn|winter|coming)\s+)?((?:19|20)\d{2})$",
    )
    .expect("year pattern is valid")
});
static EDITION_SEPARATORS: &[char] = &[':', '-', '–', '—', '(', '[', ' '];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("{source_id} record has an empty native id")]
    MissingNativeId { source_id: String },
    #[error("{source_id}:{native_id} has no usable title")]
    EmptyTitle { source_id: String, native_id: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceUnit {
    #[default]
    Major,
    Minor,
}

/// Dotted payload paths tried in order for each canonical field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldAliases {
    pub title: Vec<String>,
    pub price: Vec<String>,
    pub currency: Vec<String>,
    pub free_flag: Vec<String>,
    pub release_date: Vec<String>,
    pub platforms: Vec<String>,
    pub publisher: Vec<String>,
    pub developer: Vec<String>,
    pub url: Vec<String>,
    pub image: Vec<String>,
    pub rating: Vec<String>,
}

fn paths(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            title: paths(&["title", "name"]),
            price: paths(&["price"]),
            currency: paths(&["currency"]),
            free_flag: paths(&["is_free", "isFree"]),
            release_date: paths(&["release_date", "releaseDate"]),
            platforms: paths(&["platforms"]),
            publisher: paths(&["publisher", "publishers"]),
            developer: paths(&["developer", "developers"]),
            url: paths(&["url"]),
            image: paths(&["image", "image_url"]),
            rating: paths(&["rating"]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceProfile {
    pub default_currency: String,
    pub price_unit: PriceUnit,
    pub url_template: Option<String>,
    pub default_platforms: Vec<Platform>,
    pub fields: FieldAliases,
    pub platforms: BTreeMap<String, Platform>,
    pub publishers: BTreeMap<String, String>,
}

impl Default for SourceProfile {
    fn default() -> Self {
        Self {
            default_currency: "USD".to_string(),
            price_unit: PriceUnit::Major,
            url_template: None,
            default_platforms: Vec::new(),
            fields: FieldAliases::default(),
            platforms: BTreeMap::new(),
            publishers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NormalizationRules {
    pub version: u32,
    #[serde(default)]
    pub trademark_marks: Vec<String>,
    #[serde(default)]
    pub edition_words: Vec<String>,
    #[serde(default)]
    pub platforms: BTreeMap<String, Platform>,
    #[serde(default)]
    pub publishers: BTreeMap<String, String>,
    #[serde(default)]
    pub default_profile: SourceProfile,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceProfile>,
}

impl NormalizationRules {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing normalization rules")
    }

    pub fn builtin() -> Result<Self> {
        Self::from_yaml(BUILTIN_RULES)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// `rules/normalize.yaml` under `root` when present, else the compiled-in copy.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("normalize.yaml");
        if path.exists() {
            Self::from_path(&path)
        } else {
            info!(path = %path.display(), "no workspace rules file, using built-in rules");
            Self::builtin()
        }
    }

    pub fn profile(&self, source: &str) -> &SourceProfile {
        self.sources.get(source).unwrap_or(&self.default_profile)
    }

    fn lowercase_keys(&mut self) {
        fn lower<V>(map: &mut BTreeMap<String, V>) {
            let taken = std::mem::take(map);
            map.extend(taken.into_iter().map(|(k, v)| (k.to_lowercase(), v)));
        }
        lower(&mut self.platforms);
        lower(&mut self.publishers);
        lower(&mut self.default_profile.platforms);
        lower(&mut self.default_profile.publishers);
        for profile in self.sources.values_mut() {
            lower(&mut profile.platforms);
            lower(&mut profile.publishers);
        }
    }
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Comparison form of a display title: lowercase alphanumeric words, single-spaced.
/// Titles with no alphanumerics fall back to their lowercased display form.
pub fn title_key(title: &str) -> String {
    let folded = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let key = collapse_whitespace(&folded);
    if key.is_empty() {
        collapse_whitespace(&title.to_lowercase())
    } else {
        key
    }
}

fn edition_regex(words: &[String]) -> Result<Option<Regex>> {
    let mut words = words
        .iter()
        .map(|w| w.trim().to_lowercase())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>();
    if words.is_empty() {
        return Ok(None);
    }
    words.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let alternation = words
        .iter()
        .map(|w| {
            regex::escape(w)
                .replace('\'', "['’]?")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(
        r"(?i)(?:\s*[:\-–—(\[]\s*(?P<sep>(?:{alternation})(?:\s+edition)?)|\s+(?P<ed>(?:{alternation})\s+edition))\s*[)\]]?\s*$"
    );
    Regex::new(&pattern)
        .map(Some)
        .context("compiling edition suffix pattern")
}

fn minor_digits(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency) {
        0
    } else {
        2
    }
}

fn major_to_minor(amount: f64, currency: &str) -> Option<u64> {
    if !amount.is_finite() || amount < 0.0 {
        return None;
    }
    Some((amount * 10f64.powi(minor_digits(currency) as i32)).round() as u64)
}

fn detect_currency(text: &str) -> Option<String> {
    if let Some(code) = CURRENCY_CODE_RE.captures(text).and_then(|c| c.get(1)) {
        return Some(code.as_str().to_string());
    }
    CURRENCY_SYMBOLS
        .iter()
        .find(|(symbol, _)| text.contains(symbol))
        .map(|(_, code)| code.to_string())
}

/// Digits with `,`/`.` separators to integer minor units. The last separator is the
/// decimal point unless it is a lone separator followed by exactly three digits.
fn decimal_to_minor(raw: &str, digits: u32) -> Option<u64> {
    let cleaned = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect::<String>();
    let cleaned = cleaned.trim_end_matches(['.', ',']);
    let lone_decimal = |sep: char, at: usize| {
        cleaned.matches(sep).count() == 1 && cleaned.len() - at - 1 != 3
    };
    let split_at = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(d), Some(c)) => Some(d.max(c)),
        (Some(d), None) => lone_decimal('.', d).then_some(d),
        (None, Some(c)) => lone_decimal(',', c).then_some(c),
        (None, None) => None,
    };
    let (int_part, frac_part) = match split_at {
        Some(at) => (&cleaned[..at], &cleaned[at + 1..]),
        None => (cleaned, ""),
    };

    let int_digits = int_part
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>();
    let whole = if int_digits.is_empty() {
        0
    } else {
        int_digits.parse::<u64>().ok()?
    };
    let mut frac = frac_part
        .chars()
        .filter(char::is_ascii_digit)
        .take(digits as usize)
        .collect::<String>();
    while frac.len() < digits as usize {
        frac.push('0');
    }
    let frac_value = if frac.is_empty() { 0 } else { frac.parse::<u64>().ok()? };
    let round_up = frac_part
        .chars()
        .filter(char::is_ascii_digit)
        .nth(digits as usize)
        .is_some_and(|c| c >= '5');

    whole
        .checked_mul(10u64.pow(digits))?
        .checked_add(frac_value)?
        .checked_add(u64::from(round_up))
}

/// Parse display prices like `"$19.99"`, `"EUR 19,99"`, `"19,99 €"`, `"¥1,980"` or
/// `"Free"`. Text without digits (`"Unavailable"`) is no price at all.
pub fn parse_price_text(text: &str, fallback_currency: &str) -> Option<Price> {
    let trimmed = text.trim();
    let currency = detect_currency(trimmed).unwrap_or_else(|| fallback_currency.to_ascii_uppercase());
    if FREE_WORDS.contains(&trimmed.to_lowercase().as_str()) {
        return Some(Price::free(currency));
    }
    let found = AMOUNT_RE.find(trimmed)?;
    if trimmed[..found.start()].trim_end().ends_with('-') {
        return None;
    }
    let minor = decimal_to_minor(found.as_str(), minor_digits(&currency))?;
    Some(Price::new(minor, currency))
}

pub fn parse_price_value(
    value: &JsonValue,
    unit: PriceUnit,
    currency: Option<&str>,
    default_currency: &str,
) -> Option<Price> {
    match value {
        JsonValue::Number(n) => {
            let currency = currency.unwrap_or(default_currency).to_ascii_uppercase();
            let minor = match unit {
                PriceUnit::Minor => n.as_u64().or_else(|| {
                    n.as_f64()
                        .filter(|f| f.is_finite() && *f >= 0.0)
                        .map(|f| f.round() as u64)
                })?,
                PriceUnit::Major => major_to_minor(n.as_f64()?, &currency)?,
            };
            Some(Price::new(minor, currency))
        }
        JsonValue::String(s) => parse_price_text(s, currency.unwrap_or(default_currency)),
        JsonValue::Object(map) => {
            let nested = PRICE_CURRENCY_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(JsonValue::as_str))
                .map(str::to_ascii_uppercase);
            let currency = nested.as_deref().or(currency);
            if map.get("isFree").and_then(JsonValue::as_bool) == Some(true) {
                return Some(Price::free(currency.unwrap_or(default_currency)));
            }
            PRICE_AMOUNT_KEYS
                .iter()
                .filter_map(|k| map.get(*k))
                .find_map(|v| parse_price_value(v, unit, currency, default_currency))
        }
        _ => None,
    }
}

/// Bare integers are a year, epoch seconds, or epoch milliseconds (from 1e11 up).
fn release_date_from_int(n: i64) -> ReleaseDate {
    let seconds = match n {
        1970..=2100 => return ReleaseDate::year(n as i32),
        n if n >= 100_000_000_000 => n / 1000,
        n if n >= 100_000_000 => n,
        _ => return ReleaseDate::Unknown,
    };
    match DateTime::<Utc>::from_timestamp(seconds, 0) {
        Some(dt) if (1970..=2100).contains(&dt.year()) => ReleaseDate::day(dt.date_naive()),
        _ => ReleaseDate::Unknown,
    }
}

/// Parse at the finest precision the text supports; anything else is `Unknown`.
pub fn parse_release_date_text(text: &str) -> ReleaseDate {
    let collapsed = collapse_whitespace(text);
    let t = collapsed.trim_end_matches('.');
    if t.is_empty() {
        return ReleaseDate::Unknown;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return ReleaseDate::day(dt.date_naive());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(t, "%Y-%m-%dT%H:%M:%S") {
        return ReleaseDate::day(dt.date());
    }
    if let Some(date) = DAY_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(t, fmt).ok())
    {
        return ReleaseDate::day(date);
    }

    let month = NaiveDate::parse_from_str(&format!("{t}-01"), "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("1 {t}"), "%d %B %Y"))
        .or_else(|_| NaiveDate::parse_from_str(&format!("1/{t}"), "%d/%m/%Y"));
    if let Ok(date) = month {
        if let Some(release) = ReleaseDate::month(date.year(), date.month()) {
            return release;
        }
    }

    YEAR_ONLY_RE
        .captures(t)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<i32>().ok())
        .map(ReleaseDate::year)
        .unwrap_or_default()
}

pub fn parse_release_date(value: &JsonValue) -> ReleaseDate {
    match value {
        JsonValue::String(s) => parse_release_date_text(s),
        JsonValue::Number(n) => n.as_i64().map(release_date_from_int).unwrap_or_default(),
        JsonValue::Object(map) => ["date", "releaseDate", "value"]
            .iter()
            .filter_map(|k| map.get(*k))
            .map(parse_release_date)
            .find(ReleaseDate::is_known)
            .unwrap_or_default(),
        _ => ReleaseDate::Unknown,
    }
}

fn split_labels(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split([',', ';', '/'])
        .map(collapse_whitespace)
        .filter(|s| !s.is_empty())
}

fn platform_labels(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(s) => split_labels(s).collect(),
        JsonValue::Array(items) => items.iter().flat_map(platform_labels).collect(),
        JsonValue::Object(map) => {
            if let Some(name) = NAME_KEYS
                .iter()
                .find_map(|k| map.get(*k).and_then(JsonValue::as_str))
            {
                return split_labels(name).collect();
            }
            map.iter()
                .filter(|(_, v)| v.as_bool() == Some(true))
                .map(|(k, _)| k.clone())
                .collect()
        }
        _ => Vec::new(),
    }
}

fn party_name(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(items) => items.iter().find_map(party_name),
        JsonValue::Object(map) => map.get("name").and_then(party_name),
        _ => None,
    }
}

fn non_empty_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(collapse_whitespace(s)).filter(|s| !s.is_empty()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_of<T>(
    raw: &RawRecord,
    paths: &[String],
    f: impl FnMut(&JsonValue) -> Option<T>,
) -> Option<T> {
    paths.iter().filter_map(|p| raw.lookup(p)).find_map(f)
}

/// Compiled rule set; cheap to share across source tasks.
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: NormalizationRules,
    edition: Option<Regex>,
}

impl Normalizer {
    pub fn new(mut rules: NormalizationRules) -> Result<Self> {
        rules.lowercase_keys();
        let edition = edition_regex(&rules.edition_words)?;
        Ok(Self { rules, edition })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(NormalizationRules::builtin()?)
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    fn strip_marks(&self, text: &str) -> String {
        self.rules
            .trademark_marks
            .iter()
            .fold(text.to_string(), |acc, mark| acc.replace(mark.as_str(), " "))
    }

    pub fn clean_title(&self, raw: &str) -> String {
        collapse_whitespace(&self.strip_marks(raw))
    }

    /// Display title with trailing edition decorations removed, plus the removed text.
    /// A title made only of edition words is kept whole.
    pub fn split_edition(&self, raw: &str) -> (String, Option<String>) {
        let cleaned = self.clean_title(raw);
        let Some(re) = &self.edition else {
            return (cleaned, None);
        };

        let mut title = cleaned.clone();
        let mut removed = Vec::new();
        loop {
            let Some((start, suffix)) = re.captures(&title).and_then(|caps| {
                let whole = caps.get(0)?;
                let suffix = caps.name("sep").or_else(|| caps.name("ed"))?;
                Some((whole.start(), suffix.as_str().trim().to_string()))
            }) else {
                break;
            };
            let head = title[..start]
                .trim_end_matches(EDITION_SEPARATORS)
                .to_string();
            if head.is_empty() {
                break;
            }
            removed.insert(0, suffix);
            title = head;
        }

        if removed.is_empty() {
            (cleaned, None)
        } else {
            (title, Some(removed.join(" ")))
        }
    }

    fn map_platform(&self, label: &str, profile: &SourceProfile) -> Platform {
        let key = collapse_whitespace(&self.strip_marks(label)).to_lowercase();
        profile
            .platforms
            .get(&key)
            .or_else(|| self.rules.platforms.get(&key))
            .copied()
            .unwrap_or(Platform::Other)
    }

    fn platforms(&self, raw: &RawRecord, profile: &SourceProfile) -> Vec<PlatformLabel> {
        let labels = first_of(raw, &profile.fields.platforms, |v| {
            Some(platform_labels(v)).filter(|l| !l.is_empty())
        })
        .unwrap_or_default();

        let mapped = if labels.is_empty() {
            profile
                .default_platforms
                .iter()
                .map(|p| PlatformLabel {
                    platform: *p,
                    label: p.display_name().to_string(),
                })
                .collect::<Vec<_>>()
        } else {
            labels
                .into_iter()
                .map(|label| PlatformLabel {
                    platform: self.map_platform(&label, profile),
                    label,
                })
                .collect()
        };

        let mut out: Vec<PlatformLabel> = Vec::with_capacity(mapped.len());
        for entry in mapped {
            let duplicate = out.iter().any(|seen| match entry.platform {
                Platform::Other => {
                    seen.platform == Platform::Other
                        && seen.label.eq_ignore_ascii_case(&entry.label)
                }
                platform => seen.platform == platform,
            });
            if !duplicate {
                out.push(entry);
            }
        }
        out
    }

    fn party(&self, raw: &RawRecord, aliases: &[String]) -> Option<String> {
        first_of(raw, aliases, |v| {
            party_name(v)
                .map(|n| self.clean_title(&n))
                .filter(|n| !n.is_empty())
        })
    }

    fn publisher(&self, raw: &RawRecord, profile: &SourceProfile) -> Option<String> {
        let name = self.party(raw, &profile.fields.publisher)?;
        let key = name.to_lowercase();
        Some(
            profile
                .publishers
                .get(&key)
                .or_else(|| self.rules.publishers.get(&key))
                .cloned()
                .unwrap_or(name),
        )
    }

    fn price(&self, raw: &RawRecord, profile: &SourceProfile) -> Option<Price> {
        let fields = &profile.fields;
        let currency = first_of(raw, &fields.currency, |v| {
            v.as_str()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_ascii_uppercase)
        });
        let free = fields
            .free_flag
            .iter()
            .filter_map(|p| raw.lookup(p))
            .any(|v| v.as_bool() == Some(true));
        if free {
            return Some(Price::free(
                currency.unwrap_or_else(|| profile.default_currency.clone()),
            ));
        }
        first_of(raw, &fields.price, |v| {
            parse_price_value(
                v,
                profile.price_unit,
                currency.as_deref(),
                &profile.default_currency,
            )
        })
    }

    pub fn normalize(&self, raw: &RawRecord) -> Result<NormalizedRecord, NormalizationError> {
        let native_id = raw.source_native_id.trim();
        if native_id.is_empty() {
            return Err(NormalizationError::MissingNativeId {
                source_id: raw.source.clone(),
            });
        }
        let profile = self.rules.profile(&raw.source);
        let fields = &profile.fields;

        let raw_title = first_of(raw, &fields.title, non_empty_text).unwrap_or_default();
        let (title, edition) = self.split_edition(&raw_title);
        if title.is_empty() {
            return Err(NormalizationError::EmptyTitle {
                source_id: raw.source.clone(),
                native_id: native_id.to_string(),
            });
        }

        let source_url = raw
            .source_url
            .clone()
            .or_else(|| {
                first_of(raw, &fields.url, |v| {
                    v.as_str()
                        .map(str::trim)
                        .filter(|s| s.starts_with("http"))
                        .map(str::to_string)
                })
            })
            .or_else(|| {
                profile
                    .url_template
                    .as_ref()
                    .map(|t| t.replace("{id}", native_id))
            });

        Ok(NormalizedRecord {
            source: raw.source.clone(),
            source_native_id: native_id.to_string(),
            source_url,
            title_key: title_key(&title),
            title,
            edition,
            price: self.price(raw, profile),
            release_date: first_of(raw, &fields.release_date, |v| {
                Some(parse_release_date(v)).filter(ReleaseDate::is_known)
            })
            .unwrap_or_default(),
            platforms: self.platforms(raw, profile),
            publisher: self.publisher(raw, profile),
            developer: self.party(raw, &fields.developer),
            image_url: first_of(raw, &fields.image, |v| {
                v.as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            }),
            rating: first_of(raw, &fields.rating, |v| {
                v.as_str()
                    .map(|s| collapse_whitespace(s).to_lowercase())
                    .filter(|s| !s.is_empty())
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::DatePrecision;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::builtin().expect("built-in rules")
    }

    fn raw(source: &str, id: &str, payload: JsonValue) -> RawRecord {
        RawRecord::new(source, id, payload.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn builtin_rules_parse_and_cover_every_store() {
        let rules = NormalizationRules::builtin().unwrap();
        assert_eq!(rules.version, 1);
        for source in ["steam", "psn", "xbox", "nintendo"] {
            assert!(rules.sources.contains_key(source), "{source}");
        }
        assert_eq!(rules.profile("unknown-store").default_currency, "USD");
    }

    #[test]
    fn edition_suffixes_are_stripped_and_kept() {
        let n = normalizer();
        let deluxe = n
            .normalize(&raw(
                "steam",
                "1",
                json!({"name": "Super Game™: Deluxe Edition", "publishers": ["Acme"], "release_date": {"date": "14 Mar, 2020"}}),
            ))
            .unwrap();
        let plain = n
            .normalize(&raw(
                "psn",
                "2",
                json!({"name": "Super Game", "publisherName": "Acme Inc", "releaseDate": "2020-03-14T00:00:00Z"}),
            ))
            .unwrap();

        assert_eq!(deluxe.title, "Super Game");
        assert_eq!(deluxe.edition.as_deref(), Some("Deluxe Edition"));
        assert_eq!(deluxe.title_key, plain.title_key);
        assert_eq!(deluxe.publisher.as_deref(), Some("Acme"));
        assert_eq!(plain.publisher.as_deref(), Some("Acme Inc"));
        assert_eq!(deluxe.release_date.year_value(), Some(2020));

        assert_eq!(
            n.split_edition("DOOM Eternal - Deluxe Edition (GOTY)"),
            ("DOOM Eternal".to_string(), Some("Deluxe Edition GOTY".to_string()))
        );
        assert_eq!(
            n.split_edition("Hitman Game of the Year Edition"),
            ("Hitman".to_string(), Some("Game of the Year Edition".to_string()))
        );
        assert_eq!(
            n.split_edition("The Witcher 3: Wild Hunt – Complete Edition").0,
            "The Witcher 3: Wild Hunt"
        );
        // Only-edition titles and embedded words survive.
        assert_eq!(n.split_edition("Gold Edition").0, "Gold Edition");
        assert_eq!(n.split_edition("Solid Gold Rush").0, "Solid Gold Rush");
    }

    #[test]
    fn free_price_uses_source_default_currency() {
        let n = normalizer();
        let rec = n
            .normalize(&raw("psn", "f2p", json!({"name": "Fortnite", "price": {"discountedPrice": "Free"}})))
            .unwrap();
        assert_eq!(rec.price, Some(Price::new(0, "USD")));

        let flagged = n
            .normalize(&raw("steam", "570", json!({"name": "Dota 2", "is_free": true})))
            .unwrap();
        assert_eq!(flagged.price, Some(Price::free("USD")));

        let unavailable = n
            .normalize(&raw("nintendo", "x", json!({"title": "Soon", "displayPrice": "Unavailable"})))
            .unwrap();
        assert_eq!(unavailable.price, None);
    }

    #[test]
    fn prices_parse_into_minor_units() {
        assert_eq!(parse_price_text("$19.99", "USD"), Some(Price::new(1999, "USD")));
        assert_eq!(parse_price_text("EUR 19,99", "USD"), Some(Price::new(1999, "EUR")));
        assert_eq!(parse_price_text("19,99 €", "USD"), Some(Price::new(1999, "EUR")));
        assert_eq!(parse_price_text("£1,299.50", "USD"), Some(Price::new(129950, "GBP")));
        assert_eq!(parse_price_text("¥1,980", "USD"), Some(Price::new(1980, "JPY")));
        assert_eq!(parse_price_text("1.299,00 €", "USD"), Some(Price::new(129900, "EUR")));
        assert_eq!(parse_price_text("-5.00", "USD"), None);
        assert_eq!(parse_price_text("Coming soon", "USD"), None);

        let steam = normalizer()
            .normalize(&raw(
                "steam",
                "10",
                json!({"name": "Counter-Strike", "price_overview": {"final": 999, "currency": "EUR"}}),
            ))
            .unwrap();
        assert_eq!(steam.price, Some(Price::new(999, "EUR")));

        assert_eq!(
            parse_price_value(&json!(59.99), PriceUnit::Major, None, "USD"),
            Some(Price::new(5999, "USD"))
        );
        assert_eq!(parse_price_value(&json!(-1), PriceUnit::Minor, None, "USD"), None);
    }

    #[test]
    fn dates_keep_their_precision() {
        assert_eq!(
            parse_release_date_text("14 Mar, 2020"),
            ReleaseDate::day(NaiveDate::from_ymd_opt(2020, 3, 14).unwrap())
        );
        assert_eq!(
            parse_release_date_text("Mar 14, 2020"),
            ReleaseDate::day(NaiveDate::from_ymd_opt(2020, 3, 14).unwrap())
        );
        assert_eq!(parse_release_date_text("March 2021"), ReleaseDate::month(2021, 3).unwrap());
        assert_eq!(parse_release_date_text("2021-03"), ReleaseDate::month(2021, 3).unwrap());
        assert_eq!(parse_release_date_text("2019"), ReleaseDate::year(2019));
        assert_eq!(parse_release_date_text("Q3 2024"), ReleaseDate::year(2024));
        assert_eq!(parse_release_date_text("Coming soon"), ReleaseDate::Unknown);
        assert_eq!(parse_release_date(&json!(2018)), ReleaseDate::year(2018));
        assert_eq!(
            parse_release_date(&json!(1_584_144_000)).precision(),
            DatePrecision::Day
        );
        assert_eq!(
            parse_release_date(&json!(1_584_144_000_000i64)),
            ReleaseDate::day(NaiveDate::from_ymd_opt(2020, 3, 14).unwrap())
        );
        assert_eq!(parse_release_date(&json!(9_000_000_000_000_000i64)), ReleaseDate::Unknown);
    }

    #[test]
    fn platforms_map_through_tables_and_keep_unknown_labels() {
        let n = normalizer();
        let steam = n
            .normalize(&raw(
                "steam",
                "1",
                json!({"name": "Portal", "platforms": {"windows": true, "mac": true, "linux": false}}),
            ))
            .unwrap();
        let mut platforms = steam.platforms.iter().map(|p| p.platform).collect::<Vec<_>>();
        platforms.sort();
        assert_eq!(platforms, vec![Platform::Windows, Platform::MacOs]);

        let psn = n
            .normalize(&raw("psn", "2", json!({"name": "Astro", "platforms": ["PS5™", "PS4", "Stadia", "stadia"]})))
            .unwrap();
        assert_eq!(psn.platforms.len(), 3);
        assert_eq!(psn.platforms[0].platform, Platform::PlayStation5);
        assert_eq!(
            psn.platforms[2],
            PlatformLabel {
                platform: Platform::Other,
                label: "Stadia".to_string()
            }
        );

        let nintendo = n
            .normalize(&raw("nintendo", "3", json!({"title": "Kirby"})))
            .unwrap();
        assert_eq!(nintendo.platforms[0].platform, Platform::Switch);
        assert_eq!(
            nintendo.source_url.as_deref(),
            Some("https://www.nintendo.com/us/store/products/3/")
        );
    }

    #[test]
    fn records_without_a_title_are_rejected() {
        let n = normalizer();
        for payload in [json!({}), json!({"name": "   "}), json!({"name": "™ ®"})] {
            let err = n.normalize(&raw("steam", "9", payload)).unwrap_err();
            assert!(matches!(err, NormalizationError::EmptyTitle { .. }));
        }
        let err = n.normalize(&raw("steam", " ", json!({"name": "Ok"}))).unwrap_err();
        assert!(matches!(err, NormalizationError::MissingNativeId { .. }));
    }

    #[test]
    fn normalized_titles_are_never_empty() {
        let n = normalizer();
        let titles = [
            "Deluxe Edition",
            "- GOTY",
            "(Gold)",
            "???",
            "  A  ",
            "™Game™",
            "Ultimate: Ultimate Edition",
            "1942",
        ];
        for title in titles {
            let rec = n
                .normalize(&raw("xbox", "id", json!({"title": title})))
                .unwrap();
            assert!(!rec.title.is_empty(), "{title}");
            assert!(!rec.title_key.is_empty(), "{title}");
        }
    }
}
