//! Cross-source entity resolution over an immutable snapshot of normalized records.
//!
//! Records are bucketed by a title-prefix blocking key, scored pairwise inside each
//! bucket, and grouped transitively with union-find. The result depends only on the
//! record set, never on its order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use catalog_core::{cluster_id_for, Cluster, NormalizedRecord, RecordKey};
use serde::Serialize;
use strsim::normalized_levenshtein;
use thiserror::Error;

const LEADING_ARTICLES: [&str; 3] = ["the", "a", "an"];
const LEGAL_SUFFIXES: [&str; 14] = [
    "inc",
    "incorporated",
    "llc",
    "ltd",
    "limited",
    "co",
    "corp",
    "corporation",
    "company",
    "gmbh",
    "plc",
    "sa",
    "ag",
    "kk",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DedupeError {
    #[error("record {0} appears more than once in the dedupe input")]
    DuplicateKey(RecordKey),
    #[error("record {0} has an empty comparison title")]
    EmptyTitleKey(RecordKey),
    #[error("invalid dedupe configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchWeights {
    pub title: f64,
    pub year: f64,
    pub publisher: f64,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            title: 0.6,
            year: 0.2,
            publisher: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupConfig {
    pub merge_threshold: f64,
    pub review_threshold: f64,
    pub weights: MatchWeights,
    pub year_window: i32,
    pub blocking_prefix_len: usize,
    pub source_priority: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            merge_threshold: 0.85,
            review_threshold: 0.75,
            weights: MatchWeights::default(),
            year_window: 2,
            blocking_prefix_len: 4,
            source_priority: ["steam", "psn", "xbox", "nintendo"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl DedupConfig {
    pub fn validate(&self) -> Result<(), DedupeError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.merge_threshold) || !in_unit(self.review_threshold) {
            return Err(DedupeError::InvalidConfig(
                "thresholds must lie in [0, 1]".to_string(),
            ));
        }
        if self.review_threshold > self.merge_threshold {
            return Err(DedupeError::InvalidConfig(
                "review threshold exceeds merge threshold".to_string(),
            ));
        }
        let w = self.weights;
        if w.title <= 0.0 || w.year < 0.0 || w.publisher < 0.0 {
            return Err(DedupeError::InvalidConfig(
                "title weight must be positive and other weights non-negative".to_string(),
            ));
        }
        if self.blocking_prefix_len == 0 || self.year_window < 0 {
            return Err(DedupeError::InvalidConfig(
                "blocking prefix and year window must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Component scores for one candidate pair. `None` components were unknown on at
/// least one side and carry no weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PairScore {
    pub title: f64,
    pub year: Option<f64>,
    pub publisher: Option<f64>,
    pub combined: f64,
}

/// A near-miss pair worth a human look: scored in `[review, merge)` and left apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewCandidate {
    pub left: RecordKey,
    pub right: RecordKey,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DedupOutcome {
    pub clusters: Vec<Cluster>,
    pub review: Vec<ReviewCandidate>,
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Title key without a leading English article.
pub fn comparison_title(title_key: &str) -> &str {
    let trimmed = title_key.trim();
    for article in LEADING_ARTICLES {
        if let Some(rest) = trimmed.strip_prefix(article).and_then(|r| r.strip_prefix(' ')) {
            if !rest.trim().is_empty() {
                return rest.trim_start();
            }
        }
    }
    trimmed
}

pub fn blocking_key(title_key: &str, prefix_len: usize) -> String {
    comparison_title(title_key)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(prefix_len)
        .collect()
}

fn token_jaccard(a: &str, b: &str) -> f64 {
    let ta = a.split_whitespace().collect::<HashSet<_>>();
    let tb = b.split_whitespace().collect::<HashSet<_>>();
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    let inter = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    inter / union
}

pub fn title_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (comparison_title(a), comparison_title(b));
    normalized_levenshtein(a, b).max(token_jaccard(a, b))
}

pub fn year_similarity(a: Option<i32>, b: Option<i32>, window: i32) -> Option<f64> {
    let (a, b) = (a?, b?);
    let delta = f64::from((a - b).abs());
    Some((1.0 - delta / f64::from(window + 1)).max(0.0))
}

/// Lowercase alphanumeric words with trailing legal-entity suffixes removed.
pub fn party_key(name: &str) -> String {
    let folded = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>();
    let mut tokens = folded.split_whitespace().collect::<Vec<_>>();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| LEGAL_SUFFIXES.contains(t)) {
        tokens.pop();
    }
    tokens.join(" ")
}

fn name_similarity(a: &str, b: &str) -> Option<f64> {
    let (ka, kb) = (party_key(a), party_key(b));
    if ka.is_empty() || kb.is_empty() {
        return None;
    }
    if ka == kb {
        Some(1.0)
    } else {
        Some(normalized_levenshtein(&ka, &kb) * 0.8)
    }
}

/// Publisher when both sides have one, else developer, else unknown.
pub fn party_similarity(a: &NormalizedRecord, b: &NormalizedRecord) -> Option<f64> {
    match (&a.publisher, &b.publisher) {
        (Some(pa), Some(pb)) => name_similarity(pa, pb),
        _ => match (&a.developer, &b.developer) {
            (Some(da), Some(db)) => name_similarity(da, db),
            _ => None,
        },
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, mut i: usize) -> usize {
        while self.parent[i] != i {
            self.parent[i] = self.parent[self.parent[i]];
            i = self.parent[i];
        }
        i
    }

    /// The smaller root wins so the structure never depends on union order.
    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        match ra.cmp(&rb) {
            Ordering::Less => self.parent[rb] = ra,
            Ordering::Greater => self.parent[ra] = rb,
            Ordering::Equal => {}
        }
    }
}

fn record_order(a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
    a.title_key
        .cmp(&b.title_key)
        .then_with(|| a.source_native_id.cmp(&b.source_native_id))
        .then_with(|| a.source.cmp(&b.source))
}

pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    pub fn score(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> PairScore {
        let w = self.config.weights;
        let title = title_similarity(&a.title_key, &b.title_key);
        let year = year_similarity(
            a.release_date.year_value(),
            b.release_date.year_value(),
            self.config.year_window,
        );
        let publisher = party_similarity(a, b);

        let mut total = w.title * title;
        let mut weight = w.title;
        if let Some(y) = year {
            total += w.year * y;
            weight += w.year;
        }
        if let Some(p) = publisher {
            total += w.publisher * p;
            weight += w.publisher;
        }
        PairScore {
            title,
            year,
            publisher,
            combined: (total / weight).clamp(0.0, 1.0),
        }
    }

    fn source_rank(&self, source: &str) -> usize {
        self.config
            .source_priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(self.config.source_priority.len())
    }

    /// Most complete record first, then source priority, then the stable key.
    fn canonical_order(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
        b.completeness()
            .cmp(&a.completeness())
            .then_with(|| self.source_rank(&a.source).cmp(&self.source_rank(&b.source)))
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.source_native_id.cmp(&b.source_native_id))
    }

    pub fn cluster(&self, records: &[NormalizedRecord]) -> Result<DedupOutcome, DedupeError> {
        self.config.validate()?;

        let mut sorted = records.to_vec();
        sorted.sort_by(|a, b| a.key().cmp(&b.key()));
        for pair in sorted.windows(2) {
            if pair[0].key() == pair[1].key() {
                return Err(DedupeError::DuplicateKey(pair[0].key()));
            }
        }
        if let Some(empty) = sorted.iter().find(|r| r.title_key.trim().is_empty()) {
            return Err(DedupeError::EmptyTitleKey(empty.key()));
        }

        let mut blocks: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, record) in sorted.iter().enumerate() {
            blocks
                .entry(blocking_key(&record.title_key, self.config.blocking_prefix_len))
                .or_default()
                .push(idx);
        }

        let mut uf = UnionFind::new(sorted.len());
        let mut merged_edges = Vec::new();
        let mut near_misses = Vec::new();
        for members in blocks.values() {
            for (pos, &i) in members.iter().enumerate() {
                for &j in &members[pos + 1..] {
                    let score = self.score(&sorted[i], &sorted[j]).combined;
                    if score >= self.config.merge_threshold {
                        uf.union(i, j);
                        merged_edges.push((i, j, score));
                    } else if score >= self.config.review_threshold {
                        near_misses.push((i, j, score));
                    }
                }
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..sorted.len() {
            groups.entry(uf.find(idx)).or_default().push(idx);
        }
        let mut confidence: BTreeMap<usize, f64> = BTreeMap::new();
        for &(i, _, score) in &merged_edges {
            let root = uf.find(i);
            let entry = confidence.entry(root).or_insert(1.0);
            *entry = entry.min(score);
        }

        let mut clusters = groups
            .into_iter()
            .map(|(root, indices)| {
                let mut members = indices
                    .iter()
                    .map(|&i| sorted[i].clone())
                    .collect::<Vec<_>>();
                members.sort_by(record_order);
                let canonical = members
                    .iter()
                    .min_by(|a, b| self.canonical_order(a, b))
                    .cloned()
                    .unwrap_or_else(|| sorted[root].clone());
                let keys = members.iter().map(NormalizedRecord::key).collect::<Vec<_>>();
                Cluster {
                    cluster_id: cluster_id_for(&keys),
                    confidence: round4(confidence.get(&root).copied().unwrap_or(1.0)),
                    canonical,
                    members,
                }
            })
            .collect::<Vec<_>>();
        clusters.sort_by(|a, b| record_order(&a.canonical, &b.canonical));

        let mut review = near_misses
            .into_iter()
            .filter(|&(i, j, _)| uf.find(i) != uf.find(j))
            .map(|(i, j, score)| ReviewCandidate {
                left: sorted[i].key(),
                right: sorted[j].key(),
                score: round4(score),
            })
            .collect::<Vec<_>>();
        review.sort_by(|a, b| a.left.cmp(&b.left).then_with(|| a.right.cmp(&b.right)));

        Ok(DedupOutcome { clusters, review })
    }
}

/// Every record as its own cluster, in the deduplicator's output order.
pub fn singleton_clusters(records: &[NormalizedRecord]) -> Vec<Cluster> {
    let mut clusters = records
        .iter()
        .cloned()
        .map(Cluster::singleton)
        .collect::<Vec<_>>();
    clusters.sort_by(|a, b| record_order(&a.canonical, &b.canonical));
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog_core::{Price, ReleaseDate};

    fn record(source: &str, id: &str, title_key: &str) -> NormalizedRecord {
        NormalizedRecord {
            source: source.to_string(),
            source_native_id: id.to_string(),
            source_url: None,
            title: title_key.to_string(),
            title_key: title_key.to_string(),
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

    fn with_year_publisher(mut r: NormalizedRecord, year: i32, publisher: &str) -> NormalizedRecord {
        r.release_date = ReleaseDate::year(year);
        r.publisher = Some(publisher.to_string());
        r
    }

    fn engine() -> DedupEngine {
        DedupEngine::new(DedupConfig::default())
    }

    fn partition(outcome: &DedupOutcome) -> Vec<Vec<String>> {
        let mut parts = outcome
            .clusters
            .iter()
            .map(|c| {
                let mut keys = c.member_keys().iter().map(ToString::to_string).collect::<Vec<_>>();
                keys.sort();
                keys
            })
            .collect::<Vec<_>>();
        parts.sort();
        parts
    }

    #[test]
    fn deluxe_and_plain_listing_cluster_together() {
        let steam = with_year_publisher(record("steam", "1", "super game"), 2020, "Acme");
        let psn = with_year_publisher(record("psn", "2", "super game"), 2020, "Acme Inc");

        let score = engine().score(&steam, &psn);
        assert_eq!(score.publisher, Some(1.0));
        assert!(score.combined >= DedupConfig::default().merge_threshold);

        let outcome = engine().cluster(&[steam, psn]).unwrap();
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.clusters[0].members.len(), 2);
        assert!(outcome.clusters[0].confidence >= 0.85);
    }

    #[test]
    fn merges_are_transitive() {
        let a = record("steam", "a", "star raider");
        let b = record("psn", "b", "star raiders");
        let c = record("xbox", "c", "star raiders 2");
        let e = engine();
        let threshold = e.config().merge_threshold;
        assert!(e.score(&a, &b).combined >= threshold);
        assert!(e.score(&b, &c).combined >= threshold);
        assert!(e.score(&a, &c).combined < threshold);

        let outcome = e.cluster(&[c, a, b]).unwrap();
        assert_eq!(outcome.clusters.len(), 1);
        assert_eq!(outcome.clusters[0].members.len(), 3);
        assert_eq!(outcome.clusters[0].confidence, 0.8571);
        // A~C is a near miss but already shares a cluster.
        assert!(outcome.review.is_empty());
    }

    #[test]
    fn clustering_is_idempotent_and_order_independent() {
        let records = vec![
            with_year_publisher(record("steam", "1", "hollow knight"), 2017, "Team Cherry"),
            with_year_publisher(record("nintendo", "2", "hollow knight"), 2018, "Team Cherry"),
            record("psn", "3", "hades"),
            record("xbox", "4", "hades ii"),
            record("steam", "5", "the witness"),
            record("xbox", "6", "witness"),
        ];
        let e = engine();
        let first = e.cluster(&records).unwrap();

        let flattened = first
            .clusters
            .iter()
            .flat_map(|c| c.members.clone())
            .collect::<Vec<_>>();
        let second = e.cluster(&flattened).unwrap();
        assert_eq!(first, second);

        let mut reversed = records.clone();
        reversed.reverse();
        assert_eq!(first, e.cluster(&reversed).unwrap());
        assert_eq!(
            partition(&first),
            vec![
                vec!["nintendo:2".to_string(), "steam:1".to_string()],
                vec!["psn:3".to_string()],
                vec!["steam:5".to_string(), "xbox:6".to_string()],
                vec!["xbox:4".to_string()],
            ]
        );
    }

    #[test]
    fn canonical_prefers_completeness_then_source_priority() {
        let mut xbox = with_year_publisher(record("xbox", "x", "celeste"), 2018, "Matt Makes Games");
        xbox.price = Some(Price::new(1999, "USD"));
        let steam = with_year_publisher(record("steam", "s", "celeste"), 2018, "Matt Makes Games");
        let psn = with_year_publisher(record("psn", "p", "celeste"), 2018, "Matt Makes Games");

        let outcome = engine().cluster(&[steam.clone(), psn.clone(), xbox]).unwrap();
        assert_eq!(outcome.clusters[0].canonical.source, "xbox");

        let tie = engine().cluster(&[psn, steam]).unwrap();
        assert_eq!(tie.clusters[0].canonical.source, "steam");
    }

    #[test]
    fn near_misses_go_to_review() {
        let a = record("steam", "a", "space raider");
        let b = record("psn", "b", "space raiders 2");
        let outcome = engine().cluster(&[a, b]).unwrap();
        assert_eq!(outcome.clusters.len(), 2);
        assert_eq!(outcome.review.len(), 1);
        assert_eq!(outcome.review[0].left.to_string(), "psn:b");
        assert!(outcome.review[0].score < 0.85 && outcome.review[0].score >= 0.75);
    }

    #[test]
    fn unknown_year_and_publisher_are_neutral() {
        let known = with_year_publisher(record("steam", "1", "celeste"), 2018, "Matt Makes Games");
        let bare = record("psn", "2", "celeste");
        let score = engine().score(&known, &bare);
        assert_eq!(score.year, None);
        assert_eq!(score.publisher, None);
        assert_eq!(score.combined, 1.0);

        let far = with_year_publisher(record("xbox", "3", "celeste"), 2009, "Someone Else");
        assert!(engine().score(&known, &far).combined < 0.85);
    }

    #[test]
    fn malformed_input_is_rejected() {
        let dup = record("steam", "1", "portal");
        let err = engine().cluster(&[dup.clone(), dup]).unwrap_err();
        assert!(matches!(err, DedupeError::DuplicateKey(_)));

        let empty = record("steam", "2", " ");
        let err = engine().cluster(&[empty]).unwrap_err();
        assert!(matches!(err, DedupeError::EmptyTitleKey(_)));

        let bad = DedupEngine::new(DedupConfig {
            review_threshold: 0.9,
            ..DedupConfig::default()
        });
        assert!(matches!(
            bad.cluster(&[]).unwrap_err(),
            DedupeError::InvalidConfig(_)
        ));
    }

    #[test]
    fn blocking_ignores_leading_articles_and_punctuation() {
        assert_eq!(blocking_key("the witness", 4), "witn");
        assert_eq!(blocking_key("witness", 4), "witn");
        assert_eq!(blocking_key("a", 4), "a");
        assert_eq!(blocking_key("1 2 3 go", 4), "123g");
        assert_eq!(party_key("Acme, Inc."), "acme");
        assert_eq!(party_key("Co"), "co");
    }
}
