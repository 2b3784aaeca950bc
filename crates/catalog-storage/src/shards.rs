//! Sharded JSON output: one file per leading letter plus a catch-all, written atomically.

use std::path::{Path, PathBuf};

use catalog_core::{all_shard_keys, shard_file_name, shard_key, Cluster, NormalizedRecord};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::{sha256_hex, write_atomic};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SHARD_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("destination {path} is not writable: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {name}: {source}")]
    Serialize {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize)]
struct ShardDocument<'a> {
    schema_version: u32,
    shard: String,
    entity_count: usize,
    entities: Vec<&'a Cluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardFileSummary {
    pub shard: String,
    pub file: String,
    pub entities: usize,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardManifest {
    pub schema_version: u32,
    pub total_entities: usize,
    pub shards: Vec<ShardFileSummary>,
}

#[derive(Debug, Clone)]
pub struct WriteResult {
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: ShardManifest,
}

#[derive(Debug, Clone)]
pub struct ShardWriter {
    root: PathBuf,
}

fn entity_order(a: &Cluster, b: &Cluster) -> std::cmp::Ordering {
    let (ca, cb) = (&a.canonical, &b.canonical);
    ca.title_key
        .cmp(&cb.title_key)
        .then_with(|| ca.source_native_id.cmp(&cb.source_native_id))
        .then_with(|| ca.source.cmp(&cb.source))
        .then_with(|| a.cluster_id.cmp(&b.cluster_id))
}

fn member_order(a: &NormalizedRecord, b: &NormalizedRecord) -> std::cmp::Ordering {
    a.title_key
        .cmp(&b.title_key)
        .then_with(|| a.source_native_id.cmp(&b.source_native_id))
        .then_with(|| a.source.cmp(&b.source))
}

impl ShardWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Partition clusters by the canonical title's first character and write every
    /// shard (empty ones included) plus a manifest. Output bytes depend only on the
    /// cluster set, not on its order.
    pub async fn write(&self, clusters: &[Cluster]) -> Result<WriteResult, WriteError> {
        let mut ordered = clusters.to_vec();
        for cluster in &mut ordered {
            cluster.members.sort_by(member_order);
        }
        ordered.sort_by(entity_order);

        let mut summaries = Vec::new();
        let mut total_entities = 0usize;
        for key in all_shard_keys() {
            let entities = ordered
                .iter()
                .filter(|c| shard_key(&c.canonical.title_key) == key)
                .collect::<Vec<_>>();
            let name = shard_file_name(key);
            let doc = ShardDocument {
                schema_version: SHARD_SCHEMA_VERSION,
                shard: key.to_string(),
                entity_count: entities.len(),
                entities,
            };
            let mut bytes =
                serde_json::to_vec_pretty(&doc).map_err(|source| WriteError::Serialize {
                    name: name.clone(),
                    source,
                })?;
            bytes.push(b'\n');

            let path = self.root.join(&name);
            write_atomic(&path, &bytes)
                .await
                .map_err(|source| WriteError::Io { path, source })?;

            total_entities += doc.entity_count;
            summaries.push(ShardFileSummary {
                shard: key.to_string(),
                file: name,
                entities: doc.entity_count,
                bytes: bytes.len() as u64,
                sha256: sha256_hex(&bytes),
            });
        }

        let manifest = ShardManifest {
            schema_version: SHARD_SCHEMA_VERSION,
            total_entities,
            shards: summaries,
        };
        let mut bytes =
            serde_json::to_vec_pretty(&manifest).map_err(|source| WriteError::Serialize {
                name: MANIFEST_FILE.to_string(),
                source,
            })?;
        bytes.push(b'\n');
        let manifest_path = self.root.join(MANIFEST_FILE);
        write_atomic(&manifest_path, &bytes)
            .await
            .map_err(|source| WriteError::Io {
                path: manifest_path.clone(),
                source,
            })?;

        info!(
            root = %self.root.display(),
            total_entities,
            "wrote catalog shards"
        );

        Ok(WriteResult {
            root: self.root.clone(),
            manifest_path,
            manifest,
        })
    }
}
