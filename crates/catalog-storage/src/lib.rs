//! Resilient fetch client and atomic, deterministic file output for the catalog.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub mod circuit;
pub mod fetch;
pub mod shards;

pub use circuit::{Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchRequest,
    FetchedResponse, HttpClientConfig, HttpFetcher, ReqwestTransport, RetryDisposition,
    ScriptedTransport, SimpleTokenBucket, SourcePolicy, TokenBucketConfig, Transport,
    TransportError, TransportResponse,
};
pub use shards::{ShardFileSummary, ShardManifest, ShardWriter, WriteError, WriteResult};

pub const CRATE_NAME: &str = "catalog-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to a temp file beside `path`, then rename it into place so readers
/// only ever observe the old file or the complete new one.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    if let Err(err) = write_new_file(&temp_path, bytes).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
