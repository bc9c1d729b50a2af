use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use sha2::{Digest, Sha256};

use crate::error::SourceError;
use crate::time::Time;

/// Identity of a log's contents. Cached blocks are only reused while the
/// identity of the log they came from is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct LogIdentity(String);

impl LogIdentity {
    /// SHA-256 of the full contents.
    pub fn from_content(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        Self(hex)
    }

    /// Cheap identity from file size and modification time.
    pub fn from_metadata(size: u64, mtime_ns: u128) -> Self {
        Self(format!("m{size:x}-{mtime_ns:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LogIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directory record: one per log key, lists the blocks stored for it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheDirectory {
    pub log_key: String,
    pub identity: LogIdentity,
    /// Blocks of a different duration cannot be reused.
    pub block_duration_ns: u64,
    pub blocks: BTreeSet<u32>,
}

/// Persisted payload. Raw bytes are stored base64-encoded.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "data")]
pub enum StoredPayload {
    Raw(#[serde(with = "crate::util::base64_bytes")] Vec<u8>),
    Decoded(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoredMessage {
    pub topic: String,
    #[serde(default)]
    pub schema_name: Option<String>,
    pub receive_time: Time,
    /// `true` for messages requested in the parsed format.
    #[serde(default)]
    pub parsed: bool,
    pub size_in_bytes: usize,
    pub payload: StoredPayload,
}

/// One persisted cache block.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StoredBlock {
    pub index: u32,
    pub raw_topics: Vec<String>,
    pub parsed_topics: Vec<String>,
    pub size_in_bytes: u64,
    pub messages: Vec<StoredMessage>,
}

/// Durable storage for frozen cache blocks.
///
/// Block records are keyed by `(identity, index)`; the directory record is
/// keyed by `log_key` and enumerates the stored indices so a stale cache can
/// be dropped without scanning.
pub trait BlockStore: Send + Sync {
    fn read_directory(
        &self,
        log_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CacheDirectory>, SourceError>> + Send + '_>>;

    fn write_directory(
        &self,
        directory: &CacheDirectory,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;

    fn read_block(
        &self,
        log_key: &str,
        identity: &LogIdentity,
        index: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredBlock>, SourceError>> + Send + '_>>;

    fn write_block(
        &self,
        log_key: &str,
        identity: &LogIdentity,
        block: &StoredBlock,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;

    /// Remove the directory record and every block it lists.
    fn invalidate(
        &self,
        directory: &CacheDirectory,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>>;
}
