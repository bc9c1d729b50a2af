use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use bagpipe_api::error::SourceError;
use bagpipe_api::store::{BlockStore, CacheDirectory, LogIdentity, StoredBlock};

const DIRECTORY_FILE: &str = "directory.json";

// ---------------------------------------------------------------------------
// FileBlockStore
// ---------------------------------------------------------------------------

/// Block store on the local filesystem, one JSON document per record:
///
/// ```text
/// {root}/{log_key}/directory.json
/// {root}/{log_key}/{identity}/{index}.json
/// ```
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    root: PathBuf,
}

impl FileBlockStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn log_dir(&self, log_key: &str) -> PathBuf {
        self.root.join(path_component(log_key))
    }

    fn directory_path(&self, log_key: &str) -> PathBuf {
        self.log_dir(log_key).join(DIRECTORY_FILE)
    }

    fn identity_dir(&self, log_key: &str, identity: &LogIdentity) -> PathBuf {
        self.log_dir(log_key).join(path_component(identity.as_str()))
    }

    fn block_path(&self, log_key: &str, identity: &LogIdentity, index: u32) -> PathBuf {
        self.identity_dir(log_key, identity).join(format!("{index}.json"))
    }
}

/// Keys come from user config; keep them to one safe path segment.
fn path_component(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Read and parse a JSON record. A missing file is `None`.
async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, SourceError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SourceError::from(e).with_context(path.display())),
    };
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| SourceError::corrupt(e.to_string()).with_context(path.display()))?;
    Ok(Some(value))
}

/// Write through a temporary file so readers never see a partial record.
async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), SourceError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SourceError::from(e).with_context(parent.display()))?;
    }
    let bytes = serde_json::to_vec(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| SourceError::from(e).with_context(tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| SourceError::from(e).with_context(path.display()))
}

async fn remove_file(path: &Path) -> Result<(), SourceError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SourceError::from(e).with_context(path.display())),
    }
}

// ---------------------------------------------------------------------------
// BlockStore impl
// ---------------------------------------------------------------------------

impl BlockStore for FileBlockStore {
    fn read_directory(
        &self,
        log_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CacheDirectory>, SourceError>> + Send + '_>> {
        let path = self.directory_path(log_key);
        Box::pin(async move { read_json(&path).await })
    }

    fn write_directory(
        &self,
        directory: &CacheDirectory,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let path = self.directory_path(&directory.log_key);
        let directory = directory.clone();
        Box::pin(async move { write_json(&path, &directory).await })
    }

    fn read_block(
        &self,
        log_key: &str,
        identity: &LogIdentity,
        index: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredBlock>, SourceError>> + Send + '_>> {
        let path = self.block_path(log_key, identity, index);
        Box::pin(async move {
            let block: Option<StoredBlock> = read_json(&path).await?;
            match block {
                Some(block) if block.index != index => Err(SourceError::corrupt(format!(
                    "{}: holds block {} instead of {index}",
                    path.display(),
                    block.index
                ))),
                other => Ok(other),
            }
        })
    }

    fn write_block(
        &self,
        log_key: &str,
        identity: &LogIdentity,
        block: &StoredBlock,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let path = self.block_path(log_key, identity, block.index);
        let block = block.clone();
        Box::pin(async move { write_json(&path, &block).await })
    }

    fn invalidate(
        &self,
        directory: &CacheDirectory,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let directory = directory.clone();
        Box::pin(async move {
            for index in &directory.blocks {
                remove_file(&self.block_path(&directory.log_key, &directory.identity, *index)).await?;
            }
            let identity_dir = self.identity_dir(&directory.log_key, &directory.identity);
            if let Err(e) = tokio::fs::remove_dir(&identity_dir).await {
                // Left behind if something else was written there.
                tracing::debug!(path = %identity_dir.display(), error = %e, "identity directory not removed");
            }
            remove_file(&self.directory_path(&directory.log_key)).await?;
            tracing::info!(log = %directory.log_key, blocks = directory.blocks.len(), "persistent cache invalidated");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use bagpipe_api::error::ErrorKind;
    use bagpipe_api::store::{StoredMessage, StoredPayload};
    use bagpipe_api::time::Time;

    use super::*;

    fn block(index: u32) -> StoredBlock {
        StoredBlock {
            index,
            raw_topics: vec!["/imu".into()],
            parsed_topics: Vec::new(),
            size_in_bytes: 3,
            messages: vec![StoredMessage {
                topic: "/imu".into(),
                schema_name: None,
                receive_time: Time::new(1, 0),
                parsed: false,
                size_in_bytes: 3,
                payload: StoredPayload::Raw(vec![1, 2, 3]),
            }],
        }
    }

    #[tokio::test]
    async fn test_layout_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlockStore::new(dir.path());
        let identity = LogIdentity::from_metadata(10, 20);

        store.write_block("front", &identity, &block(4)).await.unwrap();
        let directory = CacheDirectory {
            log_key: "front".into(),
            identity: identity.clone(),
            block_duration_ns: 1_000_000_000,
            blocks: BTreeSet::from([4]),
        };
        store.write_directory(&directory).await.unwrap();

        assert!(dir.path().join("front/directory.json").is_file());
        assert!(dir.path().join("front/ma-14/4.json").is_file());

        assert_eq!(store.read_directory("front").await.unwrap(), Some(directory));
        assert_eq!(store.read_block("front", &identity, 4).await.unwrap(), Some(block(4)));
        assert_eq!(store.read_block("front", &identity, 5).await.unwrap(), None);
        assert_eq!(store.read_directory("rear").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_removes_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlockStore::new(dir.path());
        let identity = LogIdentity::from_content(b"log");
        let directory = CacheDirectory {
            log_key: "front".into(),
            identity: identity.clone(),
            block_duration_ns: 1_000,
            blocks: BTreeSet::from([0, 1]),
        };
        for index in 0..2 {
            store.write_block("front", &identity, &block(index)).await.unwrap();
        }
        store.write_directory(&directory).await.unwrap();

        store.invalidate(&directory).await.unwrap();
        assert_eq!(store.read_directory("front").await.unwrap(), None);
        assert_eq!(store.read_block("front", &identity, 0).await.unwrap(), None);
        assert!(!dir.path().join("front").join(identity.as_str()).exists());
    }

    #[tokio::test]
    async fn test_garbage_record_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBlockStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("front")).unwrap();
        std::fs::write(dir.path().join("front/directory.json"), b"{oops").unwrap();
        let err = store.read_directory("front").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Corrupt);
    }

    #[test]
    fn test_keys_stay_inside_root() {
        assert_eq!(path_component("front/left"), "front_left");
        assert_eq!(path_component(".."), "_..");
        assert_eq!(path_component(""), "_");
    }
}
