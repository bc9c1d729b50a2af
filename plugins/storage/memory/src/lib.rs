use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use bagpipe_api::error::SourceError;
use bagpipe_api::store::{BlockStore, CacheDirectory, LogIdentity, StoredBlock};

type BlockKey = (String, LogIdentity, u32);

/// Block store that lives as long as the process. Used in tests and for
/// runs where nothing should touch the disk.
#[derive(Default)]
pub struct MemoryBlockStore {
    directories: RwLock<HashMap<String, CacheDirectory>>,
    blocks: RwLock<HashMap<BlockKey, StoredBlock>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored block records, across all logs.
    pub async fn block_count(&self) -> usize {
        self.blocks.read().await.len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn read_directory(
        &self,
        log_key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<CacheDirectory>, SourceError>> + Send + '_>> {
        let log_key = log_key.to_string();
        Box::pin(async move { Ok(self.directories.read().await.get(&log_key).cloned()) })
    }

    fn write_directory(
        &self,
        directory: &CacheDirectory,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let directory = directory.clone();
        Box::pin(async move {
            self.directories
                .write()
                .await
                .insert(directory.log_key.clone(), directory);
            Ok(())
        })
    }

    fn read_block(
        &self,
        log_key: &str,
        identity: &LogIdentity,
        index: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<StoredBlock>, SourceError>> + Send + '_>> {
        let key = (log_key.to_string(), identity.clone(), index);
        Box::pin(async move { Ok(self.blocks.read().await.get(&key).cloned()) })
    }

    fn write_block(
        &self,
        log_key: &str,
        identity: &LogIdentity,
        block: &StoredBlock,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let key = (log_key.to_string(), identity.clone(), block.index);
        let block = block.clone();
        Box::pin(async move {
            self.blocks.write().await.insert(key, block);
            Ok(())
        })
    }

    fn invalidate(
        &self,
        directory: &CacheDirectory,
    ) -> Pin<Box<dyn Future<Output = Result<(), SourceError>> + Send + '_>> {
        let directory = directory.clone();
        Box::pin(async move {
            let mut blocks = self.blocks.write().await;
            for index in &directory.blocks {
                blocks.remove(&(
                    directory.log_key.clone(),
                    directory.identity.clone(),
                    *index,
                ));
            }
            self.directories.write().await.remove(&directory.log_key);
            Ok(())
        })
    }
}
