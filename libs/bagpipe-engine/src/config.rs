use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::EngineError;

/// Root configuration, parsed from TOML (or any registered [`ConfigParser`]).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable block cache. Absent means memory only.
    #[serde(default)]
    pub persistent_cache: Option<PersistentCacheConfig>,

    #[serde(default)]
    pub iterator: IteratorConfig,

    /// Leaf log definitions.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,
    /// Blocks after the playhead that are never evicted.
    #[serde(default = "default_lookahead_blocks")]
    pub lookahead_blocks: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_duration_ms: default_block_duration_ms(),
            max_cache_bytes: default_max_cache_bytes(),
            lookahead_blocks: default_lookahead_blocks(),
        }
    }
}

fn default_block_duration_ms() -> u64 {
    1000
}

fn default_max_cache_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_lookahead_blocks() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PersistentCacheConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IteratorConfig {
    /// Wall-clock budget of one `next_batch` call.
    #[serde(default = "default_batch_ms")]
    pub batch_ms: u64,
    /// Items buffered between the producer task and the cursor.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            batch_ms: default_batch_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_batch_ms() -> u64 {
    500
}

fn default_channel_capacity() -> usize {
    256
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_source_format")]
    pub format: String,
    /// How the log's identity is derived for the persistent cache.
    #[serde(default)]
    pub identity: IdentityMode,
}

fn default_source_format() -> String {
    "jsonl".into()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityMode {
    /// File size + modification time.
    #[default]
    Metadata,
    /// SHA-256 of the whole file.
    Content,
}

/// Configuration file format. Selected by file extension.
pub trait ConfigParser: Send + Sync {
    fn extensions(&self) -> &[&str];
    fn parse(&self, content: &str) -> Result<PlaybackConfig, EngineError>;
}

pub struct TomlParser;

impl ConfigParser for TomlParser {
    fn extensions(&self) -> &[&str] {
        &["toml"]
    }

    fn parse(&self, content: &str) -> Result<PlaybackConfig, EngineError> {
        toml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))
    }
}

impl PlaybackConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        Self::load_with(path, &[&TomlParser])
    }

    /// Load configuration, picking the parser by file extension.
    pub fn load_with(
        path: impl AsRef<Path>,
        parsers: &[&dyn ConfigParser],
    ) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let parser = parsers
            .iter()
            .find(|p| p.extensions().contains(&ext))
            .ok_or_else(|| {
                EngineError::Config(format!("{}: no parser for '.{ext}' files", path.display()))
            })?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        let config = parser
            .parse(&content)
            .map_err(|e| e.with_context(path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, EngineError> {
        let config = TomlParser.parse(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.cache.block_duration_ms == 0 {
            return Err(EngineError::Config(
                "cache.block_duration_ms must be greater than 0".into(),
            ));
        }
        if self.iterator.channel_capacity == 0 {
            return Err(EngineError::Config(
                "iterator.channel_capacity must be greater than 0".into(),
            ));
        }
        for (i, source) in self.sources.iter().enumerate() {
            if self.sources[..i].iter().any(|s| s.name == source.name) {
                return Err(EngineError::Config(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
        }
        Ok(())
    }

    pub fn block_duration_ns(&self) -> u64 {
        self.cache.block_duration_ms.saturating_mul(1_000_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let config = PlaybackConfig::parse(
            r#"
            [cache]
            block_duration_ms = 250
            max_cache_bytes = 1024
            lookahead_blocks = 4

            [persistent_cache]
            dir = "/tmp/bagpipe"

            [iterator]
            batch_ms = 100
            channel_capacity = 8

            [[sources]]
            name = "front"
            path = "front.jsonl"

            [[sources]]
            name = "rear"
            path = "rear.jsonl"
            format = "jsonl"
            identity = "content"
            "#,
        )
        .unwrap();

        assert_eq!(config.cache.block_duration_ms, 250);
        assert_eq!(config.block_duration_ns(), 250_000_000);
        assert_eq!(config.cache.lookahead_blocks, 4);
        assert_eq!(
            config.persistent_cache.unwrap().dir,
            PathBuf::from("/tmp/bagpipe")
        );
        assert_eq!(config.iterator.channel_capacity, 8);
        assert_eq!(config.sources.len(), 2);
        assert_eq!(config.sources[0].format, "jsonl");
        assert_eq!(config.sources[0].identity, IdentityMode::Metadata);
        assert_eq!(config.sources[1].identity, IdentityMode::Content);
    }

    #[test]
    fn test_defaults() {
        let config = PlaybackConfig::parse("").unwrap();
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.iterator, IteratorConfig::default());
        assert!(config.persistent_cache.is_none());
        assert!(config.sources.is_empty());
    }

    #[test]
    fn test_rejects_duplicate_source_names() {
        let err = PlaybackConfig::parse(
            r#"
            [[sources]]
            name = "a"
            path = "a.jsonl"

            [[sources]]
            name = "a"
            path = "b.jsonl"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate source name 'a'"));
    }

    #[test]
    fn test_rejects_zero_block_duration() {
        let err = PlaybackConfig::parse("[cache]\nblock_duration_ms = 0\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
