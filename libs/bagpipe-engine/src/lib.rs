pub mod block_cache;
pub mod bootstrap;
pub mod caching_source;
pub mod config;
pub mod cursor;
pub mod decoder_registry;
pub mod deserializing;
pub mod error;
pub mod memory_source;
pub mod merger;
pub mod persistent;
pub mod schema_registry;
pub mod transport;
mod merge;
mod sizing;
mod sync;

pub use bootstrap::{LogOpener, OpenedLog, Pipeline, open_logs};
pub use caching_source::{CacheOptions, CachingSource};
pub use config::{ConfigParser, PlaybackConfig, TomlParser};
pub use cursor::MessageCursor;
pub use decoder_registry::DecoderRegistry;
pub use deserializing::DeserializingSource;
pub use error::EngineError;
pub use merger::{IdleChildPolicy, SourceMerger};
pub use persistent::{PersistentCacheWriter, PersistentTarget};
pub use schema_registry::{SchemaHandle, SchemaRegistry};
pub use sizing::estimate_object_size;
pub use transport::{CursorMethod, CursorProxy, CursorRequest, CursorResponse, CursorServer};
