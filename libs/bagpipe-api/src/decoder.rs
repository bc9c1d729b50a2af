use std::sync::Arc;

use crate::error::SourceError;
use crate::schema::SchemaTable;

/// Runtime decoder for one topic: `bytes -> value`.
///
/// Built once per topic at initialization; `decode()` runs per message and
/// must not keep state between calls.
pub trait MessageDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, SourceError>;
}

/// Decoder factory. Creates decoders for one message encoding.
///
/// - `encoding()`: the `Topic::message_encoding` value handled.
/// - `create()`: derives a decoder from the topic's schema. Failing here
///   disables decoding for that topic only.
pub trait DecoderFactory: Send + Sync {
    fn encoding(&self) -> &str;

    fn create(
        &self,
        schema_name: Option<&str>,
        schemas: &SchemaTable,
    ) -> Result<Arc<dyn MessageDecoder>, SourceError>;
}
