use std::collections::HashMap;
use std::sync::Arc;

use bagpipe_api::decoder::{DecoderFactory, MessageDecoder};
use bagpipe_api::error::SourceError;
use bagpipe_api::schema::SchemaTable;

/// Decoder factories by message encoding.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    factories: HashMap<String, Arc<dyn DecoderFactory>>,
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("encodings", &self.encodings())
            .finish()
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. A later factory for the same encoding wins.
    pub fn register(&mut self, factory: Arc<dyn DecoderFactory>) {
        let encoding = factory.encoding().to_string();
        if self.factories.insert(encoding.clone(), factory).is_some() {
            tracing::warn!(encoding = %encoding, "decoder factory replaced");
        }
    }

    pub fn with(mut self, factory: Arc<dyn DecoderFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn encodings(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    pub fn create(
        &self,
        encoding: &str,
        schema_name: Option<&str>,
        schemas: &SchemaTable,
    ) -> Result<Arc<dyn MessageDecoder>, SourceError> {
        let factory = self.factories.get(encoding).ok_or_else(|| {
            SourceError::format(format!("no decoder for message encoding '{encoding}'"))
        })?;
        factory.create(schema_name, schemas)
    }
}

#[cfg(test)]
mod tests {
    use bagpipe_api::error::ErrorKind;
    use bagpipe_format_json::JsonDecoderFactory;

    use super::*;

    #[test]
    fn test_create_by_encoding() {
        let registry = DecoderRegistry::new().with(Arc::new(JsonDecoderFactory));
        assert_eq!(registry.encodings(), vec!["json"]);

        let decoder = registry.create("json", None, &SchemaTable::new()).unwrap();
        assert_eq!(decoder.decode(br#"{"x":1}"#).unwrap()["x"], 1);

        let err = registry.create("cdr", None, &SchemaTable::new()).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Format);
        assert!(err.message.contains("'cdr'"));
    }
}
