use std::sync::Arc;

use bagpipe_api::decoder::{DecoderFactory, MessageDecoder};
use bagpipe_api::error::SourceError;
use bagpipe_api::schema::SchemaTable;

/// Payloads that are UTF-8 JSON documents. Schemas are not consulted.
pub struct JsonDecoder;

impl MessageDecoder for JsonDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<serde_json::Value, SourceError> {
        let s = std::str::from_utf8(bytes)?;
        Ok(serde_json::from_str(s)?)
    }
}

// ---- Factory ----

pub struct JsonDecoderFactory;

impl DecoderFactory for JsonDecoderFactory {
    fn encoding(&self) -> &str {
        "json"
    }

    fn create(
        &self,
        _schema_name: Option<&str>,
        _schemas: &SchemaTable,
    ) -> Result<Arc<dyn MessageDecoder>, SourceError> {
        Ok(Arc::new(JsonDecoder))
    }
}

#[cfg(test)]
mod tests {
    use bagpipe_api::error::ErrorKind;

    use super::*;

    #[test]
    fn test_decode_object() {
        let value = JsonDecoder.decode(br#"{"x": 1, "name": "imu"}"#).unwrap();
        assert_eq!(value["x"], 1);
        assert_eq!(value["name"], "imu");
    }

    #[test]
    fn test_rejects_bad_input() {
        assert_eq!(JsonDecoder.decode(b"{\"x\":").unwrap_err().kind, ErrorKind::Format);
        assert!(JsonDecoder.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_factory_ignores_schema() {
        let decoder = JsonDecoderFactory.create(Some("Anything"), &SchemaTable::new()).unwrap();
        assert_eq!(decoder.decode(b"[1,2]").unwrap(), serde_json::json!([1, 2]));
    }
}
