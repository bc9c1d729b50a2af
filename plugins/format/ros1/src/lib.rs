//! Decoder for the ROS1 message serialization.
//!
//! Fields are laid out back to back in schema order, little-endian, with no
//! padding. Strings and dynamic arrays carry a `u32` length prefix; fixed
//! arrays do not.

use std::sync::Arc;

use base64::Engine;
use serde_json::{Map, Value};

use bagpipe_api::decoder::{DecoderFactory, MessageDecoder};
use bagpipe_api::error::SourceError;
use bagpipe_api::schema::{FieldDefinition, FieldType, SchemaDefinition, SchemaTable};

/// Nesting deeper than this is treated as a recursive schema.
const MAX_DEPTH: usize = 32;

pub struct Ros1DecoderFactory;

impl DecoderFactory for Ros1DecoderFactory {
    fn encoding(&self) -> &str {
        "ros1"
    }

    fn create(
        &self,
        schema_name: Option<&str>,
        schemas: &SchemaTable,
    ) -> Result<Arc<dyn MessageDecoder>, SourceError> {
        let root = schema_name
            .ok_or_else(|| SourceError::schema("ros1 messages need a schema"))?;
        check_schema(root, schemas, 0)?;
        Ok(Arc::new(Ros1Decoder {
            root: root.to_string(),
            schemas: schemas.clone(),
        }))
    }
}

/// Every nested type must resolve, and nesting must be finite.
fn check_schema(name: &str, schemas: &SchemaTable, depth: usize) -> Result<(), SourceError> {
    if depth > MAX_DEPTH {
        return Err(SourceError::schema(format!(
            "schema '{name}' nests deeper than {MAX_DEPTH} levels"
        )));
    }
    let schema = schemas
        .get(name)
        .ok_or_else(|| SourceError::schema(format!("unknown schema '{name}'")))?;
    for field in &schema.fields {
        if let FieldType::Complex(nested) = &field.field_type {
            check_schema(nested, schemas, depth + 1)
                .map_err(|e| e.with_context(format!("{name}.{}", field.name)))?;
        }
    }
    Ok(())
}

pub struct Ros1Decoder {
    root: String,
    schemas: SchemaTable,
}

impl MessageDecoder for Ros1Decoder {
    fn decode(&self, bytes: &[u8]) -> Result<Value, SourceError> {
        let schema = self
            .schemas
            .get(&self.root)
            .ok_or_else(|| SourceError::schema(format!("unknown schema '{}'", self.root)))?;
        let mut reader = Reader { buf: bytes, pos: 0 };
        let value = reader.message(schema, &self.schemas)?;
        if reader.pos != bytes.len() {
            return Err(SourceError::format(format!(
                "{} trailing bytes after '{}'",
                bytes.len() - reader.pos,
                self.root
            )));
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SourceError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.buf.len());
        let Some(end) = end else {
            return Err(SourceError::format(format!(
                "message truncated: need {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len() - self.pos
            )));
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SourceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, SourceError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, SourceError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> Result<usize, SourceError> {
        let len = self.u32()? as usize;
        // Every element takes at least one byte.
        if len > self.buf.len() - self.pos {
            return Err(SourceError::format(format!(
                "length {len} at offset {} exceeds message size",
                self.pos - 4
            )));
        }
        Ok(len)
    }

    fn message(&mut self, schema: &SchemaDefinition, schemas: &SchemaTable) -> Result<Value, SourceError> {
        let mut map = Map::with_capacity(schema.fields.len());
        for field in &schema.fields {
            let value = self
                .field(field, schemas)
                .map_err(|e| e.with_context(format!("{}.{}", schema.name, field.name)))?;
            map.insert(field.name.clone(), value);
        }
        Ok(Value::Object(map))
    }

    fn field(&mut self, field: &FieldDefinition, schemas: &SchemaTable) -> Result<Value, SourceError> {
        if !field.is_array {
            return self.value(&field.field_type, schemas);
        }
        let len = match field.array_length {
            Some(n) => n,
            None => self.len()?,
        };
        if field.field_type == FieldType::UInt8 {
            let bytes = self.take(len)?;
            return Ok(Value::String(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            ));
        }
        let mut items = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            items.push(self.value(&field.field_type, schemas)?);
        }
        Ok(Value::Array(items))
    }

    fn value(&mut self, ty: &FieldType, schemas: &SchemaTable) -> Result<Value, SourceError> {
        let value = match ty {
            FieldType::Bool => Value::Bool(self.array::<1>()?[0] != 0),
            FieldType::Int8 => i8::from_le_bytes(self.array()?).into(),
            FieldType::UInt8 => u8::from_le_bytes(self.array()?).into(),
            FieldType::Int16 => i16::from_le_bytes(self.array()?).into(),
            FieldType::UInt16 => u16::from_le_bytes(self.array()?).into(),
            FieldType::Int32 => self.i32()?.into(),
            FieldType::UInt32 => self.u32()?.into(),
            FieldType::Int64 => i64::from_le_bytes(self.array()?).into(),
            FieldType::UInt64 => u64::from_le_bytes(self.array()?).into(),
            FieldType::Float32 => f64::from(f32::from_le_bytes(self.array()?)).into(),
            FieldType::Float64 => f64::from_le_bytes(self.array()?).into(),
            FieldType::String => {
                let len = self.len()?;
                Value::String(std::str::from_utf8(self.take(len)?)?.to_string())
            }
            FieldType::Time => {
                let sec = self.u32()?;
                let nsec = self.u32()?;
                serde_json::json!({ "sec": sec, "nsec": nsec })
            }
            FieldType::Duration => {
                let sec = self.i32()?;
                let nsec = self.i32()?;
                serde_json::json!({ "sec": sec, "nsec": nsec })
            }
            FieldType::Complex(name) => {
                let schema = schemas
                    .get(name)
                    .ok_or_else(|| SourceError::schema(format!("unknown schema '{name}'")))?;
                self.message(schema, schemas)?
            }
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use bagpipe_api::error::ErrorKind;
    use serde_json::json;

    use super::*;

    fn schemas() -> SchemaTable {
        [
            SchemaDefinition::new(
                "geometry_msgs/Vector3",
                vec![
                    FieldDefinition::new("x", FieldType::Float64),
                    FieldDefinition::new("y", FieldType::Float64),
                    FieldDefinition::new("z", FieldType::Float64),
                ],
            ),
            SchemaDefinition::new(
                "demo/Sample",
                vec![
                    FieldDefinition::new("stamp", FieldType::Time),
                    FieldDefinition::new("frame_id", FieldType::String),
                    FieldDefinition::new("seq", FieldType::UInt32),
                    FieldDefinition::new("offset", FieldType::Duration),
                    FieldDefinition::new("valid", FieldType::Bool),
                    FieldDefinition::new("axes", FieldType::Complex("geometry_msgs/Vector3".into()))
                        .array(Some(2)),
                    FieldDefinition::new("ranges", FieldType::Float32).array(None),
                    FieldDefinition::new("data", FieldType::UInt8).array(None),
                ],
            ),
        ]
        .into_iter()
        .collect()
    }

    #[derive(Default)]
    struct Writer(Vec<u8>);

    impl Writer {
        fn u32(mut self, v: u32) -> Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn i32(mut self, v: i32) -> Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn f32(mut self, v: f32) -> Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn f64(mut self, v: f64) -> Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }

        fn bytes(mut self, v: &[u8]) -> Self {
            self.0.extend_from_slice(v);
            self
        }

        fn string(self, s: &str) -> Self {
            self.u32(s.len() as u32).bytes(s.as_bytes())
        }
    }

    fn sample() -> Vec<u8> {
        Writer::default()
            .u32(10)
            .u32(500)
            .string("base_link")
            .u32(7)
            .i32(-1)
            .i32(250)
            .bytes(&[1])
            .f64(1.0)
            .f64(2.0)
            .f64(3.0)
            .f64(-1.0)
            .f64(0.5)
            .f64(0.0)
            .u32(2)
            .f32(1.5)
            .f32(2.5)
            .u32(3)
            .bytes(&[1, 2, 3])
            .0
    }

    #[test]
    fn test_decode_nested_message() {
        let decoder = Ros1DecoderFactory.create(Some("demo/Sample"), &schemas()).unwrap();
        let value = decoder.decode(&sample()).unwrap();
        assert_eq!(
            value,
            json!({
                "stamp": {"sec": 10, "nsec": 500},
                "frame_id": "base_link",
                "seq": 7,
                "offset": {"sec": -1, "nsec": 250},
                "valid": true,
                "axes": [{"x": 1.0, "y": 2.0, "z": 3.0}, {"x": -1.0, "y": 0.5, "z": 0.0}],
                "ranges": [1.5, 2.5],
                "data": "AQID",
            })
        );
    }

    #[test]
    fn test_truncated_message_fails() {
        let decoder = Ros1DecoderFactory.create(Some("demo/Sample"), &schemas()).unwrap();
        let mut bytes = sample();
        bytes.truncate(bytes.len() - 2);
        let err = decoder.decode(&bytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Format);
        assert!(err.message.contains("demo/Sample.data"), "{err}");
    }

    #[test]
    fn test_trailing_bytes_fail() {
        let decoder = Ros1DecoderFactory.create(Some("demo/Sample"), &schemas()).unwrap();
        let mut bytes = sample();
        bytes.push(0);
        assert!(decoder.decode(&bytes).unwrap_err().message.contains("trailing"));
    }

    #[test]
    fn test_oversized_length_prefix_fails() {
        let decoder = Ros1DecoderFactory
            .create(Some("demo/Sample"), &schemas())
            .unwrap();
        let bytes = Writer::default().u32(0).u32(0).u32(u32::MAX).0;
        assert_eq!(decoder.decode(&bytes).unwrap_err().kind, ErrorKind::Format);
    }

    #[test]
    fn test_create_checks_schema() {
        let factory = Ros1DecoderFactory;
        assert_eq!(
            factory.create(None, &schemas()).err().unwrap().kind,
            ErrorKind::Schema
        );
        assert!(factory.create(Some("demo/Missing"), &schemas()).is_err());

        let mut broken = schemas();
        broken.insert(SchemaDefinition::new(
            "demo/Broken",
            vec![FieldDefinition::new("p", FieldType::Complex("demo/Nope".into()))],
        ));
        let err = factory.create(Some("demo/Broken"), &broken).err().unwrap();
        assert!(err.message.contains("demo/Nope"));
    }

    #[test]
    fn test_recursive_schema_rejected() {
        let table: SchemaTable = [SchemaDefinition::new(
            "demo/Node",
            vec![FieldDefinition::new("next", FieldType::Complex("demo/Node".into()))],
        )]
        .into_iter()
        .collect();
        let err = Ros1DecoderFactory.create(Some("demo/Node"), &table).err().unwrap();
        assert_eq!(err.kind, ErrorKind::Schema);
    }
}
