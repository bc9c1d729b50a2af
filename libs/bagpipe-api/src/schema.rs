use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::SourceError;

/// Type of a single schema field.
///
/// Primitive names follow the recorded-log convention (`float64`, `uint8`,
/// `string`, `time`, ...). Anything else names another schema in the same
/// [`SchemaTable`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Time,
    Duration,
    /// Nested message, by schema name.
    Complex(String),
}

impl FieldType {
    /// Encoded width in bytes for fixed-size primitives.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            FieldType::Bool | FieldType::Int8 | FieldType::UInt8 => Some(1),
            FieldType::Int16 | FieldType::UInt16 => Some(2),
            FieldType::Int32 | FieldType::UInt32 | FieldType::Float32 => Some(4),
            FieldType::Int64
            | FieldType::UInt64
            | FieldType::Float64
            | FieldType::Time
            | FieldType::Duration => Some(8),
            FieldType::String | FieldType::Complex(_) => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::UInt8 => "uint8",
            FieldType::UInt16 => "uint16",
            FieldType::UInt32 => "uint32",
            FieldType::UInt64 => "uint64",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::String => "string",
            FieldType::Time => "time",
            FieldType::Duration => "duration",
            FieldType::Complex(name) => name,
        };
        f.write_str(name)
    }
}

impl FromStr for FieldType {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s {
            "bool" => FieldType::Bool,
            "int8" | "byte" => FieldType::Int8,
            "int16" => FieldType::Int16,
            "int32" => FieldType::Int32,
            "int64" => FieldType::Int64,
            "uint8" | "char" => FieldType::UInt8,
            "uint16" => FieldType::UInt16,
            "uint32" => FieldType::UInt32,
            "uint64" => FieldType::UInt64,
            "float32" => FieldType::Float32,
            "float64" => FieldType::Float64,
            "string" => FieldType::String,
            "time" => FieldType::Time,
            "duration" => FieldType::Duration,
            "" => return Err(SourceError::schema("empty field type")),
            other => FieldType::Complex(other.to_string()),
        };
        Ok(ty)
    }
}

impl TryFrom<String> for FieldType {
    type Error = SourceError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FieldType> for String {
    fn from(ty: FieldType) -> Self {
        ty.to_string()
    }
}

/// A single field in a schema.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub is_array: bool,
    /// Fixed length for `T[N]` arrays; `None` for dynamic arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_length: Option<usize>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            is_array: false,
            array_length: None,
        }
    }

    pub fn array(mut self, length: Option<usize>) -> Self {
        self.is_array = true;
        self.array_length = length;
        self
    }
}

/// Structural definition of one message type.
///
/// Two definitions are the same schema only if they are structurally equal
/// (same field names, types and array shapes, in the same order).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    pub fields: Vec<FieldDefinition>,
}

impl SchemaDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// Schema name → definition, for every schema a log references
/// (including nested ones).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SchemaTable {
    schemas: BTreeMap<String, SchemaDefinition>,
}

impl SchemaTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, schema: SchemaDefinition) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, name: &str) -> Option<&SchemaDefinition> {
        self.schemas.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaDefinition> {
        self.schemas.values()
    }

    /// Merge `other` into `self`.
    ///
    /// Same name with a different structure is a schema conflict.
    pub fn merge(&mut self, other: &SchemaTable) -> Result<(), SourceError> {
        for schema in other.iter() {
            match self.schemas.get(&schema.name) {
                Some(existing) if existing != schema => {
                    return Err(SourceError::schema(format!(
                        "schema '{}' has conflicting definitions",
                        schema.name
                    )));
                }
                Some(_) => {}
                None => self.insert(schema.clone()),
            }
        }
        Ok(())
    }
}

impl FromIterator<SchemaDefinition> for SchemaTable {
    fn from_iter<I: IntoIterator<Item = SchemaDefinition>>(iter: I) -> Self {
        let mut table = SchemaTable::new();
        for schema in iter {
            table.insert(schema);
        }
        table
    }
}
