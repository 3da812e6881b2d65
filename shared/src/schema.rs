//! Envelope codec: schema-checked JSON encoding and decoding.
//!
//! A [`Schema`] is an ordered list of field name / primitive type pairs, owned
//! by the protocol definition and immutable at runtime. Encoding takes values
//! positionally in declared order and fails on any arity or type mismatch;
//! decoding is all-or-nothing and fails on a missing or mis-typed field.

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Primitive types a schema field may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    Object,
}

impl FieldType {
    fn name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Text => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
        }
    }
}

/// An ordered mapping of field name to [`FieldType`]. `const`-constructible so
/// protocol message shapes can live in statics.
#[derive(Debug, Clone, Copy)]
pub struct Schema {
    fields: &'static [(&'static str, FieldType)],
}

impl Schema {
    pub const fn new(fields: &'static [(&'static str, FieldType)]) -> Self {
        Self { fields }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encode `values`, positionally matched to the schema's fields, as one
    /// JSON object in UTF-8 text.
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(Error::Schema(format!(
                "expected {} values, got {}",
                self.fields.len(),
                values.len()
            )));
        }
        let mut object = Map::with_capacity(self.fields.len());
        for ((name, field_type), value) in self.fields.iter().zip(values) {
            if !field_type.matches(value) {
                return Err(Error::Schema(format!(
                    "field '{}' expects {}, got {}",
                    name,
                    field_type.name(),
                    type_of(value)
                )));
            }
            object.insert((*name).to_owned(), value.clone());
        }
        Ok(serde_json::to_vec(&Value::Object(object))?)
    }

    /// Decode JSON text back into values in schema order. Fails if any
    /// declared field is absent or mis-typed; extra fields are ignored.
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>> {
        let parsed: Value = serde_json::from_slice(bytes)?;
        let object = parsed
            .as_object()
            .ok_or_else(|| Error::Schema("payload is not a JSON object".to_owned()))?;
        let mut values = Vec::with_capacity(self.fields.len());
        for (name, field_type) in self.fields {
            let value = object
                .get(*name)
                .ok_or_else(|| Error::Schema(format!("missing field '{}'", name)))?;
            if !field_type.matches(value) {
                return Err(Error::Schema(format!(
                    "field '{}' expects {}, got {}",
                    name,
                    field_type.name(),
                    type_of(value)
                )));
            }
            values.push(value.clone());
        }
        Ok(values)
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "text",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
