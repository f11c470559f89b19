//! Message schemas and the canonical wire encoding.
//!
//! An RPC request body is a flat field → value mapping. A [`Schema`] names
//! one message kind and the fields it requires, so that construction fails
//! before anything touches the broker, and so that a server can validate a
//! decoded payload without sharing types with the caller.
//!
//! The encoding is canonical: fields live in a [`BTreeMap`], so equal field
//! values always serialize to identical bytes regardless of insertion order.
//! Client and server share this single encode/decode pair; nothing on the
//! wire is a re-encoded string of a string.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A message body: field name → JSON value, in sorted key order.
pub type Fields = BTreeMap<String, Value>;

/// Value kinds a schema field may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::Bool => value.is_boolean(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            // An integer is an acceptable float on the wire.
            FieldType::Float => value.is_number(),
            FieldType::Str => value.is_string(),
            FieldType::List => value.is_array(),
            FieldType::Map => value.is_object(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Str => "str",
            FieldType::List => "list",
            FieldType::Map => "map",
        }
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    ty: FieldType,
    required: bool,
}

/// Field definitions for one message kind.
///
/// Built fluently:
///
/// ```
/// use queue_rpc::{FieldType, Schema};
///
/// let add = Schema::new("add")
///     .field("x", FieldType::Int)
///     .field("y", FieldType::Int);
/// assert_eq!(add.kind(), "add");
/// ```
#[derive(Debug, Clone)]
pub struct Schema {
    kind: String,
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Start a schema for the given message kind.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: true,
        });
        self
    }

    /// Add an optional field. When present it must still match `ty`.
    pub fn optional(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            ty,
            required: false,
        });
        self
    }

    /// The message kind this schema describes.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Check a field map against this schema.
    ///
    /// Unknown extra fields are ignored; they pass through the encoding
    /// untouched.
    pub fn validate(&self, fields: &Fields) -> Result<()> {
        for spec in &self.fields {
            match fields.get(&spec.name) {
                Some(value) => {
                    if !spec.ty.matches(value) {
                        return Err(Error::Validation(format!(
                            "{}: field '{}' expected {}, got {value}",
                            self.kind,
                            spec.name,
                            spec.ty.name(),
                        )));
                    }
                }
                None if spec.required => {
                    return Err(Error::Validation(format!(
                        "{}: missing required field '{}'",
                        self.kind, spec.name,
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// A validated RPC request body.
///
/// Constructed immediately before a call and immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: String,
    fields: Fields,
}

impl Message {
    /// Validate `fields` against `schema` and build the message.
    pub fn new(schema: &Schema, fields: Fields) -> Result<Self> {
        schema.validate(&fields)?;
        Ok(Self {
            kind: schema.kind.clone(),
            fields,
        })
    }

    /// The message kind.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The validated field map.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Canonical byte encoding of the field map.
    ///
    /// Deterministic: equal field values produce equal bytes.
    pub fn encode(&self) -> Result<Bytes> {
        encode_fields(&self.fields)
    }
}

/// Encode a field map to its canonical bytes.
pub fn encode_fields(fields: &Fields) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(fields)?))
}

/// Decode canonical bytes back into a field map.
///
/// Fails with [`Error::InvalidEnvelope`] if the body is not a JSON object.
pub fn decode_fields(bytes: &[u8]) -> Result<Fields> {
    let value: Value = serde_json::from_slice(bytes)?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(Error::InvalidEnvelope(format!(
            "request body must be an object, got {other}"
        ))),
    }
}

/// Mapping from message kind to [`Schema`].
///
/// Servers look schemas up here to validate decoded payloads; callers can
/// build messages by kind without holding the schema themselves.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under its kind, replacing any previous entry.
    pub fn register(&mut self, schema: Schema) {
        self.schemas.insert(schema.kind.clone(), schema);
    }

    /// Look up the schema for a message kind.
    pub fn get(&self, kind: &str) -> Option<&Schema> {
        self.schemas.get(kind)
    }

    /// Build a validated [`Message`] of the given kind.
    pub fn build(&self, kind: &str, fields: Fields) -> Result<Message> {
        let schema = self
            .schemas
            .get(kind)
            .ok_or_else(|| Error::Validation(format!("unknown message kind '{kind}'")))?;
        Message::new(schema, fields)
    }
}

/// Structured reply body: the handler's result, or its reported failure.
///
/// Externally tagged on the wire: `{"ok": ...}` or `{"err": {"message": ...}}`.
/// This is what lets a caller distinguish "the handler failed" from "nobody
/// answered".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    #[serde(rename = "ok")]
    Ok(Value),
    #[serde(rename = "err")]
    Err(ReplyError),
}

/// The failure half of a [`Reply`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplyError {
    pub message: String,
}

impl Reply {
    /// Build a failure reply from any displayable error.
    pub fn from_error(err: impl std::fmt::Display) -> Self {
        Reply::Err(ReplyError {
            message: err.to_string(),
        })
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode from wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
