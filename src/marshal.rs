//! Envelope marshalling.
//!
//! This module defines the byte encoding boundary used to move
//! [`Envelope`]s through an opaque queue transport.
//!
//! ## Key components
//!
//! - [`Marshaller`]: Trait implemented by concrete encodings
//! - [`JsonMarshaller`]: JSON encoding with a configurable wire naming policy
//! - [`TextSafe`]: Base64 decorator for transports that only accept text
//! - [`FieldNaming`]: Wire naming policy, decoupled from in-memory field names
//! - [`SerializationError`]: Unified error type with tracing context
//!
//! The wire format renames struct field names according to the configured
//! [`FieldNaming`] in both directions, so the round-trip law
//! `deserialize(serialize(e)) == e` holds under a fixed policy. Payload
//! metadata keys are user data and are never rewritten.

pub mod json;
pub mod text_safe;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing_error::SpanTrace;

use crate::Envelope;

pub use json::JsonMarshaller;
pub use text_safe::TextSafe;

/// Trait implemented by concrete envelope encodings.
///
/// A marshaller converts envelopes to and from the byte representation the
/// queue transport carries. Implementations must be deterministic: identical
/// envelopes under identical configuration produce identical bytes, which
/// the signing layer relies on.
pub trait Marshaller: Send + Sync {
    /// Serialize an envelope into transport bytes.
    fn serialize<T: Serialize>(&self, envelope: &Envelope<T>)
        -> Result<Vec<u8>, SerializationError>;

    /// Deserialize transport bytes back into an envelope.
    ///
    /// When `expected_kind` is given, the envelope's `type` field must match
    /// it; a foreign type name fails with [`SerializationError`] instead of
    /// attempting a payload decode.
    fn deserialize<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        expected_kind: Option<&str>,
    ) -> Result<Envelope<T>, SerializationError>;
}

impl<M: Marshaller> Marshaller for &M {
    fn serialize<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
    ) -> Result<Vec<u8>, SerializationError> {
        (*self).serialize(envelope)
    }

    fn deserialize<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        expected_kind: Option<&str>,
    ) -> Result<Envelope<T>, SerializationError> {
        (*self).deserialize(bytes, expected_kind)
    }
}

/// Wire naming policy for struct field names.
///
/// In-memory field names are `snake_case`; the policy controls how they
/// appear on the wire. Conversion is applied in both directions so the
/// payload shape stays decoupled from the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldNaming {
    /// Emit field names exactly as they are in memory.
    #[default]
    Preserve,
    /// `member_name` -> `member-name`
    KebabCaseLower,
    /// `member_name` -> `member_name` (explicit snake_case)
    SnakeCase,
    /// `member_name` -> `memberName`
    CamelCase,
}

#[derive(Clone, Copy)]
pub(crate) enum Direction {
    ToWire,
    FromWire,
}

impl FieldNaming {
    pub(crate) fn convert(&self, name: &str, direction: Direction) -> String {
        match direction {
            Direction::ToWire => self.to_wire(name),
            Direction::FromWire => self.from_wire(name),
        }
    }

    fn to_wire(&self, name: &str) -> String {
        match self {
            FieldNaming::Preserve | FieldNaming::SnakeCase => name.to_owned(),
            FieldNaming::KebabCaseLower => name.replace('_', "-").to_lowercase(),
            FieldNaming::CamelCase => {
                let mut out = String::with_capacity(name.len());
                let mut upper_next = false;
                for c in name.chars() {
                    if c == '_' {
                        upper_next = true;
                    } else if upper_next {
                        out.extend(c.to_uppercase());
                        upper_next = false;
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }

    fn from_wire(&self, name: &str) -> String {
        match self {
            FieldNaming::Preserve | FieldNaming::SnakeCase => name.to_owned(),
            FieldNaming::KebabCaseLower => name.replace('-', "_"),
            FieldNaming::CamelCase => {
                let mut out = String::with_capacity(name.len());
                for c in name.chars() {
                    if c.is_uppercase() {
                        out.push('_');
                        out.extend(c.to_lowercase());
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }
}

/// Apply the naming policy to an envelope JSON tree.
///
/// Struct field names are converted recursively; the `metadata` subtree of
/// `data` is left verbatim because its keys are user data.
pub(crate) fn apply_naming(root: Value, naming: FieldNaming, direction: Direction) -> Value {
    let Value::Object(fields) = root else {
        return root;
    };
    let converted = fields
        .into_iter()
        .map(|(key, value)| {
            let canonical = match direction {
                Direction::ToWire => key.clone(),
                Direction::FromWire => naming.convert(&key, direction),
            };
            let value = if canonical == "data" {
                convert_data(value, naming, direction)
            } else {
                convert_fields(value, naming, direction)
            };
            (naming.convert(&key, direction), value)
        })
        .collect();
    Value::Object(converted)
}

fn convert_data(data: Value, naming: FieldNaming, direction: Direction) -> Value {
    let Value::Object(fields) = data else {
        return data;
    };
    let converted = fields
        .into_iter()
        .map(|(key, value)| {
            let canonical = match direction {
                Direction::ToWire => key.clone(),
                Direction::FromWire => naming.convert(&key, direction),
            };
            // Metadata keys and values pass through untouched.
            let value = if canonical == "metadata" {
                value
            } else {
                convert_fields(value, naming, direction)
            };
            (naming.convert(&key, direction), value)
        })
        .collect();
    Value::Object(converted)
}

fn convert_fields(value: Value, naming: FieldNaming, direction: Direction) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| {
                    (
                        naming.convert(&key, direction),
                        convert_fields(value, naming, direction),
                    )
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| convert_fields(item, naming, direction))
                .collect(),
        ),
        other => other,
    }
}

/// Serde helper for signature bytes encoded as a base64 string on the wire.
pub(crate) mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|encoded| STANDARD.decode(encoded).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Error returned by marshalling operations.
///
/// Each error captures the underlying kind and a tracing span backtrace for
/// improved diagnostics.
#[derive(Debug)]
pub struct SerializationError {
    context: SpanTrace,
    kind: SerializationErrorKind,
}

/// Serialization error kinds.
#[derive(Debug)]
pub enum SerializationErrorKind {
    /// The bytes do not decode into a well-formed envelope.
    Malformed(tower::BoxError),
    /// The envelope's `type` field does not match the expected payload type.
    UnexpectedKind { expected: String, actual: String },
    /// The outer text-safe encoding is invalid.
    Encoding(tower::BoxError),
}

impl SerializationError {
    pub(crate) fn malformed(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SerializationErrorKind::Malformed(err.into()),
        }
    }

    pub(crate) fn unexpected_kind(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SerializationErrorKind::UnexpectedKind {
                expected: expected.into(),
                actual: actual.into(),
            },
        }
    }

    pub(crate) fn encoding(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SerializationErrorKind::Encoding(err.into()),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &SerializationErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SerializationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SerializationErrorKind::Malformed(err) => writeln!(f, "Malformed envelope: {err}"),
            SerializationErrorKind::UnexpectedKind { expected, actual } => {
                writeln!(f, "Unexpected envelope type: expected {expected}, got {actual}")
            }
            SerializationErrorKind::Encoding(err) => writeln!(f, "Invalid encoding: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SerializationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SerializationErrorKind::Malformed(err) => Some(err.as_ref()),
            SerializationErrorKind::Encoding(err) => Some(err.as_ref()),
            SerializationErrorKind::UnexpectedKind { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kebab_conversion_round_trips() {
        let naming = FieldNaming::KebabCaseLower;
        let wire = naming.convert("member_name", Direction::ToWire);
        assert_eq!(wire, "member-name");
        assert_eq!(naming.convert(&wire, Direction::FromWire), "member_name");
    }

    #[test]
    fn camel_conversion_round_trips() {
        let naming = FieldNaming::CamelCase;
        let wire = naming.convert("delivery_count", Direction::ToWire);
        assert_eq!(wire, "deliveryCount");
        assert_eq!(naming.convert(&wire, Direction::FromWire), "delivery_count");
    }

    #[test]
    fn metadata_keys_survive_naming_policy() {
        let root = serde_json::json!({
            "type": "Member",
            "data": {
                "value": { "member_name": "jd" },
                "metadata": { "trace_parent": "00-ab" }
            }
        });
        let wire = apply_naming(root, FieldNaming::KebabCaseLower, Direction::ToWire);
        assert!(wire["data"]["value"].get("member-name").is_some());
        assert!(wire["data"]["metadata"].get("trace_parent").is_some());

        let back = apply_naming(wire, FieldNaming::KebabCaseLower, Direction::FromWire);
        assert!(back["data"]["value"].get("member_name").is_some());
        assert!(back["data"]["metadata"].get("trace_parent").is_some());
    }
}
