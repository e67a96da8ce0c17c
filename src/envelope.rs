use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transport-neutral message container.
///
/// `Envelope` bundles a typed payload together with the identity and routing
/// metadata a queue consumer needs to dispatch it:
///
/// - `id`: unique per envelope, generated at creation, never reused
/// - `time`: UTC creation timestamp, set once
/// - `source`: origin identifier (URI or logical name), used by consumers to
///   disambiguate streams
/// - `kind`: logical payload type name (wire field `type`), used for
///   deserialization dispatch
/// - `data`: the payload plus its own metadata
///
/// An envelope may additionally carry a signature; see [`is_signed`] and the
/// [`signature`](crate::signature) module. Callers check for signature
/// presence rather than downcasting to a separate signed type.
///
/// Identity fields are private and exposed through getters only: once
/// constructed, `id`, `time` and `kind` are never mutated.
///
/// [`is_signed`]: Envelope::is_signed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub(crate) id: Uuid,
    pub(crate) time: DateTime<Utc>,
    pub(crate) source: String,
    #[serde(rename = "type")]
    pub(crate) kind: String,
    pub(crate) data: Payload<T>,
    #[serde(
        with = "crate::marshal::base64_bytes",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub(crate) signature: Option<Vec<u8>>,
}

/// Payload of an envelope: the typed value plus its own metadata.
///
/// Metadata keys are user data, not wire fields: the marshaller's naming
/// policy never rewrites them. A `BTreeMap` keeps the marshalled bytes
/// canonical, which signing relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload<T> {
    pub value: T,
    #[serde(default = "BTreeMap::new", skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl<T> Envelope<T> {
    /// Wrap a payload into a new envelope.
    ///
    /// `source` is the origin identifier (a URI or logical name) and `kind`
    /// the logical payload type name used for dispatch on the receiving
    /// side. Both must be non-empty; no other validation or I/O happens
    /// here.
    pub fn wrap(
        value: T,
        source: impl Into<String>,
        kind: impl Into<String>,
    ) -> Result<Self, EnvelopeError> {
        let source = source.into();
        let kind = kind.into();
        if source.trim().is_empty() {
            return Err(EnvelopeError::empty_source());
        }
        if kind.trim().is_empty() {
            return Err(EnvelopeError::empty_kind());
        }
        Ok(Self {
            id: Uuid::new_v4(),
            time: Utc::now(),
            source,
            kind,
            data: Payload {
                value,
                metadata: BTreeMap::new(),
            },
            signature: None,
        })
    }

    /// Attach a metadata entry to the payload.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.metadata.insert(key.into(), value);
        self
    }

    /// Unique envelope identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// UTC creation timestamp.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Origin identifier.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Logical payload type name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Payload plus metadata.
    pub fn data(&self) -> &Payload<T> {
        &self.data
    }

    /// Whether this envelope carries a signature.
    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    /// The signature bytes, when present.
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Consume the envelope and return the payload value.
    pub fn into_value(self) -> T {
        self.data.value
    }
}

/// Error returned when an envelope cannot be constructed.
#[derive(Debug)]
pub struct EnvelopeError {
    kind: EnvelopeErrorKind,
}

#[derive(Debug)]
enum EnvelopeErrorKind {
    EmptySource,
    EmptyKind,
}

impl EnvelopeError {
    fn empty_source() -> Self {
        Self {
            kind: EnvelopeErrorKind::EmptySource,
        }
    }

    fn empty_kind() -> Self {
        Self {
            kind: EnvelopeErrorKind::EmptyKind,
        }
    }
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            EnvelopeErrorKind::EmptySource => write!(f, "Envelope source must be non-empty"),
            EnvelopeErrorKind::EmptyKind => write!(f, "Envelope type name must be non-empty"),
        }
    }
}

impl std::error::Error for EnvelopeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_sets_identity_once() {
        let a = Envelope::wrap(42u32, "urn:test", "Number").unwrap();
        let b = Envelope::wrap(42u32, "urn:test", "Number").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.kind(), "Number");
        assert_eq!(a.source(), "urn:test");
        assert!(!a.is_signed());
    }

    #[test]
    fn wrap_rejects_empty_source_and_kind() {
        assert!(Envelope::wrap(1u8, "", "Number").is_err());
        assert!(Envelope::wrap(1u8, "urn:test", "  ").is_err());
    }

    #[test]
    fn metadata_is_part_of_structural_equality() {
        let plain = Envelope::wrap(1u8, "urn:test", "Number").unwrap();
        let tagged = plain
            .clone()
            .with_metadata("member-id", serde_json::json!(7));
        assert_ne!(plain, tagged);
        assert_eq!(
            tagged.data().metadata.get("member-id"),
            Some(&serde_json::json!(7))
        );
    }
}
