use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::Envelope;
use crate::marshal::{Direction, FieldNaming, Marshaller, SerializationError, apply_naming};

/// JSON envelope marshaller with a configurable wire naming policy.
///
/// Serialization goes through an intermediate `serde_json::Value` so the
/// [`FieldNaming`] policy can rewrite field names independently of the
/// in-memory shape. `serde_json` keeps object keys ordered, so the output is
/// canonical for a given envelope and policy, which the signing layer
/// depends on.
#[derive(Debug, Clone, Default)]
pub struct JsonMarshaller {
    naming: FieldNaming,
}

impl JsonMarshaller {
    /// Create a marshaller with the given wire naming policy.
    pub fn new(naming: FieldNaming) -> Self {
        Self { naming }
    }

    /// The configured wire naming policy.
    pub fn naming(&self) -> FieldNaming {
        self.naming
    }
}

impl Marshaller for JsonMarshaller {
    fn serialize<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
    ) -> Result<Vec<u8>, SerializationError> {
        let tree = serde_json::to_value(envelope).map_err(SerializationError::malformed)?;
        let wire = apply_naming(tree, self.naming, Direction::ToWire);
        serde_json::to_vec(&wire).map_err(SerializationError::malformed)
    }

    fn deserialize<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        expected_kind: Option<&str>,
    ) -> Result<Envelope<T>, SerializationError> {
        let wire: Value = serde_json::from_slice(bytes).map_err(SerializationError::malformed)?;
        let tree = apply_naming(wire, self.naming, Direction::FromWire);

        if let Some(expected) = expected_kind {
            let actual = tree
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            if actual != expected {
                return Err(SerializationError::unexpected_kind(expected, actual));
            }
        }

        serde_json::from_value(tree).map_err(SerializationError::malformed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::Deserialize;

    use super::*;
    use crate::marshal::SerializationErrorKind;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct CreateMember {
        member_name: String,
        member_age: u8,
        email_address: String,
    }

    fn member_envelope() -> Envelope<CreateMember> {
        Envelope::wrap(
            CreateMember {
                member_name: "John Doe".into(),
                member_age: 44,
                email_address: "jd@outlook.com".into(),
            },
            "https://fancy.io/members",
            "CreateMember",
        )
        .unwrap()
        .with_metadata("correlation-id", serde_json::json!("c-1"))
    }

    #[test]
    fn round_trips_under_kebab_policy() {
        let marshaller = JsonMarshaller::new(FieldNaming::KebabCaseLower);
        let envelope = member_envelope();
        let bytes = marshaller.serialize(&envelope).unwrap();

        let wire = String::from_utf8(bytes.clone()).unwrap();
        assert!(wire.contains("\"member-name\""));
        assert!(wire.contains("\"correlation-id\""));
        assert!(!wire.contains("member_name"));

        let decoded: Envelope<CreateMember> =
            marshaller.deserialize(&bytes, Some("CreateMember")).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trips_under_camel_policy() {
        let marshaller = JsonMarshaller::new(FieldNaming::CamelCase);
        let envelope = member_envelope();
        let bytes = marshaller.serialize(&envelope).unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("\"memberName\""));

        let decoded: Envelope<CreateMember> = marshaller.deserialize(&bytes, None).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn serialization_is_deterministic() {
        let marshaller = JsonMarshaller::new(FieldNaming::KebabCaseLower);
        let envelope = member_envelope();
        assert_eq!(
            marshaller.serialize(&envelope).unwrap(),
            marshaller.serialize(&envelope).unwrap()
        );
    }

    #[test]
    fn rejects_foreign_type_name() {
        let marshaller = JsonMarshaller::new(FieldNaming::KebabCaseLower);
        let bytes = marshaller.serialize(&member_envelope()).unwrap();
        let err = marshaller
            .deserialize::<CreateMember>(&bytes, Some("DeleteMember"))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            SerializationErrorKind::UnexpectedKind { .. }
        ));
    }

    #[test]
    fn rejects_malformed_bytes() {
        let marshaller = JsonMarshaller::new(FieldNaming::KebabCaseLower);
        let err = marshaller
            .deserialize::<CreateMember>(b"not json at all", None)
            .unwrap_err();
        assert!(matches!(err.kind(), SerializationErrorKind::Malformed(_)));
    }

    #[test]
    fn metadata_map_round_trips_verbatim() {
        let marshaller = JsonMarshaller::new(FieldNaming::KebabCaseLower);
        let mut metadata = BTreeMap::new();
        metadata.insert("has_underscore".to_owned(), serde_json::json!(1));
        metadata.insert("has-dash".to_owned(), serde_json::json!(2));

        let mut envelope = member_envelope();
        envelope.data.metadata = metadata.clone();

        let bytes = marshaller.serialize(&envelope).unwrap();
        let decoded: Envelope<CreateMember> = marshaller.deserialize(&bytes, None).unwrap();
        assert_eq!(decoded.data().metadata, metadata);
    }
}
