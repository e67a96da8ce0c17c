use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Serialize, de::DeserializeOwned};

use crate::Envelope;
use crate::marshal::{Marshaller, SerializationError};

/// Base64 decorator for transports that only accept text-safe payloads.
///
/// Some queue transports reject arbitrary binary bodies. `TextSafe` wraps
/// any inner [`Marshaller`] and base64-encodes its output, transparently to
/// the queue client.
#[derive(Debug, Clone, Default)]
pub struct TextSafe<M> {
    inner: M,
}

impl<M> TextSafe<M> {
    /// Wrap an inner marshaller.
    pub fn new(inner: M) -> Self {
        Self { inner }
    }

    /// The wrapped marshaller.
    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: Marshaller> Marshaller for TextSafe<M> {
    fn serialize<T: Serialize>(
        &self,
        envelope: &Envelope<T>,
    ) -> Result<Vec<u8>, SerializationError> {
        let bytes = self.inner.serialize(envelope)?;
        Ok(STANDARD.encode(bytes).into_bytes())
    }

    fn deserialize<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        expected_kind: Option<&str>,
    ) -> Result<Envelope<T>, SerializationError> {
        let decoded = STANDARD
            .decode(bytes)
            .map_err(SerializationError::encoding)?;
        self.inner.deserialize(&decoded, expected_kind)
    }
}
