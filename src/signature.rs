//! Envelope signing and verification.
//!
//! Signatures are HMAC-SHA256 over the canonical marshalled bytes of the
//! envelope with the signature field cleared. The secret is supplied per
//! call and never stored. Verification compares in constant time.

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use tracing_error::SpanTrace;

use crate::Envelope;
use crate::marshal::{Marshaller, SerializationError};

type HmacSha256 = Hmac<Sha256>;

/// Sign an envelope with a shared secret.
///
/// Any existing signature is discarded before the canonical bytes are
/// computed, so re-signing is well defined. Deterministic for identical
/// (envelope, secret, marshaller configuration).
pub fn sign<T, M>(
    mut envelope: Envelope<T>,
    marshaller: &M,
    secret: &[u8],
) -> Result<Envelope<T>, SignatureError>
where
    T: Serialize,
    M: Marshaller,
{
    envelope.signature = None;
    let canonical = marshaller
        .serialize(&envelope)
        .map_err(SignatureError::canonicalize)?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(SignatureError::key)?;
    mac.update(&canonical);
    envelope.signature = Some(mac.finalize().into_bytes().to_vec());
    Ok(envelope)
}

/// Verify an envelope's signature against a shared secret.
///
/// Fails when the signature field is absent, the secret does not match, or
/// any envelope content changed after signing. The comparison runs in
/// constant time via [`Mac::verify_slice`].
pub fn verify<T, M>(
    envelope: &Envelope<T>,
    marshaller: &M,
    secret: &[u8],
) -> Result<(), SignatureError>
where
    T: Serialize + Clone,
    M: Marshaller,
{
    let signature = envelope.signature().ok_or_else(SignatureError::missing)?;

    let mut unsigned = envelope.clone();
    unsigned.signature = None;
    let canonical = marshaller
        .serialize(&unsigned)
        .map_err(SignatureError::canonicalize)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(SignatureError::key)?;
    mac.update(&canonical);
    mac.verify_slice(signature)
        .map_err(|_| SignatureError::mismatch())
}

/// Error returned by signing and verification.
#[derive(Debug)]
pub struct SignatureError {
    context: SpanTrace,
    kind: SignatureErrorKind,
}

/// Signature error kinds.
#[derive(Debug)]
pub enum SignatureErrorKind {
    /// The envelope carries no signature.
    Missing,
    /// The signature does not match: wrong secret or tampered content.
    Mismatch,
    /// The envelope could not be marshalled into canonical bytes.
    Canonicalize(SerializationError),
    /// The secret was rejected by the MAC implementation.
    Key(tower::BoxError),
}

impl SignatureError {
    fn missing() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SignatureErrorKind::Missing,
        }
    }

    fn mismatch() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SignatureErrorKind::Mismatch,
        }
    }

    fn canonicalize(err: SerializationError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SignatureErrorKind::Canonicalize(err),
        }
    }

    fn key(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SignatureErrorKind::Key(err.into()),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &SignatureErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SignatureErrorKind::Missing => writeln!(f, "Envelope carries no signature"),
            SignatureErrorKind::Mismatch => writeln!(f, "Signature mismatch"),
            SignatureErrorKind::Canonicalize(err) => {
                writeln!(f, "Cannot canonicalize envelope: {err}")
            }
            SignatureErrorKind::Key(err) => writeln!(f, "Invalid signing key: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SignatureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SignatureErrorKind::Canonicalize(err) => Some(err),
            SignatureErrorKind::Key(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::{FieldNaming, JsonMarshaller};

    fn envelope() -> Envelope<String> {
        Envelope::wrap("payload".to_owned(), "https://fancy.io/members", "Note").unwrap()
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let marshaller = JsonMarshaller::new(FieldNaming::KebabCaseLower);
        let signed = sign(envelope(), &marshaller, &[1, 2, 3]).unwrap();
        assert!(signed.is_signed());
        verify(&signed, &marshaller, &[1, 2, 3]).unwrap();
    }

    #[test]
    fn signing_is_deterministic() {
        let marshaller = JsonMarshaller::default();
        let e = envelope();
        let a = sign(e.clone(), &marshaller, b"secret").unwrap();
        let b = sign(e, &marshaller, b"secret").unwrap();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn wrong_secret_fails() {
        let marshaller = JsonMarshaller::default();
        let signed = sign(envelope(), &marshaller, &[1, 2, 3]).unwrap();
        let err = verify(&signed, &marshaller, &[4, 5, 6]).unwrap_err();
        assert!(matches!(err.kind(), SignatureErrorKind::Mismatch));
    }

    #[test]
    fn tampered_content_fails() {
        let marshaller = JsonMarshaller::default();
        let mut signed = sign(envelope(), &marshaller, b"secret").unwrap();
        signed.source = "https://evil.example".to_owned();
        let err = verify(&signed, &marshaller, b"secret").unwrap_err();
        assert!(matches!(err.kind(), SignatureErrorKind::Mismatch));
    }

    #[test]
    fn unsigned_envelope_fails_with_missing() {
        let marshaller = JsonMarshaller::default();
        let err = verify(&envelope(), &marshaller, b"secret").unwrap_err();
        assert!(matches!(err.kind(), SignatureErrorKind::Missing));
    }
}
