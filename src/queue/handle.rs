use tokio::time::Instant;
use tracing_error::SpanTrace;

use crate::Envelope;
use crate::queue::{DeleteOutcome, DeliveryToken, Driver};

/// Acknowledgeable handle over one received delivery.
///
/// A handle wraps the deserialized envelope, the delivery token for this
/// attempt, and the visibility deadline after which the backend may
/// redeliver the envelope under a new token. Each handle is exclusively
/// owned by the task that received it; a redelivery produces a fresh handle
/// with the same envelope id.
#[derive(Debug)]
pub struct MessageHandle<T, D> {
    envelope: Envelope<T>,
    token: DeliveryToken,
    expires_at: Instant,
    delivery_count: Option<u32>,
    queue: String,
    driver: D,
    acknowledged: bool,
}

/// Outcome of a successful [`MessageHandle::acknowledge`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The message was removed from the queue.
    Acknowledged,
    /// A previous call on this handle already removed it; no effect.
    AlreadyAcknowledged,
}

impl<T, D: Driver> MessageHandle<T, D> {
    pub(crate) fn new(
        envelope: Envelope<T>,
        token: DeliveryToken,
        expires_at: Instant,
        delivery_count: Option<u32>,
        queue: String,
        driver: D,
    ) -> Self {
        Self {
            envelope,
            token,
            expires_at,
            delivery_count,
            queue,
            driver,
            acknowledged: false,
        }
    }

    /// The received envelope.
    pub fn envelope(&self) -> &Envelope<T> {
        &self.envelope
    }

    /// Consume the handle and return the envelope.
    ///
    /// Dropping the handle without acknowledging leaves the message queued;
    /// it becomes visible again once its timeout elapses.
    pub fn into_envelope(self) -> Envelope<T> {
        self.envelope
    }

    /// How many times the backend has handed this message out, when the
    /// backend tracks it. Poison detection belongs to the caller.
    pub fn delivery_count(&self) -> Option<u32> {
        self.delivery_count
    }

    /// Deadline after which this delivery token is no longer current.
    pub fn visibility_deadline(&self) -> Instant {
        self.expires_at
    }

    /// Remove the message from the queue.
    ///
    /// Succeeds at most meaningfully once; a repeat call reports
    /// [`AckOutcome::AlreadyAcknowledged`]. Fails with
    /// [`AcknowledgmentError`] when the delivery token is stale (the
    /// visibility deadline passed or the backend rotated the receipt).
    /// The message then stays queued and the caller must not assume
    /// exclusive ownership of the envelope anymore.
    pub async fn acknowledge(&mut self) -> Result<AckOutcome, AcknowledgmentError> {
        if self.acknowledged {
            return Ok(AckOutcome::AlreadyAcknowledged);
        }
        if Instant::now() >= self.expires_at {
            tracing::debug!(
                envelope = %self.envelope.id(),
                "Visibility deadline elapsed before acknowledgment",
            );
            return Err(AcknowledgmentError::expired());
        }
        match self.driver.delete_message(&self.queue, &self.token).await {
            Ok(DeleteOutcome::Deleted) => {
                self.acknowledged = true;
                tracing::debug!(envelope = %self.envelope.id(), "Envelope acknowledged");
                Ok(AckOutcome::Acknowledged)
            }
            Ok(DeleteOutcome::Stale) => Err(AcknowledgmentError::stale()),
            Err(err) => Err(AcknowledgmentError::transport(err.into())),
        }
    }
}

/// Error returned when a delivery cannot be acknowledged.
#[derive(Debug)]
pub struct AcknowledgmentError {
    context: SpanTrace,
    kind: AcknowledgmentErrorKind,
}

/// Acknowledgment error kinds.
#[derive(Debug)]
pub enum AcknowledgmentErrorKind {
    /// The visibility deadline elapsed while the handle was held.
    Expired,
    /// The backend no longer recognizes the delivery token.
    Stale,
    /// The delete call itself failed.
    Transport(tower::BoxError),
}

impl AcknowledgmentError {
    fn expired() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: AcknowledgmentErrorKind::Expired,
        }
    }

    fn stale() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: AcknowledgmentErrorKind::Stale,
        }
    }

    fn transport(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: AcknowledgmentErrorKind::Transport(err),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &AcknowledgmentErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for AcknowledgmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            AcknowledgmentErrorKind::Expired => {
                writeln!(f, "Visibility deadline elapsed; delivery token is no longer current")
            }
            AcknowledgmentErrorKind::Stale => writeln!(f, "Delivery token is stale"),
            AcknowledgmentErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for AcknowledgmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            AcknowledgmentErrorKind::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}
