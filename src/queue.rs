//! Queue client and transport boundary.
//!
//! This module defines the at-least-once queue abstraction: a
//! backend-generic [`Driver`] trait, the [`QueueClient`] that sends
//! marshalled envelopes and exposes a lazy, cancellable receive stream, and
//! the [`MessageHandle`] acknowledgment surface.
//!
//! ## Key components
//!
//! - [`QueueClient`]: Public-facing client for send/receive
//! - [`Driver`]: Trait implemented by concrete queue backends
//! - [`MessageStream`]: Finite per-call stream of acknowledgeable handles
//! - [`TransportError`]: Unified error type with tracing context
//!
//! ## Delivery semantics
//!
//! Each `receive` call polls the backend: without a wait budget the stream
//! ends after one poll, with a budget it keeps polling until the budget or
//! cancellation elapses. Messages stay invisible for the configured
//! visibility timeout; unacknowledged messages become visible again and are
//! redelivered under a new delivery token. The client never loops on its
//! own beyond the wait budget: retry-until-satisfied is the caller's policy.

pub mod handle;
pub mod inmemory;

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::Stream;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::Envelope;
use crate::marshal::{Marshaller, SerializationError};

pub use handle::{AckOutcome, AcknowledgmentError, AcknowledgmentErrorKind, MessageHandle};
pub use inmemory::{InMemoryDriver, InMemoryDriverError};

/// Opaque token identifying one specific delivery attempt.
///
/// Required to acknowledge that attempt; a redelivery of the same envelope
/// carries a fresh token and invalidates this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryToken {
    /// Backend-assigned message identifier.
    pub message_id: String,
    /// Pop-receipt equivalent, rotated on every dequeue.
    pub receipt: String,
}

/// One dequeued message as handed over by a backend.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Marshalled envelope bytes.
    pub body: Vec<u8>,
    /// Token for acknowledging this delivery attempt.
    pub token: DeliveryToken,
    /// How many times the backend has handed this message out, when known.
    pub delivery_count: Option<u32>,
}

/// Outcome of a backend delete call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The message was removed from the queue.
    Deleted,
    /// The delivery token was stale; the message was not removed.
    Stale,
}

/// Trait implemented by concrete queue backends.
///
/// A driver is responsible for moving opaque bodies in and out of a named
/// queue. Retry and backoff for transient network failures are the
/// driver's own concern; the client surfaces only the final outcome.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Provision the queue when it does not exist yet.
    async fn create_queue_if_missing(&self, queue: &str) -> Result<(), Self::Error>;

    /// Append a body to the queue, returning the backend message id.
    async fn enqueue(&self, queue: &str, body: Vec<u8>) -> Result<String, Self::Error>;

    /// Take up to `max` currently visible messages, hiding each for
    /// `visibility`.
    async fn dequeue(
        &self,
        queue: &str,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<Delivery>, Self::Error>;

    /// Delete one delivery attempt. Stale tokens report
    /// [`DeleteOutcome::Stale`] rather than an error.
    async fn delete_message(
        &self,
        queue: &str,
        token: &DeliveryToken,
    ) -> Result<DeleteOutcome, Self::Error>;
}

/// Queue client configuration values.
///
/// Only values live here; how they are loaded is up to the application.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub(crate) queue_name: String,
    pub(crate) visibility_timeout: Duration,
    pub(crate) wait_budget: Option<Duration>,
    pub(crate) batch_size: usize,
    pub(crate) poll_interval: Duration,
}

impl QueueOptions {
    /// Options for the named queue with default timings: 30s visibility,
    /// no wait budget, batch size 10, 100ms poll interval.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            visibility_timeout: Duration::from_secs(30),
            wait_budget: None,
            batch_size: 10,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// How long a dequeued message stays hidden before redelivery.
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Default wait budget applied to receive calls.
    pub fn wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = Some(budget);
        self
    }

    /// Maximum messages fetched per poll.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Pause between empty polls while a wait budget is active.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Per-call receive options.
///
/// Unset values fall back to the client's [`QueueOptions`].
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    visibility_timeout: Option<Duration>,
    wait_budget: Option<Duration>,
    batch_size: Option<usize>,
    poll_interval: Option<Duration>,
    expected_kind: Option<String>,
    cancel: Option<CancellationToken>,
}

impl ReceiveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the visibility timeout for this call.
    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Keep polling until this budget elapses instead of ending after one
    /// empty poll.
    pub fn wait_budget(mut self, budget: Duration) -> Self {
        self.wait_budget = Some(budget);
        self
    }

    /// Override the per-poll batch size for this call.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    /// Override the pause between empty polls for this call.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Reject envelopes whose `type` field differs from this name.
    pub fn expected_kind(mut self, kind: impl Into<String>) -> Self {
        self.expected_kind = Some(kind.into());
        self
    }

    /// Cancellation signal; cancelling promptly ends the stream without
    /// error.
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Client for sending and receiving envelopes through one named queue.
///
/// The client is cheap to clone; clones share the provisioning state. The
/// queue moves from `Disconnected` to `Ready` on the first successful
/// [`Driver::create_queue_if_missing`] call and stays there: the underlying
/// transport is stateless per call, so no terminal state exists.
///
/// `send` and `receive` may run concurrently from multiple tasks; the queue
/// itself is the serialization point between them.
#[derive(Debug)]
pub struct QueueClient<D, M> {
    driver: D,
    marshaller: M,
    options: QueueOptions,
    ready: Arc<tokio::sync::OnceCell<()>>,
}

impl<D: Clone, M: Clone> Clone for QueueClient<D, M> {
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            marshaller: self.marshaller.clone(),
            options: self.options.clone(),
            ready: Arc::clone(&self.ready),
        }
    }
}

impl<D, M> QueueClient<D, M>
where
    D: Driver + Clone + Send + Sync + 'static,
    M: Marshaller + Clone + Send + Sync + 'static,
{
    /// Create a client over a backend driver and a marshaller.
    pub fn new(driver: D, marshaller: M, options: QueueOptions) -> Self {
        Self {
            driver,
            marshaller,
            options,
            ready: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    /// The configured queue name.
    pub fn queue_name(&self) -> &str {
        &self.options.queue_name
    }

    async fn ensure_ready(&self) -> Result<(), TransportError> {
        self.ready
            .get_or_try_init(|| async {
                self.driver
                    .create_queue_if_missing(&self.options.queue_name)
                    .await
                    .map_err(|e| TransportError::sender(e.into()))?;
                tracing::debug!(queue = %self.options.queue_name, "Queue is ready");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Send a batch of envelopes, one transport message each.
    ///
    /// Partial success is reportable, not fatal: when some envelopes fail,
    /// the returned [`TransportError`] identifies the failed indices while
    /// the rest have been enqueued. No ordering is promised across the
    /// batch beyond what the backend provides.
    #[instrument(skip(self, envelopes), fields(queue = %self.options.queue_name))]
    pub async fn send<T: Serialize>(
        &self,
        envelopes: Vec<Envelope<T>>,
    ) -> Result<(), TransportError> {
        self.ensure_ready().await?;

        let mut failures = Vec::new();
        for (index, envelope) in envelopes.iter().enumerate() {
            let body = match self.marshaller.serialize(envelope) {
                Ok(body) => body,
                Err(err) => {
                    failures.push((index, tower::BoxError::from(err)));
                    continue;
                }
            };
            match self
                .driver
                .enqueue(&self.options.queue_name, body)
                .await
            {
                Ok(message_id) => {
                    tracing::debug!(envelope = %envelope.id(), %message_id, "Envelope sent");
                }
                Err(err) => failures.push((index, err.into())),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            tracing::error!(failed = failures.len(), "Batch send partially failed");
            Err(TransportError::partial(failures))
        }
    }

    /// Receive envelopes as a lazy, finite, cancellable stream.
    ///
    /// Each call polls the backend independently; the next call starts
    /// fresh. Handles must be acknowledged before their visibility deadline
    /// or the envelope becomes eligible for redelivery. Per-message
    /// deserialization failures are yielded as `Err` items and do not end
    /// the stream.
    pub fn receive<T>(&self, options: ReceiveOptions) -> MessageStream<T, D>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.clone();
        let queue = self.options.queue_name.clone();
        let visibility = options
            .visibility_timeout
            .unwrap_or(self.options.visibility_timeout);
        let wait_budget = options.wait_budget.or(self.options.wait_budget);
        let batch_size = options.batch_size.unwrap_or(self.options.batch_size);
        let poll_interval = options.poll_interval.unwrap_or(self.options.poll_interval);
        let expected_kind = options.expected_kind;
        let cancel = options.cancel.unwrap_or_default();

        let (tx, receiver) = mpsc::channel(batch_size.max(1));

        let task = tokio::spawn(async move {
            // An already-cancelled signal ends the call before the first poll.
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = client.ensure_ready().await {
                let _ = tx.send(Err(err)).await;
                return;
            }

            let deadline = wait_budget.map(|budget| Instant::now() + budget);
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => return,
                    polled = client.driver.dequeue(&queue, batch_size, visibility) => {
                        match polled {
                            Ok(batch) => batch,
                            Err(err) => {
                                let _ = tx.send(Err(TransportError::sender(err.into()))).await;
                                return;
                            }
                        }
                    }
                };

                let received_at = Instant::now();
                for delivery in batch {
                    let item = match client
                        .marshaller
                        .deserialize::<T>(&delivery.body, expected_kind.as_deref())
                    {
                        Ok(envelope) => Ok(MessageHandle::new(
                            envelope,
                            delivery.token,
                            received_at + visibility,
                            delivery.delivery_count,
                            queue.clone(),
                            client.driver.clone(),
                        )),
                        Err(err) => Err(TransportError::serde(err)),
                    };
                    if tx.send(item).await.is_err() {
                        // Receiver dropped, stop polling
                        return;
                    }
                }

                match deadline {
                    None => return,
                    Some(deadline) if Instant::now() >= deadline => return,
                    Some(_) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }
                }
            }
        });

        MessageStream {
            receiver: ReceiverStream::new(receiver),
            _task: task,
        }
    }
}

/// Finite per-call stream of acknowledgeable message handles.
///
/// Produced by [`QueueClient::receive`]. The polling task behind the stream
/// ends on cancellation, wait-budget expiry, or when the stream is dropped;
/// items already buffered are still yielded after cancellation.
pub struct MessageStream<T, D> {
    receiver: ReceiverStream<Result<MessageHandle<T, D>, TransportError>>,
    _task: JoinHandle<()>,
}

impl<T, D> Stream for MessageStream<T, D> {
    type Item = Result<MessageHandle<T, D>, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().receiver).poll_next(cx)
    }
}

/// Error returned by queue transport operations.
///
/// Each error captures the underlying kind and a tracing span backtrace for
/// improved diagnostics.
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport error kinds.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the backend driver.
    Sender(tower::BoxError),
    /// A received body could not be deserialized into an envelope.
    Serde(SerializationError),
    /// Some envelopes in a batch failed; indices refer to the batch given
    /// to [`QueueClient::send`].
    Partial(Vec<(usize, tower::BoxError)>),
}

impl TransportError {
    pub(crate) fn sender(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    pub(crate) fn serde(err: SerializationError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    pub(crate) fn partial(failures: Vec<(usize, tower::BoxError)>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Partial(failures),
        }
    }

    /// The error kind.
    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
            TransportErrorKind::Partial(failures) => {
                let indices: Vec<String> =
                    failures.iter().map(|(i, _)| i.to_string()).collect();
                writeln!(
                    f,
                    "Batch partially failed at indices [{}]",
                    indices.join(", ")
                )
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err),
            TransportErrorKind::Partial(failures) => failures
                .first()
                .map(|(_, err)| err.as_ref() as &(dyn std::error::Error + 'static)),
        }
    }
}
