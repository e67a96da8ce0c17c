#![doc = include_str!("../README.md")]

pub mod envelope;
pub mod marshal;
pub mod queue;
pub mod signature;

#[doc(inline)]
pub use envelope::{Envelope, EnvelopeError, Payload};

#[doc(inline)]
pub use marshal::{
    FieldNaming, JsonMarshaller, Marshaller, SerializationError, SerializationErrorKind, TextSafe,
};

#[doc(inline)]
pub use signature::{SignatureError, SignatureErrorKind};

#[doc(inline)]
pub use queue::{
    AckOutcome, AcknowledgmentError, AcknowledgmentErrorKind, DeleteOutcome, Delivery,
    DeliveryToken, Driver, InMemoryDriver, MessageHandle, MessageStream, QueueClient,
    QueueOptions, ReceiveOptions, TransportError, TransportErrorKind,
};
