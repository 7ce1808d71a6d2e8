//! Error taxonomy for the dispatch pipeline.
//!
//! Only [`ConfigError`] is fatal. Every other error is contained to the
//! connection, queue or message it belongs to and is logged with its class.

use thiserror::Error;

/// Invalid or missing startup configuration. The process exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("malformed queue binding '{binding}': {reason}")]
    MalformedBinding { binding: String, reason: String },

    #[error("queue '{0}' is bound more than once")]
    DuplicateQueue(String),

    #[error("queue '{queue}' is bound to unknown handler '{handler}'")]
    UnknownHandler { queue: String, handler: String },
}

/// Broker unreachable, or the connection backing a channel is gone.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to broker: {0}")]
    Connect(#[source] lapin::Error),

    #[error("failed to open channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to set channel QoS: {0}")]
    Qos(#[source] lapin::Error),

    #[error("channel is stale: connection is {0}")]
    Stale(&'static str),

    #[error("broker {operation} timed out after {after_ms}ms")]
    Timeout { operation: &'static str, after_ms: u64 },

    #[error("gave up connecting after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ConnectionError>,
    },
}

/// Declaring, binding or consuming a queue failed. That queue is skipped.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to declare exchange '{exchange}': {source}")]
    DeclareExchange {
        exchange: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to declare queue '{queue}': {source}")]
    DeclareQueue {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to bind queue '{queue}' to '{exchange}': {source}")]
    Bind {
        queue: String,
        exchange: String,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to start consuming '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("attaching '{queue}' timed out after {after_ms}ms")]
    Timeout { queue: String, after_ms: u64 },

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// A payload that does not decode into the handler's message shape.
#[derive(Debug, Error)]
#[error("payload does not match the expected message shape: {0}")]
pub struct DeserializationError(#[from] pub serde_json::Error);

/// Failure outcome reported by a handler. The handler decides the class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// A downstream dependency failed; the message may succeed on redelivery.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The message itself is unusable; redelivery cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(reason: impl Into<String>) -> Self {
        HandlerError::Transient(reason.into())
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        HandlerError::Permanent(reason.into())
    }

    /// Short label used as the `error_class` log field.
    pub fn class(&self) -> &'static str {
        match self {
            HandlerError::Transient(_) => "handler_transient",
            HandlerError::Permanent(_) => "handler_permanent",
        }
    }
}
