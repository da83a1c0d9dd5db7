use std::error::Error as StdError;

/// Boxed error returned by storage sinks.
pub type SinkError = Box<dyn StdError + Send + Sync>;

/// Failures reported by a broker connection or channel.
#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    /// Broker unreachable, handshake refused or connection dropped.
    #[error("broker connection failed: {0}")]
    Connection(String),

    /// An exchange or queue already exists with incompatible parameters.
    #[error("topology conflict on {entity}: {reason}")]
    TopologyConflict { entity: String, reason: String },

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("consume failed on queue {queue}: {reason}")]
    Consume { queue: String, reason: String },
}

impl BrokerError {
    /// Fatal errors are configuration bugs and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::TopologyConflict { .. })
    }
}

/// Returned by the retry controller once the attempt budget is spent, or
/// immediately when the operation failed with a non-retryable error.
#[derive(thiserror::Error, Debug)]
pub enum RetryError<E>
where
    E: StdError + 'static,
{
    #[error("gave up after {attempts} attempt(s)")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("non-retryable failure on attempt {attempt}")]
    Fatal {
        attempt: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E>
where
    E: StdError + 'static,
{
    pub fn source_ref(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Fatal { source, .. } => source,
        }
    }
}

/// A message body that could not be turned into a [`crate::record::LogRecord`].
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("malformed log body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("log body has an empty service name")]
    EmptyService,
}

/// Reasons a producer `log()` call did not reach the broker. These are never
/// surfaced to the instrumented application.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("no live broker channel")]
    NotConnected,

    #[error("unknown log level {0:?}")]
    InvalidLevel(String),

    #[error("invalid log record: {0}")]
    InvalidRecord(#[from] RecordError),

    #[error("could not serialize log record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("service name must not be empty")]
    EmptyService,
}

/// A single record's storage write failed.
#[derive(thiserror::Error, Debug)]
#[error("failed to persist log from {service}: {source}")]
pub struct PersistError {
    pub service: String,
    #[source]
    pub source: SinkError,
}

/// Top-level failure of one consumer pipeline incarnation. The outer restart
/// loop reacts to any of these by tearing everything down and rebuilding.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("could not establish broker connection")]
    Connect(#[from] RetryError<BrokerError>),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("delivery stream for queue {0} ended")]
    StreamEnded(String),

    #[error("pipeline task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("cannot start a pipeline that is {0}")]
    InvalidState(crate::consumer::PipelineState),
}

impl PipelineError {
    /// Configuration bugs: rebuilding the pipeline would fail the same way.
    pub fn is_fatal(&self) -> bool {
        match self {
            PipelineError::Connect(e) => e.source_ref().is_fatal(),
            PipelineError::Broker(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not read configuration from environment: {0}")]
    Env(#[from] envconfig::Error),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("unknown exchange kind {0:?}")]
    ExchangeKind(String),
}
