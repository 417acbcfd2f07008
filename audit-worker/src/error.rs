use thiserror::Error;

/// Enumeration of errors raised by the persistence writers, either store
/// variant. Duplicate keys never surface here: the writers fold them into
/// a successful `AlreadyPresent` outcome.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("document store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("document store returned {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("eventId is not a valid UUID: {0}")]
    InvalidEventId(String),
}

/// How the pipeline reacts to a failed persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Worth retrying with back-off: the store may come back.
    Transient,
    /// Terminal for this record only: route it to the dead-letter topic.
    Record,
    /// Terminal for the worker: mis-configuration or auth failure.
    Fatal,
}

impl StoreError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            StoreError::Database(error) => match error {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => FailureKind::Transient,
                sqlx::Error::Configuration(_) | sqlx::Error::Tls(_) => FailureKind::Fatal,
                _ => FailureKind::Record,
            },
            StoreError::Request(error) if error.is_connect() || error.is_timeout() => {
                FailureKind::Transient
            }
            StoreError::Request(_) => FailureKind::Record,
            StoreError::Rejected { status, .. } if *status == 429 || *status >= 500 => {
                FailureKind::Transient
            }
            StoreError::Rejected { .. } => FailureKind::Record,
            StoreError::InvalidEventId(_) => FailureKind::Record,
        }
    }
}

/// Enumeration of errors that terminate the worker itself.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("consumer group metadata unavailable, cannot commit offsets transactionally")]
    NoGroupMetadata,
    #[error("unrecoverable store error: {0}")]
    Store(#[from] StoreError),
}
