//! Errors returned by the cascading filter and by downstream consumers.
use std::sync::PoisonError;
use thiserror::Error;

/// A specialized `Result` type for cascading filter operations.
pub type CascadingFilterResult<T> = Result<T, CascadingFilterError>;

/// Describes the result of handing a batch of spans to a [`TraceConsumer`].
///
/// [`TraceConsumer`]: crate::TraceConsumer
pub type ConsumeResult = Result<(), ConsumeError>;

/// Errors returned while building or operating the cascading filter.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CascadingFilterError {
    /// A name pattern or attribute value pattern failed to compile.
    #[error("invalid pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    /// A reject rule names a status code other than `Error`, `Ok` or `Unset`.
    #[error("invalid status code {0:?}: must be one of 'Error', 'Ok', or 'Unset'")]
    InvalidStatusCode(String),

    /// The decision wait is shorter than one batch (one second).
    #[error("decision wait must be at least one second")]
    InvalidNumBatches,

    /// The decision history cannot hold a single entry.
    #[error("history size must be positive")]
    InvalidHistorySize,

    /// The registry cannot hold a single trace.
    #[error("num_traces must be positive")]
    InvalidNumTraces,

    /// The downstream consumer rejected spans.
    #[error(transparent)]
    Consume(#[from] ConsumeError),

    /// The processor was already shut down.
    #[error("cascading filter processor already shutdown")]
    AlreadyShutdown,

    /// Other errors not covered by the variants above.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl From<String> for CascadingFilterError {
    fn from(err_msg: String) -> Self {
        CascadingFilterError::Other(Box::new(Custom(err_msg)))
    }
}

impl From<&'static str> for CascadingFilterError {
    fn from(err_msg: &'static str) -> Self {
        CascadingFilterError::Other(Box::new(Custom(err_msg.into())))
    }
}

impl<T> From<PoisonError<T>> for CascadingFilterError {
    fn from(err: PoisonError<T>) -> Self {
        CascadingFilterError::Other(Box::new(Custom(err.to_string())))
    }
}

/// Errors a [`TraceConsumer`] reports back to the cascading filter.
///
/// [`TraceConsumer`]: crate::TraceConsumer
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConsumeError {
    /// The consumer failed to accept the batch.
    #[error("consumer failed: {0}")]
    Failed(String),

    /// The consumer is already shut down.
    #[error("consumer already shutdown")]
    Shutdown,

    /// Other errors propagated from the consumer.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl<T> From<PoisonError<T>> for ConsumeError {
    fn from(err: PoisonError<T>) -> Self {
        ConsumeError::Failed(format!("consumer mutex poisoned: {}", err))
    }
}

/// Wrap type for string
#[derive(Error, Debug)]
#[error("{0}")]
struct Custom(String);
