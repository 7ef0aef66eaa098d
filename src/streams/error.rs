use std::{error::Error, fmt, io, sync::Arc};

use thiserror::Error as ThisError;

pub type StreamResult<T> = Result<T, StreamError>;

/// Error type shared by every stream operation.
///
/// Three broad kinds exist: configuration errors (invalid high water marks or
/// chunk sizes, raised synchronously), state errors (operating on a locked,
/// closing, closed or errored stream), and failures coming out of a
/// caller-supplied source/sink algorithm, which are stored on the stream and
/// replayed to every subsequent operation.
#[derive(Debug, Clone, ThisError)]
pub enum StreamError {
    /// Invalid high water mark, chunk size or option value.
    #[error("invalid stream configuration: {0}")]
    Configuration(String),

    /// The stream already has a live reader or writer.
    #[error("stream is already locked to an accessor")]
    Locked,

    /// The operation is not allowed in the stream's current state.
    #[error("invalid stream state: {0}")]
    State(&'static str),

    /// The stream was canceled.
    #[error("stream operation was canceled")]
    Canceled,

    /// The stream was aborted.
    #[error("stream was aborted{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted(Option<String>),

    /// A close is in progress and the operation can no longer be accepted.
    #[error("stream is closing")]
    Closing,

    /// The stream is closed.
    #[error("stream is closed")]
    Closed,

    /// A pipe's destination was closed out from under it.
    #[error("pipe destination was closed")]
    DestinationClosed,

    /// The driver task for this stream is gone.
    #[error("stream task was dropped")]
    TaskDropped,

    /// A caller-supplied algorithm failed with its own error.
    #[error(transparent)]
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into a `StreamError`.
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error.
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct Message(String);
        impl fmt::Display for Message {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for Message {}
        StreamError::Other(Arc::new(Message(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}
