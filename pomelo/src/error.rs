use tokio::sync::mpsc::error::TrySendError;

/// The client was closed and can no longer accept commands
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("client closed")]
pub struct ClientClosedError;

/// An invalid combination of arguments
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum UsageError {
    /// Queue groups cannot be combined with inbox subjects
    #[error("queue group on an inbox subject")]
    QueueGroupOnInbox,
    /// Publish subjects must not contain wildcards
    #[error("wildcard in a publish subject")]
    WildcardPublish,
    /// `max_msgs` and `max_bytes` are mutually exclusive
    #[error("both message and byte limits set")]
    BothLimits,
    /// A limit or threshold of zero cannot make progress
    #[error("limit must be greater than zero")]
    ZeroLimit,
}

/// An error encountered while publishing a message
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The payload exceeds the broker's advertised `max_payload`
    #[error("payload of {size} bytes exceeds the broker limit of {max_payload}")]
    PayloadTooLarge { size: usize, max_payload: u64 },
    #[error("invalid publish")]
    Usage(#[source] UsageError),
    /// The client was closed before the frame reached the writer
    #[error("publish canceled")]
    Canceled(#[source] ClientClosedError),
}

/// An error encountered while waiting for a request's reply
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request could not be published")]
    Publish(#[source] PublishError),
    /// No reply arrived within the timeout window
    #[error("request timed out")]
    Timeout,
    /// The broker reported that nobody is listening on the subject
    #[error("no responders")]
    NoResponders,
    /// The reply waiter was dropped, usually because the connection
    /// was replaced before the reply arrived
    #[error("request canceled")]
    Canceled,
}

/// An error encountered while subscribing
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("invalid subscription")]
    Usage(#[source] UsageError),
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
    /// The broker rejected the subscription
    #[error("subscription rejected by the broker")]
    Rejected(#[source] pomelo_proto::error::ServerError),
}

/// An error encountered while enqueueing a command without waiting
#[derive(Debug, thiserror::Error)]
pub enum TryCommandError {
    /// The command buffer is full
    #[error("command buffer full")]
    BufferFull,
    #[error("client closed")]
    Closed(#[source] ClientClosedError),
}

impl TryCommandError {
    pub(crate) fn from_try_send<T>(err: &TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => Self::BufferFull,
            TrySendError::Closed(_) => Self::Closed(ClientClosedError),
        }
    }
}
