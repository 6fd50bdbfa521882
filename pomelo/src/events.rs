use bytestring::ByteString;
use pomelo_proto::{Sid, StatusCode};

/// Observable lifecycle of the supervised connection
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no attempt in progress
    Closed,
    /// A socket is being opened
    Connecting,
    /// The socket is open, `INFO`/TLS/`CONNECT` are being exchanged
    Handshaking,
    /// The connection is fully established
    Open,
    /// The connection was lost, a new attempt is scheduled
    Reconnecting,
}

/// Events emitted by the client as the connection and its consumers
/// change state
///
/// Delivered through [`Client::events`]; slow receivers may miss
/// events (the channel is lossy by design).
///
/// [`Client::events`]: crate::core::Client::events
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientEvent {
    /// The first connection was established
    Connected,
    /// The connection was lost
    Disconnected,
    /// A reconnection attempt is about to start
    Reconnecting,
    /// A connection was re-established after a loss
    Reconnected,
    /// The client was closed and will not reconnect
    Closed,
    /// A subscription was removed because its consumer went away
    /// without unsubscribing
    SubscriptionDropped { sid: Sid },
    /// A pull consumer missed its expected heartbeats
    HeartbeatLost,
    /// A pull consumer was terminated by the broker
    ConsumerTerminated {
        status: StatusCode,
        description: Option<ByteString>,
    },
}
