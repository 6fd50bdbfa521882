use bytestring::ByteString;

/// An error reported by the broker through a `-ERR` frame
///
/// The broker terminates the connection after sending most of these;
/// [`ServerError::is_fatal`] tells the read loop whether to expect
/// that.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ServerError {
    #[error("invalid subject")]
    InvalidSubject,
    #[error("permissions violation for publish")]
    PublishPermissionViolation,
    #[error("permissions violation for subscription")]
    SubscribePermissionViolation,

    #[error("authorization violation")]
    AuthorizationViolation,
    #[error("authorization timeout")]
    AuthorizationTimeout,
    #[error("unknown protocol operation")]
    UnknownProtocolOperation,
    #[error("invalid client protocol")]
    InvalidClientProtocol,
    #[error("maximum control line exceeded")]
    MaximumControlLineExceeded,
    #[error("parser error")]
    ParseError,
    #[error("secure connection, tls required")]
    TlsRequired,
    #[error("stale connection")]
    StaleConnection,
    #[error("maximum connections exceeded")]
    MaximumConnectionsExceeded,
    #[error("slow consumer")]
    SlowConsumer,
    #[error("maximum payload violation")]
    MaximumPayloadViolation,

    #[error("unknown error: {raw_message}")]
    Other { raw_message: ByteString },
}

impl ServerError {
    /// Whether the broker closes the connection after this error
    ///
    /// `None` for unrecognized errors.
    #[must_use]
    pub fn is_fatal(&self) -> Option<bool> {
        match self {
            Self::InvalidSubject
            | Self::PublishPermissionViolation
            | Self::SubscribePermissionViolation => Some(false),

            Self::AuthorizationViolation
            | Self::AuthorizationTimeout
            | Self::UnknownProtocolOperation
            | Self::InvalidClientProtocol
            | Self::MaximumControlLineExceeded
            | Self::ParseError
            | Self::TlsRequired
            | Self::StaleConnection
            | Self::MaximumConnectionsExceeded
            | Self::SlowConsumer
            | Self::MaximumPayloadViolation => Some(true),

            Self::Other { .. } => None,
        }
    }

    /// Whether the error means the broker rejected our credentials
    #[must_use]
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::AuthorizationViolation | Self::AuthorizationTimeout
        )
    }

    pub(crate) fn parse(raw_message: ByteString) -> Self {
        const KNOWN: [(&str, ServerError); 12] = [
            ("Invalid Subject", ServerError::InvalidSubject),
            (
                "Authorization Violation",
                ServerError::AuthorizationViolation,
            ),
            ("Authorization Timeout", ServerError::AuthorizationTimeout),
            (
                "Unknown Protocol Operation",
                ServerError::UnknownProtocolOperation,
            ),
            (
                "Invalid Client Protocol",
                ServerError::InvalidClientProtocol,
            ),
            (
                "Maximum Control Line Exceeded",
                ServerError::MaximumControlLineExceeded,
            ),
            ("Parser Error", ServerError::ParseError),
            (
                "Secure Connection - TLS Required",
                ServerError::TlsRequired,
            ),
            ("Stale Connection", ServerError::StaleConnection),
            (
                "Maximum Connections Exceeded",
                ServerError::MaximumConnectionsExceeded,
            ),
            ("Slow Consumer", ServerError::SlowConsumer),
            (
                "Maximum Payload Violation",
                ServerError::MaximumPayloadViolation,
            ),
        ];

        let message = raw_message.trim();

        // Permission errors carry the offending subject as a suffix
        const PUBLISH_PERMISSIONS: &str = "Permissions Violation for Publish";
        const SUBSCRIBE_PERMISSIONS: &str = "Permissions Violation for Subscription";
        if message.len() > PUBLISH_PERMISSIONS.len()
            && message[..PUBLISH_PERMISSIONS.len()].eq_ignore_ascii_case(PUBLISH_PERMISSIONS)
        {
            return Self::PublishPermissionViolation;
        }
        if message.len() > SUBSCRIBE_PERMISSIONS.len()
            && message[..SUBSCRIBE_PERMISSIONS.len()].eq_ignore_ascii_case(SUBSCRIBE_PERMISSIONS)
        {
            return Self::SubscribePermissionViolation;
        }

        KNOWN
            .into_iter()
            .find(|(text, _)| message.eq_ignore_ascii_case(text))
            .map_or(Self::Other { raw_message }, |(_, error)| error)
    }
}
