use std::{
    fmt::{self, Display, Formatter},
    num::NonZeroU16,
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::util;

/// A control status code
///
/// Delivered in the first line of a headers block
/// (`NATS/1.0 <code> [<description>]`) and used by the broker for
/// flow-control and error signalling on payload-less messages.
///
/// Values are guaranteed to be in range `100..1000`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatusCode(NonZeroU16);

impl StatusCode {
    /// Liveness proof emitted while a pull request sits idle
    pub const IDLE_HEARTBEAT: StatusCode = Self::from_u16_unchecked(100);
    /// Generic success
    pub const OK: StatusCode = Self::from_u16_unchecked(200);
    /// A `no_wait` pull found the stream empty
    pub const NO_MESSAGES: StatusCode = Self::from_u16_unchecked(404);
    /// The pull request reached its server-side expiry
    pub const REQUEST_TIMEOUT: StatusCode = Self::from_u16_unchecked(408);
    /// The pull request was terminated early (consumer deleted, limits exceeded, ...)
    pub const CONFLICT: StatusCode = Self::from_u16_unchecked(409);
    /// The request subject has no subscribers
    pub const NO_RESPONDERS: StatusCode = Self::from_u16_unchecked(503);

    /// Parse a status code from exactly three ASCII digits.
    ///
    /// # Errors
    ///
    /// It returns an error if `buf` is not a three digit number in
    /// range `100..1000`.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, StatusCodeError> {
        if buf.len() != 3 {
            return Err(StatusCodeError);
        }

        util::parse_u16(buf)
            .map_err(|_| StatusCodeError)
            .and_then(Self::try_from)
    }

    /// Whether the code is in the error classes (4xx/5xx)
    #[must_use]
    pub fn is_error(self) -> bool {
        self.0.get() >= 400
    }

    const fn from_u16_unchecked(val: u16) -> Self {
        match NonZeroU16::new(val) {
            Some(val) => Self(val),
            None => unreachable!(),
        }
    }
}

impl TryFrom<u16> for StatusCode {
    type Error = StatusCodeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        if (100..1000).contains(&value) {
            Ok(Self(NonZeroU16::new(value).unwrap()))
        } else {
            Err(StatusCodeError)
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(value: StatusCode) -> Self {
        value.0.get()
    }
}

impl FromStr for StatusCode {
    type Err = StatusCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_ascii_bytes(s.as_bytes())
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for StatusCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        u16::from(*self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StatusCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u16::deserialize(deserializer)?
            .try_into()
            .map_err(de::Error::custom)
    }
}

/// An error encountered while parsing a [`StatusCode`]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
#[error("invalid status code")]
pub struct StatusCodeError;
