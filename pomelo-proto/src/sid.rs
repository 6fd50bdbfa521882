use std::fmt::{self, Display};

use crate::util::{self, ParseUintError};

/// A per-connection subscription identifier
///
/// Allocated by the client, strictly increasing within one connection
/// lifetime, and echoed back by the broker on every delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sid(u64);

impl Sid {
    pub const MIN: Self = Sid(1);
    pub const MAX: Self = Sid(u64::MAX);

    /// Parse a `Sid` from its ASCII decimal representation.
    ///
    /// # Errors
    ///
    /// It returns an error if `buf` is not a decimal number fitting `u64`.
    pub fn from_ascii_bytes(buf: &[u8]) -> Result<Self, ParseUintError> {
        util::parse_u64(buf).map(Self)
    }
}

impl From<u64> for Sid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Sid> for u64 {
    fn from(value: Sid) -> Self {
        value.0
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
