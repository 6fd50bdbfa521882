use std::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;

/// A queue group name
///
/// Subscribers sharing a queue group receive one copy of each matching
/// message between them. Names follow token rules: non-empty printable
/// ASCII without whitespace, `.`, `*` or `>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueueGroup(ByteString);

const MAX_QUEUE_GROUP_LEN: usize = 128;

impl QueueGroup {
    /// Construct a `QueueGroup` from a static string
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid queue group name.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid QueueGroup")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(group: &str) -> Result<(), QueueGroupError> {
    if group.is_empty() {
        return Err(QueueGroupError::Empty);
    }

    if group.len() > MAX_QUEUE_GROUP_LEN {
        return Err(QueueGroupError::TooLong);
    }

    if group
        .bytes()
        .any(|b| !b.is_ascii_graphic() || matches!(b, b'.' | b'*' | b'>'))
    {
        return Err(QueueGroupError::IllegalCharacter);
    }

    Ok(())
}

impl TryFrom<ByteString> for QueueGroup {
    type Error = QueueGroupError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for QueueGroup {
    type Error = QueueGroupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value.into()))
    }
}

impl Deref for QueueGroup {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// An error encountered while validating a [`QueueGroup`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum QueueGroupError {
    #[error("queue group is empty")]
    Empty,
    #[error("queue group is longer than {MAX_QUEUE_GROUP_LEN} bytes")]
    TooLong,
    #[error("queue group contains an illegal character")]
    IllegalCharacter,
}

#[cfg(test)]
mod tests {
    use claims::{assert_err_eq, assert_ok};

    use super::{QueueGroup, QueueGroupError};

    #[test]
    fn validation() {
        assert_ok!(QueueGroup::try_from("workers".to_owned()));
        assert_ok!(QueueGroup::try_from("workers-2".to_owned()));

        assert_err_eq!(
            QueueGroup::try_from(String::new()),
            QueueGroupError::Empty
        );
        assert_err_eq!(
            QueueGroup::try_from("a b".to_owned()),
            QueueGroupError::IllegalCharacter
        );
        assert_err_eq!(
            QueueGroup::try_from("a.b".to_owned()),
            QueueGroupError::IllegalCharacter
        );
        assert_err_eq!(
            QueueGroup::try_from("a*".to_owned()),
            QueueGroupError::IllegalCharacter
        );
    }
}
