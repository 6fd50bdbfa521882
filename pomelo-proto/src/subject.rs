use std::{
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// A validated subject string
///
/// Subjects are non-empty sequences of `.`-separated ASCII tokens.
/// A token may be the single-token wildcard `*` or the multi-token
/// wildcard `>`, the latter only in the last position. Wildcards are
/// legal in subscription patterns but must never appear in a publish
/// subject; use [`Subject::is_literal`] to tell the two apart.
///
/// Values produced by the broker bypass validation through
/// [`Subject::new_unchecked`] and may exceed the length limit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subject(ByteString);

const MAX_SUBJECT_LEN: usize = 256;

impl Subject {
    /// Construct a `Subject` from a static string
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid subject.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid Subject")
    }

    /// Construct a `Subject` without validating it
    ///
    /// Reserved for values the broker itself produced. Sending an
    /// unvalidated subject back out can smuggle protocol control
    /// characters, so anything user-supplied must go through the
    /// `TryFrom` constructors instead.
    #[must_use]
    pub fn new_unchecked(value: ByteString) -> Self {
        debug_assert!(
            validate(&value).is_ok(),
            "Subject {value:?} violates subject rules"
        );
        Self(value)
    }

    /// Whether the subject is free of wildcard tokens
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.0.split('.').all(|token| token != "*" && token != ">")
    }

    /// The final `.`-separated token of the subject
    #[must_use]
    pub fn last_token(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate(subject: &str) -> Result<(), SubjectError> {
    if subject.is_empty() {
        return Err(SubjectError::Empty);
    }

    if subject.len() > MAX_SUBJECT_LEN {
        return Err(SubjectError::TooLong);
    }

    if !subject.is_ascii() {
        return Err(SubjectError::NotAscii);
    }

    if subject
        .bytes()
        .any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(SubjectError::IllegalCharacter);
    }

    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        match token {
            "" => return Err(SubjectError::EmptyToken),
            ">" if tokens.peek().is_some() => return Err(SubjectError::MisplacedWildcard),
            "*" | ">" => {}
            _ if token.contains(['*', '>']) => return Err(SubjectError::MisplacedWildcard),
            _ => {}
        }
    }

    Ok(())
}

impl TryFrom<ByteString> for Subject {
    type Error = SubjectError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate(&value)?;
        Ok(Self(value.into()))
    }
}

impl TryFrom<&str> for Subject {
    type Error = SubjectError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        validate(value)?;
        Ok(Self(ByteString::from(value)))
    }
}

impl From<Subject> for ByteString {
    fn from(value: Subject) -> Self {
        value.0
    }
}

impl Deref for Subject {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_str().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        ByteString::deserialize(deserializer)?
            .try_into()
            .map_err(de::Error::custom)
    }
}

/// An error encountered while validating a [`Subject`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum SubjectError {
    #[error("subject is empty")]
    Empty,
    #[error("subject is longer than {MAX_SUBJECT_LEN} bytes")]
    TooLong,
    #[error("subject contains non-ASCII characters")]
    NotAscii,
    #[error("subject contains whitespace or control characters")]
    IllegalCharacter,
    #[error("subject contains an empty token")]
    EmptyToken,
    #[error("subject contains a misplaced wildcard")]
    MisplacedWildcard,
}

#[cfg(test)]
mod tests {
    use claims::{assert_err_eq, assert_ok};

    use super::{Subject, SubjectError};

    #[test]
    fn accepts_valid_subjects() {
        for subject in [
            "events",
            "events.orders",
            "events.orders.created",
            "events.*.created",
            "events.*.*",
            "events.orders.>",
            ">",
            "*",
        ] {
            let parsed = assert_ok!(Subject::try_from(subject));
            assert_eq!(subject, parsed.as_str());
        }
    }

    #[test]
    fn rejects_invalid_subjects() {
        let cases = [
            ("", SubjectError::Empty),
            (" ", SubjectError::IllegalCharacter),
            ("a b", SubjectError::IllegalCharacter),
            ("a\tb", SubjectError::IllegalCharacter),
            ("a\r\n", SubjectError::IllegalCharacter),
            ("héllo", SubjectError::NotAscii),
            ("a..b", SubjectError::EmptyToken),
            (".a", SubjectError::EmptyToken),
            ("a.", SubjectError::EmptyToken),
            ("a.>.b", SubjectError::MisplacedWildcard),
            ("a.b>", SubjectError::MisplacedWildcard),
            ("a.*x", SubjectError::MisplacedWildcard),
            ("a.x*", SubjectError::MisplacedWildcard),
        ];
        for (subject, expected) in cases {
            assert_err_eq!(Subject::try_from(subject), expected);
        }

        let long = "x".repeat(257);
        assert_err_eq!(Subject::try_from(long), SubjectError::TooLong);
    }

    #[test]
    fn literal_detection() {
        assert!(Subject::from_static("a.b.c").is_literal());
        assert!(!Subject::from_static("a.*.c").is_literal());
        assert!(!Subject::from_static("a.b.>").is_literal());
    }

    #[test]
    fn last_token() {
        assert_eq!("c", Subject::from_static("a.b.c").last_token());
        assert_eq!("only", Subject::from_static("only").last_token());
    }
}
