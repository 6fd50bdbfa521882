use std::{
    collections::{btree_map, BTreeMap},
    fmt::{self, Display},
    ops::Deref,
};

use bytestring::ByteString;
use unicase::UniCase;

/// A validated header name
///
/// Case-insensitive for comparison and ordering, case-preserving for
/// encoding. Names are non-empty printable ASCII without `:`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderName(UniCase<ByteString>);

/// A validated header value
///
/// Printable ASCII plus space and horizontal tab; CR and LF are
/// rejected so a value can never terminate the headers block early.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HeaderValue(ByteString);

/// An ordered multimap of message headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: BTreeMap<HeaderName, Values>,
    len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Values {
    One(HeaderValue),
    Many(Vec<HeaderValue>),
}

const MAX_HEADER_NAME_LEN: usize = 64;

impl HeaderName {
    /// Number of messages still covered by an expired or terminated pull request
    pub const PENDING_MESSAGES: Self = Self::new_internal("Nats-Pending-Messages");
    /// Number of bytes still covered by an expired or terminated pull request
    pub const PENDING_BYTES: Self = Self::new_internal("Nats-Pending-Bytes");
    /// Client-assigned unique identifier used for broker-side de-duplication
    pub const MESSAGE_ID: Self = Self::new_internal("Nats-Msg-Id");
    /// Name of the stream a message was stored in
    pub const STREAM: Self = Self::new_internal("Nats-Stream");
    /// Stream sequence of a stored message
    pub const SEQUENCE: Self = Self::new_internal("Nats-Sequence");
    /// Payload size of a headers-only delivery
    pub const MESSAGE_SIZE: Self = Self::new_internal("Nats-Msg-Size");

    /// Construct a `HeaderName` from a static string
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid header name.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid HeaderName")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    const fn new_internal(value: &'static str) -> Self {
        Self(UniCase::unicode(ByteString::from_static(value)))
    }
}

fn validate_name(name: &str) -> Result<(), HeaderNameError> {
    if name.is_empty() {
        return Err(HeaderNameError::Empty);
    }

    if name.len() > MAX_HEADER_NAME_LEN {
        return Err(HeaderNameError::TooLong);
    }

    if name
        .bytes()
        .any(|b| !b.is_ascii_graphic() || b == b':')
    {
        return Err(HeaderNameError::IllegalCharacter);
    }

    Ok(())
}

impl TryFrom<ByteString> for HeaderName {
    type Error = HeaderNameError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_name(&value)?;
        Ok(Self(UniCase::new(value)))
    }
}

impl TryFrom<String> for HeaderName {
    type Error = HeaderNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ByteString::from(value).try_into()
    }
}

impl Deref for HeaderName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.as_str(), f)
    }
}

impl HeaderValue {
    /// Construct a `HeaderValue` from a static string
    ///
    /// # Panics
    ///
    /// Panics if `value` is not a valid header value.
    #[must_use]
    pub fn from_static(value: &'static str) -> Self {
        Self::try_from(ByteString::from_static(value)).expect("invalid HeaderValue")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_value(value: &str) -> Result<(), HeaderValueError> {
    if value
        .bytes()
        .any(|b| !(b.is_ascii_graphic() || matches!(b, b' ' | b'\t')))
    {
        return Err(HeaderValueError::IllegalCharacter);
    }

    Ok(())
}

impl TryFrom<ByteString> for HeaderValue {
    type Error = HeaderValueError;

    fn try_from(value: ByteString) -> Result<Self, Self::Error> {
        validate_value(&value)?;
        Ok(Self(value))
    }
}

impl TryFrom<String> for HeaderValue {
    type Error = HeaderValueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ByteString::from(value).try_into()
    }
}

impl Deref for HeaderValue {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.as_str(), f)
    }
}

impl Values {
    fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(values) => values.len(),
        }
    }

    fn push(&mut self, value: HeaderValue) {
        match self {
            Self::One(first) => {
                *self = Self::Many(vec![first.clone(), value]);
            }
            Self::Many(values) => values.push(value),
        }
    }

    fn iter(&self) -> std::slice::Iter<'_, HeaderValue> {
        match self {
            Self::One(value) => std::slice::from_ref(value).iter(),
            Self::Many(values) => values.iter(),
        }
    }
}

impl HeaderMap {
    /// Create an empty `HeaderMap` without allocating
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            len: 0,
        }
    }

    /// Insert `value` under `name`, replacing any previous values
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        if let Some(prev) = self.entries.insert(name, Values::One(value)) {
            self.len -= prev.len();
        }
        self.len += 1;
    }

    /// Add `value` under `name`, keeping previous values
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        match self.entries.entry(name) {
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(Values::One(value));
            }
            btree_map::Entry::Occupied(mut occupied) => {
                occupied.get_mut().push(value);
            }
        }
        self.len += 1;
    }

    /// Remove every value stored under `name`
    pub fn remove(&mut self, name: &HeaderName) {
        if let Some(prev) = self.entries.remove(name) {
            self.len -= prev.len();
        }
    }

    /// The first value stored under `name`, if any
    #[must_use]
    pub fn get(&self, name: &HeaderName) -> Option<&HeaderValue> {
        self.entries.get(name).map(|values| match values {
            Values::One(value) => value,
            Values::Many(values) => &values[0],
        })
    }

    /// Total number of values stored in the map
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(name, values)` pairs in name order
    pub fn iter(
        &self,
    ) -> impl DoubleEndedIterator<Item = (&'_ HeaderName, impl Iterator<Item = &'_ HeaderValue>)>
    {
        self.entries
            .iter()
            .map(|(name, values)| (name, values.iter()))
    }
}

impl FromIterator<(HeaderName, HeaderValue)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (HeaderName, HeaderValue)>>(iter: I) -> Self {
        let mut this = Self::new();
        this.extend(iter);
        this
    }
}

impl Extend<(HeaderName, HeaderValue)> for HeaderMap {
    fn extend<T: IntoIterator<Item = (HeaderName, HeaderValue)>>(&mut self, iter: T) {
        for (name, value) in iter {
            self.append(name, value);
        }
    }
}

/// An error encountered while validating a [`HeaderName`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum HeaderNameError {
    #[error("header name is empty")]
    Empty,
    #[error("header name is longer than {MAX_HEADER_NAME_LEN} bytes")]
    TooLong,
    #[error("header name contains an illegal character")]
    IllegalCharacter,
}

/// An error encountered while validating a [`HeaderValue`]
#[derive(Debug, thiserror::Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
pub enum HeaderValueError {
    #[error("header value contains an illegal character")]
    IllegalCharacter,
}

#[cfg(test)]
mod tests {
    use claims::{assert_err, assert_ok, assert_some_eq};

    use super::{HeaderMap, HeaderName, HeaderValue};

    #[test]
    fn name_validation() {
        assert_ok!(HeaderName::try_from("Content-Type".to_owned()));
        assert_err!(HeaderName::try_from(String::new()));
        assert_err!(HeaderName::try_from("Bad:Name".to_owned()));
        assert_err!(HeaderName::try_from("Bad Name".to_owned()));
        assert_err!(HeaderName::try_from("x".repeat(65)));
    }

    #[test]
    fn value_validation() {
        assert_ok!(HeaderValue::try_from("a value\twith tab".to_owned()));
        assert_ok!(HeaderValue::try_from(String::new()));
        assert_err!(HeaderValue::try_from("bad\r\nvalue".to_owned()));
    }

    #[test]
    fn names_compare_case_insensitively() {
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_static("Nats-Msg-Id"),
            HeaderValue::from_static("abc"),
        );

        assert_some_eq!(
            map.get(&HeaderName::from_static("nats-msg-id")),
            &HeaderValue::from_static("abc")
        );
    }

    #[test]
    fn insert_replaces_append_accumulates() {
        let name = HeaderName::from_static("X-Tag");
        let mut map = HeaderMap::new();

        map.append(name.clone(), HeaderValue::from_static("one"));
        map.append(name.clone(), HeaderValue::from_static("two"));
        assert_eq!(2, map.len());

        map.insert(name.clone(), HeaderValue::from_static("three"));
        assert_eq!(1, map.len());
        assert_some_eq!(map.get(&name), &HeaderValue::from_static("three"));

        map.remove(&name);
        assert!(map.is_empty());
        assert_eq!(0, map.len());
    }

    #[test]
    fn iteration_yields_every_value() {
        let mut map = HeaderMap::new();
        map.append(
            HeaderName::from_static("A"),
            HeaderValue::from_static("1"),
        );
        map.append(
            HeaderName::from_static("A"),
            HeaderValue::from_static("2"),
        );
        map.append(
            HeaderName::from_static("B"),
            HeaderValue::from_static("3"),
        );

        let flattened = map
            .iter()
            .flat_map(|(name, values)| {
                values.map(move |value| (name.as_str().to_owned(), value.as_str().to_owned()))
            })
            .collect::<Vec<_>>();
        assert_eq!(
            vec![
                ("A".to_owned(), "1".to_owned()),
                ("A".to_owned(), "2".to_owned()),
                ("B".to_owned(), "3".to_owned()),
            ],
            flattened
        );
    }
}
