use std::mem;

use bytes::{Buf, Bytes};

/// Split a control line into whitespace-separated argument chunks.
///
/// At most `N` chunks are produced; a control line with more arguments
/// than that is malformed for every verb we parse.
pub(crate) fn split_args<const N: usize>(mut line: Bytes) -> [Option<Bytes>; N] {
    let mut args = [const { None }; N];

    for arg in &mut args {
        while line.first().is_some_and(|b| matches!(b, b' ' | b'\t')) {
            line.advance(1);
        }
        if line.is_empty() {
            break;
        }

        *arg = Some(match memchr::memchr2(b' ', b'\t', &line) {
            Some(i) => line.split_to(i),
            None => mem::take(&mut line),
        });
    }

    args
}

pub(crate) fn lines(bytes: Bytes) -> impl Iterator<Item = Bytes> {
    struct Lines(Bytes);

    impl Iterator for Lines {
        type Item = Bytes;

        fn next(&mut self) -> Option<Self::Item> {
            if self.0.is_empty() {
                return None;
            }

            Some(match memchr::memmem::find(&self.0, b"\r\n") {
                Some(i) => {
                    let line = self.0.split_to(i);
                    self.0.advance("\r\n".len());
                    line
                }
                None => mem::take(&mut self.0),
            })
        }
    }

    Lines(bytes)
}

macro_rules! parse_unsigned {
    ($name:ident, $num:ty) => {
        pub(crate) fn $name(buf: &[u8]) -> Result<$num, ParseUintError> {
            if buf.is_empty() {
                return Err(ParseUintError::Empty);
            }

            let mut val: $num = 0;
            for &b in buf {
                if !b.is_ascii_digit() {
                    return Err(ParseUintError::InvalidByte(b));
                }

                val = val
                    .checked_mul(10)
                    .and_then(|val| val.checked_add(<$num>::from(b - b'0')))
                    .ok_or(ParseUintError::Overflow)?;
            }

            Ok(val)
        }
    };
}

parse_unsigned!(parse_u16, u16);
parse_unsigned!(parse_u64, u64);
parse_unsigned!(parse_usize, usize);

/// An error encountered while parsing an ASCII decimal number
#[derive(Debug, thiserror::Error)]
pub enum ParseUintError {
    #[error("empty input")]
    Empty,
    #[error("invalid byte {0:?}")]
    InvalidByte(u8),
    #[error("overflow")]
    Overflow,
}
