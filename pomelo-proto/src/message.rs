use bytes::Bytes;
use bytestring::ByteString;

use crate::{headers::HeaderMap, sid::Sid, status::StatusCode, subject::Subject};

/// A message as published or delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: Subject,
    pub reply_subject: Option<Subject>,
    pub headers: HeaderMap,
    pub payload: Bytes,
}

/// A message delivered by the broker
///
/// Carries the subscription it was routed to and, for control
/// messages, the status line the broker put in the headers block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sid: Sid,
    pub status: Option<StatusCode>,
    pub status_description: Option<ByteString>,
    pub message: Message,
}

impl Message {
    /// The size the broker debits against byte budgets for this message
    #[must_use]
    pub fn wire_size(&self) -> usize {
        let headers_len = if self.headers.is_empty() {
            0
        } else {
            crate::encode::headers_block_len(&self.headers)
        };
        headers_len + self.payload.len()
    }
}

impl Delivery {
    /// Whether this delivery is a payload-less control message
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.status.is_some() && self.message.payload.is_empty()
    }
}
