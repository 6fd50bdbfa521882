use std::{collections::VecDeque, io::IoSlice};

use bytes::{Buf, BufMut as _, Bytes, BytesMut};

use crate::{frame::ClientFrame, headers::HeaderMap, message::Message};

/// Payloads below this size are copied into the control buffer instead
/// of being chained as separate chunks.
const INLINE_PAYLOAD_THRESHOLD: usize = 4096;

/// An outbound frame queue
///
/// Frames are serialized eagerly into an internal queue that
/// implements [`Buf`], so the socket writer can drain it with plain or
/// vectored writes. Control data is flattened into a single buffer;
/// large payloads are chained zero-copy, preserving order.
#[derive(Debug, Default)]
pub struct FrameWriter {
    segments: VecDeque<Bytes>,
    segments_len: usize,
    tail: BytesMut,
}

impl FrameWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `frame` onto the queue
    pub fn enqueue(&mut self, frame: &ClientFrame) {
        match frame {
            ClientFrame::Publish { message } => self.encode_publish(message),
            ClientFrame::Subscribe {
                sid,
                subject,
                queue_group,
            } => match queue_group {
                Some(queue_group) => {
                    self.put_line(format_args!("SUB {subject} {queue_group} {sid}"));
                }
                None => self.put_line(format_args!("SUB {subject} {sid}")),
            },
            ClientFrame::Unsubscribe { sid, max_messages } => match max_messages {
                Some(max_messages) => {
                    self.put_line(format_args!("UNSUB {sid} {max_messages}"));
                }
                None => self.put_line(format_args!("UNSUB {sid}")),
            },
            ClientFrame::Connect { connect } => {
                self.tail.extend_from_slice(b"CONNECT ");
                serde_json::to_writer((&mut self.tail).writer(), connect)
                    .expect("serialize CONNECT");
                self.tail.extend_from_slice(b"\r\n");
            }
            ClientFrame::Ping => self.tail.extend_from_slice(b"PING\r\n"),
            ClientFrame::Pong => self.tail.extend_from_slice(b"PONG\r\n"),
        }
    }

    fn encode_publish(&mut self, message: &Message) {
        let Message {
            subject,
            reply_subject,
            headers,
            payload,
        } = message;

        let verb = if headers.is_empty() { "PUB" } else { "HPUB" };
        self.put_fmt(format_args!("{verb} {subject} "));
        if let Some(reply_subject) = reply_subject {
            self.put_fmt(format_args!("{reply_subject} "));
        }

        if headers.is_empty() {
            self.put_line(format_args!("{}", payload.len()));
        } else {
            let headers_len = headers_block_len(headers);
            self.put_line(format_args!("{headers_len} {}", headers_len + payload.len()));
            put_headers_block(&mut self.tail, headers);
        }

        if payload.len() < INLINE_PAYLOAD_THRESHOLD {
            self.tail.extend_from_slice(payload);
        } else {
            self.push_segment(payload.clone());
        }
        self.tail.extend_from_slice(b"\r\n");
    }

    fn put_fmt(&mut self, args: std::fmt::Arguments<'_>) {
        use std::fmt::Write as _;

        write!(self.tail, "{args}").expect("write control data");
    }

    fn put_line(&mut self, args: std::fmt::Arguments<'_>) {
        self.put_fmt(args);
        self.tail.extend_from_slice(b"\r\n");
    }

    fn push_segment(&mut self, payload: Bytes) {
        if !self.tail.is_empty() {
            let flushed = self.tail.split().freeze();
            self.segments_len += flushed.len();
            self.segments.push_back(flushed);
        }
        self.segments_len += payload.len();
        self.segments.push_back(payload);
    }

    #[cfg(test)]
    fn drain_to_vec(&mut self) -> Vec<u8> {
        self.copy_to_bytes(self.remaining()).to_vec()
    }
}

impl Buf for FrameWriter {
    fn remaining(&self) -> usize {
        self.segments_len + self.tail.len()
    }

    fn has_remaining(&self) -> bool {
        self.segments_len > 0 || !self.tail.is_empty()
    }

    fn chunk(&self) -> &[u8] {
        match self.segments.front() {
            Some(segment) => segment,
            None => &self.tail,
        }
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for segment in &self.segments {
            if filled == dst.len() {
                return filled;
            }
            dst[filled] = IoSlice::new(segment);
            filled += 1;
        }
        if !self.tail.is_empty() && filled < dst.len() {
            dst[filled] = IoSlice::new(&self.tail);
            filled += 1;
        }
        filled
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(
            cnt <= self.remaining(),
            "advance out of range ({cnt} <= {})",
            self.remaining()
        );

        while cnt > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };

            if front.len() > cnt {
                front.advance(cnt);
                self.segments_len -= cnt;
                return;
            }

            cnt -= front.len();
            self.segments_len -= front.len();
            self.segments.pop_front();
        }

        if cnt == self.tail.len() {
            self.tail.clear();
        } else {
            self.tail.advance(cnt);
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(
            len <= self.remaining(),
            "copy_to_bytes out of range ({len} <= {})",
            self.remaining()
        );

        // Fast path: the request is satisfied by the front segment
        if let Some(front) = self.segments.front_mut() {
            if front.len() >= len {
                let bytes = front.copy_to_bytes(len);
                self.segments_len -= len;
                if front.is_empty() {
                    self.segments.pop_front();
                }
                return bytes;
            }
        } else if self.segments.is_empty() {
            let bytes = self.tail.copy_to_bytes(len);
            return bytes;
        }

        let mut out = BytesMut::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            let chunk = self.chunk();
            let take = chunk.len().min(remaining);
            out.extend_from_slice(&chunk[..take]);
            self.advance(take);
            remaining -= take;
        }
        out.freeze()
    }
}

/// The encoded size of the headers block, version line and terminator
/// included
#[must_use]
pub fn headers_block_len(headers: &HeaderMap) -> usize {
    let mut len = "NATS/1.0\r\n".len() + "\r\n".len();
    for (name, values) in headers.iter() {
        for value in values {
            len += name.len() + ": ".len() + value.len() + "\r\n".len();
        }
    }
    len
}

fn put_headers_block(buf: &mut BytesMut, headers: &HeaderMap) {
    buf.extend_from_slice(b"NATS/1.0\r\n");
    for (name, values) in headers.iter() {
        for value in values {
            buf.extend_from_slice(name.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
    }
    buf.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use std::io::IoSlice;
    use std::num::NonZeroU64;

    use bytes::{Buf as _, Bytes};

    use crate::{
        frame::ClientFrame,
        headers::{HeaderMap, HeaderName, HeaderValue},
        message::Message,
        QueueGroup, Subject,
    };

    use super::FrameWriter;

    #[test]
    fn starts_empty() {
        let writer = FrameWriter::new();
        assert_eq!(0, writer.remaining());
        assert!(!writer.has_remaining());
    }

    #[test]
    fn encode_ping_pong() {
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Ping);
        writer.enqueue(&ClientFrame::Pong);
        assert_eq!(b"PING\r\nPONG\r\n".to_vec(), writer.drain_to_vec());
    }

    #[test]
    fn encode_subscribe() {
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Subscribe {
            sid: 4.into(),
            subject: Subject::from_static("orders.>"),
            queue_group: None,
        });
        assert_eq!(b"SUB orders.> 4\r\n".to_vec(), writer.drain_to_vec());

        writer.enqueue(&ClientFrame::Subscribe {
            sid: 5.into(),
            subject: Subject::from_static("orders.>"),
            queue_group: Some(QueueGroup::from_static("workers")),
        });
        assert_eq!(b"SUB orders.> workers 5\r\n".to_vec(), writer.drain_to_vec());
    }

    #[test]
    fn encode_unsubscribe() {
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Unsubscribe {
            sid: 4.into(),
            max_messages: None,
        });
        writer.enqueue(&ClientFrame::Unsubscribe {
            sid: 4.into(),
            max_messages: Some(NonZeroU64::new(10).unwrap()),
        });
        assert_eq!(b"UNSUB 4\r\nUNSUB 4 10\r\n".to_vec(), writer.drain_to_vec());
    }

    #[test]
    fn encode_publish() {
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Publish {
            message: Message {
                subject: Subject::from_static("orders.created"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(b"hello"),
            },
        });
        assert_eq!(
            b"PUB orders.created 5\r\nhello\r\n".to_vec(),
            writer.drain_to_vec()
        );
    }

    #[test]
    fn encode_publish_with_reply() {
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Publish {
            message: Message {
                subject: Subject::from_static("orders.created"),
                reply_subject: Some(Subject::from_static("_INBOX.abc.1")),
                headers: HeaderMap::new(),
                payload: Bytes::new(),
            },
        });
        assert_eq!(
            b"PUB orders.created _INBOX.abc.1 0\r\n\r\n".to_vec(),
            writer.drain_to_vec()
        );
    }

    #[test]
    fn encode_publish_with_headers() {
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Publish {
            message: Message {
                subject: Subject::from_static("orders"),
                reply_subject: None,
                headers: [
                    (
                        HeaderName::from_static("Nats-Msg-Id"),
                        HeaderValue::from_static("abcd"),
                    ),
                ]
                .into_iter()
                .collect(),
                payload: Bytes::from_static(b"payload"),
            },
        });
        assert_eq!(
            b"HPUB orders 31 38\r\nNATS/1.0\r\nNats-Msg-Id: abcd\r\n\r\npayload\r\n".to_vec(),
            writer.drain_to_vec()
        );
    }

    #[test]
    fn large_payloads_are_chained_not_copied() {
        let payload = Bytes::from(vec![b'x'; 8192]);
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Ping);
        writer.enqueue(&ClientFrame::Publish {
            message: Message {
                subject: Subject::from_static("big"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: payload.clone(),
            },
        });

        let mut slices = [IoSlice::new(&[]); 8];
        let filled = writer.chunks_vectored(&mut slices);
        // control prefix, payload, trailing CRLF
        assert_eq!(3, filled);

        let mut drained = writer.drain_to_vec();
        assert!(drained.starts_with(b"PING\r\nPUB big 8192\r\n"));
        assert!(drained.ends_with(b"\r\n"));
        drained.truncate(drained.len() - 2);
        assert!(drained.ends_with(&payload));
    }

    #[test]
    fn advance_across_segment_boundaries() {
        let payload = Bytes::from(vec![b'y'; 8192]);
        let mut writer = FrameWriter::new();
        writer.enqueue(&ClientFrame::Publish {
            message: Message {
                subject: Subject::from_static("big"),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload,
            },
        });

        let total = writer.remaining();
        let mut advanced = 0;
        while writer.has_remaining() {
            let step = writer.chunk().len().min(1000);
            writer.advance(step);
            advanced += step;
        }
        assert_eq!(total, advanced);
        assert_eq!(0, writer.remaining());
    }
}
