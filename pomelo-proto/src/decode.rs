use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::{
    error::{HeaderNameError, HeaderValueError, ParseUintError, StatusCodeError},
    frame::ServerFrame,
    headers::{HeaderMap, HeaderName, HeaderValue},
    message::{Delivery, Message},
    server_error::ServerError,
    sid::Sid,
    status::StatusCode,
    subject::Subject,
    util,
};

const READ_BUF_CAPACITY: usize = 64 * 1024;
const MAX_CONTROL_LINE_LEN: usize = 16 * 1024;

/// A resumable decoder for the broker half of the wire protocol
///
/// Bytes are appended to [`FrameDecoder::buffer`] as they arrive from
/// the socket; [`FrameDecoder::decode`] yields at most one frame per
/// call and keeps partial input around, so feeding the same byte
/// stream in any split produces the same frame sequence.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    phase: Phase,
}

#[derive(Debug)]
enum Phase {
    /// Waiting for a CRLF-terminated control line.
    /// `scanned` remembers how far the previous scan got so partial
    /// lines are not re-scanned from the start.
    ControlLine { scanned: usize },
    /// Waiting for the headers block of an `HMSG`
    Headers {
        sid: Sid,
        subject: Subject,
        reply_subject: Option<Subject>,
        header_len: usize,
        payload_len: usize,
    },
    /// Waiting for the payload bytes and their trailing CRLF
    Payload {
        sid: Sid,
        subject: Subject,
        reply_subject: Option<Subject>,
        status: Option<StatusCode>,
        status_description: Option<ByteString>,
        headers: HeaderMap,
        payload_len: usize,
    },
    /// A previous error left the stream unusable
    Failed,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            phase: Phase::ControlLine { scanned: 0 },
        }
    }

    /// The buffer incoming socket bytes should be appended to
    pub fn buffer(&mut self) -> &mut impl BufMut {
        &mut self.buf
    }

    /// Reset all buffered state, e.g. after replacing the transport
    pub fn reset(&mut self) {
        self.buf.clear();
        self.phase = Phase::ControlLine { scanned: 0 };
    }

    /// Decode the next frame out of the buffered bytes.
    ///
    /// Returns `Ok(None)` when more input is needed.
    ///
    /// # Errors
    ///
    /// It returns an error on malformed input; the decoder is unusable
    /// afterwards.
    pub fn decode(&mut self) -> Result<Option<ServerFrame>, DecodeError> {
        match self.try_decode() {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.phase = Phase::Failed;
                Err(err)
            }
        }
    }

    fn try_decode(&mut self) -> Result<Option<ServerFrame>, DecodeError> {
        loop {
            match &mut self.phase {
                Phase::ControlLine { scanned } => {
                    let Some(line_len) = memchr::memmem::find(&self.buf[*scanned..], b"\r\n")
                        .map(|i| *scanned + i)
                    else {
                        if self.buf.len() > MAX_CONTROL_LINE_LEN {
                            return Err(DecodeError::ControlLineTooLong {
                                len: self.buf.len(),
                            });
                        }
                        *scanned = self.buf.len().saturating_sub(1);
                        return Ok(None);
                    };

                    let line = self.buf.split_to(line_len).freeze();
                    self.buf.advance("\r\n".len());
                    *scanned = 0;

                    match parse_control_line(line)? {
                        ControlLine::Frame(frame) => return Ok(Some(frame)),
                        ControlLine::AwaitBody(phase) => self.phase = phase,
                    }
                }
                Phase::Headers { header_len, .. } => {
                    if self.buf.len() < *header_len {
                        return Ok(None);
                    }

                    let Phase::Headers {
                        sid,
                        subject,
                        reply_subject,
                        header_len,
                        payload_len,
                    } = mem::replace(&mut self.phase, Phase::Failed)
                    else {
                        unreachable!()
                    };

                    let block = self.buf.split_to(header_len).freeze();
                    let (status, status_description, headers) = parse_header_block(block)?;
                    self.phase = Phase::Payload {
                        sid,
                        subject,
                        reply_subject,
                        status,
                        status_description,
                        headers,
                        payload_len,
                    };
                }
                Phase::Payload { payload_len, .. } => {
                    if self.buf.len() < *payload_len + "\r\n".len() {
                        return Ok(None);
                    }

                    let Phase::Payload {
                        sid,
                        subject,
                        reply_subject,
                        status,
                        status_description,
                        headers,
                        payload_len,
                    } = mem::replace(&mut self.phase, Phase::ControlLine { scanned: 0 })
                    else {
                        unreachable!()
                    };

                    let payload = self.buf.split_to(payload_len).freeze();
                    self.buf.advance("\r\n".len());

                    return Ok(Some(ServerFrame::Delivery {
                        delivery: Delivery {
                            sid,
                            status,
                            status_description,
                            message: Message {
                                subject,
                                reply_subject,
                                headers,
                                payload,
                            },
                        },
                    }));
                }
                Phase::Failed => return Err(DecodeError::Failed),
            }
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

enum ControlLine {
    Frame(ServerFrame),
    AwaitBody(Phase),
}

fn parse_control_line(mut line: Bytes) -> Result<ControlLine, DecodeError> {
    if line.starts_with(b"MSG ") {
        line.advance("MSG ".len());
        return parse_msg_args(line).map(ControlLine::AwaitBody);
    }
    if line.starts_with(b"HMSG ") {
        line.advance("HMSG ".len());
        return parse_hmsg_args(line).map(ControlLine::AwaitBody);
    }

    if line.starts_with(b"PING") {
        return Ok(ControlLine::Frame(ServerFrame::Ping));
    }
    if line.starts_with(b"PONG") {
        return Ok(ControlLine::Frame(ServerFrame::Pong));
    }
    if line.starts_with(b"+OK") {
        return Ok(ControlLine::Frame(ServerFrame::Ok));
    }

    if let Some(info) = line.strip_prefix(b"INFO ") {
        let info = serde_json::from_slice(info).map_err(DecodeError::InvalidInfo)?;
        return Ok(ControlLine::Frame(ServerFrame::Info { info }));
    }

    if line.starts_with(b"-ERR ") {
        line.advance("-ERR ".len());
        let message = line
            .strip_prefix(b"'")
            .and_then(|rest| rest.strip_suffix(b"'"))
            .ok_or(DecodeError::InvalidErrorMessage)?;
        let raw_message = ByteString::try_from(Bytes::copy_from_slice(message))
            .map_err(|_| DecodeError::InvalidErrorMessage)?;
        return Ok(ControlLine::Frame(ServerFrame::Error {
            error: ServerError::parse(raw_message),
        }));
    }

    Err(DecodeError::UnknownVerb)
}

fn parse_msg_args(line: Bytes) -> Result<Phase, DecodeError> {
    let (subject, sid, reply_subject, payload_len) = match util::split_args::<5>(line) {
        [Some(subject), Some(sid), Some(reply), Some(len), None] => {
            (subject, sid, Some(reply), len)
        }
        [Some(subject), Some(sid), Some(len), None, None] => (subject, sid, None, len),
        _ => return Err(DecodeError::BadArgCount { verb: "MSG" }),
    };

    Ok(Phase::Payload {
        sid: parse_sid(&sid)?,
        subject: parse_subject(subject)?,
        reply_subject: reply_subject.map(parse_subject).transpose()?,
        status: None,
        status_description: None,
        headers: HeaderMap::new(),
        payload_len: util::parse_usize(&payload_len).map_err(DecodeError::BadPayloadLength)?,
    })
}

fn parse_hmsg_args(line: Bytes) -> Result<Phase, DecodeError> {
    let (subject, sid, reply_subject, header_len, total_len) = match util::split_args::<6>(line) {
        [Some(subject), Some(sid), Some(reply), Some(hlen), Some(tlen), None] => {
            (subject, sid, Some(reply), hlen, tlen)
        }
        [Some(subject), Some(sid), Some(hlen), Some(tlen), None, None] => {
            (subject, sid, None, hlen, tlen)
        }
        _ => return Err(DecodeError::BadArgCount { verb: "HMSG" }),
    };

    let header_len = util::parse_usize(&header_len).map_err(DecodeError::BadHeaderLength)?;
    let total_len = util::parse_usize(&total_len).map_err(DecodeError::BadPayloadLength)?;
    let payload_len = total_len
        .checked_sub(header_len)
        .ok_or(DecodeError::BadTotalLength)?;

    Ok(Phase::Headers {
        sid: parse_sid(&sid)?,
        subject: parse_subject(subject)?,
        reply_subject: reply_subject.map(parse_subject).transpose()?,
        header_len,
        payload_len,
    })
}

fn parse_sid(sid: &[u8]) -> Result<Sid, DecodeError> {
    Sid::from_ascii_bytes(sid).map_err(DecodeError::BadSid)
}

fn parse_subject(subject: Bytes) -> Result<Subject, DecodeError> {
    ByteString::try_from(subject)
        .map(Subject::new_unchecked)
        .map_err(|_| DecodeError::SubjectInvalidUtf8)
}

type HeaderBlock = (Option<StatusCode>, Option<ByteString>, HeaderMap);

fn parse_header_block(block: Bytes) -> Result<HeaderBlock, DecodeError> {
    const VERSION_LINE: &[u8] = b"NATS/1.0";

    let mut lines = util::lines(block);
    let head = lines.next().ok_or(DecodeError::MissingHeaderVersion)?;
    let head = head
        .strip_prefix(VERSION_LINE)
        .ok_or(DecodeError::BadHeaderVersion)?;

    let rest = head.trim_ascii();
    let (status, status_description) = if rest.is_empty() {
        (None, None)
    } else {
        let (code, reason) = match memchr::memchr(b' ', rest) {
            Some(i) => (&rest[..i], rest[i + 1..].trim_ascii_start()),
            None => (rest, &[][..]),
        };
        let status = StatusCode::from_ascii_bytes(code).map_err(DecodeError::BadStatus)?;
        let reason = if reason.is_empty() {
            None
        } else {
            Some(
                ByteString::try_from(Bytes::copy_from_slice(reason))
                    .map_err(|_| DecodeError::HeaderInvalidUtf8)?,
            )
        };
        (Some(status), reason)
    };

    let mut headers = HeaderMap::new();
    for mut line in lines.filter(|line| !line.is_empty()) {
        let colon = memchr::memchr(b':', &line).ok_or(DecodeError::BadHeaderLine)?;
        let name = line.split_to(colon);
        line.advance(":".len());
        if line.first() == Some(&b' ') {
            line.advance(1);
        }

        let name = HeaderName::try_from(
            ByteString::try_from(name).map_err(|_| DecodeError::HeaderInvalidUtf8)?,
        )
        .map_err(DecodeError::BadHeaderName)?;
        let value = HeaderValue::try_from(
            ByteString::try_from(line).map_err(|_| DecodeError::HeaderInvalidUtf8)?,
        )
        .map_err(DecodeError::BadHeaderValue)?;
        headers.append(name, value);
    }

    Ok((status, status_description, headers))
}

/// An error encountered while decoding broker output
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("control line exceeds {MAX_CONTROL_LINE_LEN} bytes (got {len})")]
    ControlLineTooLong { len: usize },
    #[error("unknown protocol verb")]
    UnknownVerb,
    #[error("{verb} carries an unexpected number of arguments")]
    BadArgCount { verb: &'static str },
    #[error("subject is not valid UTF-8")]
    SubjectInvalidUtf8,
    #[error("could not parse the subscription id")]
    BadSid(#[source] ParseUintError),
    #[error("could not parse the header block length")]
    BadHeaderLength(#[source] ParseUintError),
    #[error("could not parse the payload length")]
    BadPayloadLength(#[source] ParseUintError),
    #[error("total length is smaller than the header length")]
    BadTotalLength,
    #[error("headers block is missing the version line")]
    MissingHeaderVersion,
    #[error("headers block carries an unknown version")]
    BadHeaderVersion,
    #[error("could not parse the status code")]
    BadStatus(#[source] StatusCodeError),
    #[error("header line is missing a colon")]
    BadHeaderLine,
    #[error("headers block is not valid UTF-8")]
    HeaderInvalidUtf8,
    #[error("invalid header name")]
    BadHeaderName(#[source] HeaderNameError),
    #[error("invalid header value")]
    BadHeaderValue(#[source] HeaderValueError),
    #[error("INFO payload could not be deserialized")]
    InvalidInfo(#[source] serde_json::Error),
    #[error("-ERR message is malformed")]
    InvalidErrorMessage,
    #[error("the decoder previously failed")]
    Failed,
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut as _, Bytes};
    use bytestring::ByteString;
    use claims::{assert_err, assert_matches, assert_ok_eq};

    use crate::{
        error::ServerError, frame::ServerFrame, headers::HeaderMap, headers::HeaderName,
        headers::HeaderValue, message::Delivery, message::Message, status::StatusCode,
        Subject,
    };

    use super::FrameDecoder;

    fn feed(decoder: &mut FrameDecoder, bytes: &[u8]) {
        decoder.buffer().put(Bytes::copy_from_slice(bytes));
    }

    #[test]
    fn decode_ping_pong_ok() {
        let mut decoder = FrameDecoder::new();
        feed(&mut decoder, b"PING\r\nPONG\r\n+OK\r\n");
        assert_ok_eq!(decoder.decode(), Some(ServerFrame::Ping));
        assert_ok_eq!(decoder.decode(), Some(ServerFrame::Pong));
        assert_ok_eq!(decoder.decode(), Some(ServerFrame::Ok));
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn decode_err_frame() {
        let mut decoder = FrameDecoder::new();
        feed(&mut decoder, b"-ERR 'Stale Connection'\r\n");
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerFrame::Error {
                error: ServerError::StaleConnection
            })
        );
    }

    #[test]
    fn decode_info_frame() {
        let mut decoder = FrameDecoder::new();
        feed(
            &mut decoder,
            br#"INFO {"server_id":"a","version":"2.10.0","proto":1,"max_payload":1048576}"#,
        );
        feed(&mut decoder, b"\r\n");

        let frame = decoder.decode().unwrap().unwrap();
        let ServerFrame::Info { info } = frame else {
            panic!("expected INFO, got {frame:?}");
        };
        assert_eq!("a", info.server_id);
        assert_eq!(1_048_576, info.max_payload);
    }

    #[test]
    fn decode_msg() {
        let mut decoder = FrameDecoder::new();
        feed(&mut decoder, b"MSG orders.created 7 reply.to 5\r\nhello\r\n");
        assert_ok_eq!(
            decoder.decode(),
            Some(ServerFrame::Delivery {
                delivery: Delivery {
                    sid: 7.into(),
                    status: None,
                    status_description: None,
                    message: Message {
                        subject: Subject::from_static("orders.created"),
                        reply_subject: Some(Subject::from_static("reply.to")),
                        headers: HeaderMap::new(),
                        payload: Bytes::from_static(b"hello"),
                    },
                }
            })
        );
    }

    #[test]
    fn decode_empty_payload() {
        let mut decoder = FrameDecoder::new();
        feed(&mut decoder, b"MSG subj 1 0\r\n\r\n");
        let frame = decoder.decode().unwrap().unwrap();
        let ServerFrame::Delivery { delivery } = frame else {
            panic!("expected delivery");
        };
        assert!(delivery.message.payload.is_empty());
    }

    #[test]
    fn decode_hmsg_with_headers() {
        let mut decoder = FrameDecoder::new();
        let headers = b"NATS/1.0\r\nFoo: bar\r\nFoo: baz\r\n\r\n";
        let frame = format!(
            "HMSG subj 3 {} {}\r\n",
            headers.len(),
            headers.len() + "body".len()
        );
        feed(&mut decoder, frame.as_bytes());
        feed(&mut decoder, headers);
        feed(&mut decoder, b"body\r\n");

        let ServerFrame::Delivery { delivery } = decoder.decode().unwrap().unwrap() else {
            panic!("expected delivery");
        };
        assert_eq!(None, delivery.status);
        assert_eq!(Bytes::from_static(b"body"), delivery.message.payload);
        assert_eq!(2, delivery.message.headers.len());
        assert_eq!(
            Some(&HeaderValue::from_static("bar")),
            delivery.message.headers.get(&HeaderName::from_static("foo"))
        );
    }

    #[test]
    fn decode_status_control_message() {
        let mut decoder = FrameDecoder::new();
        let headers = b"NATS/1.0 100 Idle Heartbeat\r\n\r\n";
        let frame = format!("HMSG subj 3 {0} {0}\r\n", headers.len());
        feed(&mut decoder, frame.as_bytes());
        feed(&mut decoder, headers);
        feed(&mut decoder, b"\r\n");

        let ServerFrame::Delivery { delivery } = decoder.decode().unwrap().unwrap() else {
            panic!("expected delivery");
        };
        assert_eq!(Some(StatusCode::IDLE_HEARTBEAT), delivery.status);
        assert_eq!(
            Some(ByteString::from_static("Idle Heartbeat")),
            delivery.status_description
        );
        assert!(delivery.is_control());
    }

    #[test]
    fn arbitrary_splits_yield_the_same_frames() {
        let headers = b"NATS/1.0\r\nX-K: v\r\n\r\n";
        let mut stream = Vec::new();
        stream.extend_from_slice(b"PING\r\nMSG a.b 2 11\r\nhello world\r\n");
        stream.extend_from_slice(
            format!(
                "HMSG c 3 {} {}\r\n",
                headers.len(),
                headers.len() + "split payload!".len()
            )
            .as_bytes(),
        );
        stream.extend_from_slice(headers);
        stream.extend_from_slice(b"split payload!\r\n+OK\r\n");

        let decode_all = |chunks: Vec<&[u8]>| {
            let mut decoder = FrameDecoder::new();
            let mut frames = Vec::new();
            for chunk in chunks {
                feed(&mut decoder, chunk);
                while let Some(frame) = decoder.decode().unwrap() {
                    frames.push(frame);
                }
            }
            frames
        };

        let whole = decode_all(vec![stream.as_slice()]);
        assert_eq!(4, whole.len());

        for split in 1..stream.len() {
            let (left, right) = stream.split_at(split);
            assert_eq!(whole, decode_all(vec![left, right]), "split at {split}");
        }
    }

    #[test]
    fn truncated_input_is_not_an_error() {
        let mut decoder = FrameDecoder::new();
        feed(&mut decoder, b"MSG a.b 2 100\r\npartial");
        assert_ok_eq!(decoder.decode(), None);
        assert_ok_eq!(decoder.decode(), None);
    }

    #[test]
    fn malformed_verb_fails() {
        let mut decoder = FrameDecoder::new();
        feed(&mut decoder, b"BOGUS stuff\r\n");
        assert_err!(decoder.decode());
        // decoder stays failed
        assert_matches!(decoder.decode(), Err(super::DecodeError::Failed));
    }

    #[test]
    fn malformed_length_fails() {
        let mut decoder = FrameDecoder::new();
        feed(&mut decoder, b"MSG a.b 2 12x\r\n");
        assert_err!(decoder.decode());
    }
}
