use std::{
    future::{self, Future},
    io,
    pin::{pin, Pin},
    task::{Context, Poll},
};

use bytes::Buf;
use pomelo_proto::{
    decode::{DecodeError, FrameDecoder},
    encode::FrameWriter,
    ClientFrame, ServerFrame,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Upper bound on buffered outbound bytes before the caller is asked
/// to stop enqueueing.
const WRITE_BACKPRESSURE_LIMIT: usize = 8 * 1024 * 1024;

/// A full-duplex framed connection over a byte stream
///
/// Owns the socket together with one [`FrameWriter`] and one
/// [`FrameDecoder`]. The read and write halves are independent; both
/// expose `poll_*` entry points so a single task can multiplex them.
#[derive(Debug)]
pub struct FramedConnection<S> {
    io: S,
    writer: FrameWriter,
    decoder: FrameDecoder,
    may_flush: bool,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(io: S) -> Self {
        Self {
            io,
            writer: FrameWriter::new(),
            decoder: FrameDecoder::new(),
            may_flush: false,
        }
    }

    pub fn poll_read_frame(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<ServerFrame, ReadFrameError>> {
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => return Poll::Ready(Ok(frame)),
                Ok(None) => {}
                Err(err) => return Poll::Ready(Err(ReadFrameError::Decode(err))),
            }

            let read = pin!(self.io.read_buf(self.decoder.buffer()));
            match read.poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(1..)) => {}
                Poll::Ready(Ok(0)) => {
                    // Peer closed the connection
                    return Poll::Ready(Err(ReadFrameError::Io(
                        io::ErrorKind::UnexpectedEof.into(),
                    )));
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(ReadFrameError::Io(err))),
            }
        }
    }

    /// Read the next frame from the broker.
    ///
    /// # Errors
    ///
    /// It returns an error if the stream is malformed or an I/O error
    /// occurs. Peer closure surfaces as `UnexpectedEof`.
    pub async fn read_frame(&mut self) -> Result<ServerFrame, ReadFrameError> {
        future::poll_fn(|cx| self.poll_read_frame(cx)).await
    }

    /// Whether outbound bytes are waiting to be written
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        self.writer.has_remaining()
    }

    /// Whether the queue has room for more frames
    #[must_use]
    pub fn may_enqueue(&self) -> bool {
        self.writer.remaining() < WRITE_BACKPRESSURE_LIMIT
    }

    /// Whether written bytes may be sitting in the socket's buffers
    #[must_use]
    pub fn may_flush(&self) -> bool {
        self.may_flush
    }

    pub fn enqueue(&mut self, frame: &ClientFrame) {
        self.writer.enqueue(frame);
    }

    pub fn poll_write_next(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if !self.writer.has_remaining() {
            return Poll::Ready(Ok(0));
        }

        let outcome = if self.io.is_write_vectored() {
            let mut slices = [io::IoSlice::new(&[]); 64];
            let filled = self.writer.chunks_vectored(&mut slices);
            debug_assert!(filled > 0);

            Pin::new(&mut self.io).poll_write_vectored(cx, &slices[..filled])
        } else {
            Pin::new(&mut self.io).poll_write(cx, self.writer.chunk())
        };

        match outcome {
            Poll::Pending => {
                self.may_flush = false;
                Poll::Pending
            }
            Poll::Ready(Ok(n)) => {
                self.writer.advance(n);
                self.may_flush = true;
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }

    /// Write the next chunk of queued bytes to the socket.
    ///
    /// # Errors
    ///
    /// It returns an error if the socket rejects the write.
    pub async fn write_next(&mut self) -> io::Result<usize> {
        future::poll_fn(|cx| self.poll_write_next(cx)).await
    }

    pub fn poll_flush(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.io).poll_flush(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => {
                self.may_flush = false;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
        }
    }

    /// Drain the write queue and flush the socket.
    ///
    /// # Errors
    ///
    /// It returns an error if writing or flushing fails.
    pub async fn write_and_flush(&mut self) -> io::Result<()> {
        while self.has_pending_writes() {
            self.write_next().await?;
        }

        future::poll_fn(|cx| self.poll_flush(cx)).await
    }

    /// Shut down the underlying socket.
    ///
    /// # Errors
    ///
    /// It returns an error if the shutdown fails; callers tearing down
    /// a broken connection usually ignore it.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        future::poll_fn(|cx| Pin::new(&mut self.io).poll_shutdown(cx)).await
    }

    /// Swap the underlying stream, keeping the codec state
    pub fn replace_io<F, S2>(self, replace: F) -> FramedConnection<S2>
    where
        F: FnOnce(S) -> S2,
    {
        FramedConnection {
            io: replace(self.io),
            writer: self.writer,
            decoder: self.decoder,
            may_flush: self.may_flush,
        }
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}

/// An error encountered while reading a frame
#[derive(Debug, thiserror::Error)]
pub enum ReadFrameError {
    #[error("malformed frame")]
    Decode(#[source] DecodeError),
    #[error("io")]
    Io(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
    };

    use claims::assert_matches;
    use futures_util::task;
    use pomelo_proto::{ClientFrame, ServerFrame};
    use tokio::io::{self, AsyncRead, AsyncWrite, ReadBuf};

    use super::FramedConnection;

    #[test]
    fn ping_pong() {
        let waker = task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let (ours, mut theirs) = io::duplex(1024);
        let mut conn = FramedConnection::new(ours);

        assert!(conn.poll_read_frame(&mut cx).is_pending());
        assert_matches!(conn.poll_write_next(&mut cx), Poll::Ready(Ok(0)));

        conn.enqueue(&ClientFrame::Ping);
        assert!(conn.has_pending_writes());
        assert_matches!(conn.poll_write_next(&mut cx), Poll::Ready(Ok(6)));
        assert!(!conn.has_pending_writes());

        let mut buf = [0; 64];
        let mut read_buf = ReadBuf::new(&mut buf);
        assert_matches!(
            Pin::new(&mut theirs).poll_read(&mut cx, &mut read_buf),
            Poll::Ready(Ok(()))
        );
        assert_eq!(b"PING\r\n", read_buf.filled());

        assert_matches!(
            Pin::new(&mut theirs).poll_write(&mut cx, b"PONG\r\n"),
            Poll::Ready(Ok(6))
        );
        assert_matches!(
            conn.poll_read_frame(&mut cx),
            Poll::Ready(Ok(ServerFrame::Pong))
        );
        assert!(conn.poll_read_frame(&mut cx).is_pending());
    }

    #[test]
    fn peer_closure_is_reported() {
        let waker = task::noop_waker();
        let mut cx = Context::from_waker(&waker);

        let (ours, theirs) = io::duplex(1024);
        let mut conn = FramedConnection::new(ours);

        drop(theirs);
        assert_matches!(
            conn.poll_read_frame(&mut cx),
            Poll::Ready(Err(super::ReadFrameError::Io(err)))
                if err.kind() == std::io::ErrorKind::UnexpectedEof
        );
    }
}
