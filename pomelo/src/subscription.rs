use std::{
    num::NonZeroU64,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::{FusedStream, Stream};
use pomelo_proto::{error::ServerError, Delivery, Sid};
use tokio::sync::mpsc;

use crate::{client::Client, error::ClientClosedError};

const BATCH_RECEIVE_SIZE: usize = 16;

/// A subscription's message stream
///
/// Yields deliveries in the order the broker sent them, with
/// at-most-once semantics. The stream must be polled continuously;
/// when its internal buffer fills up further deliveries are dropped.
///
/// Dropping the `Subscriber` unsubscribes lazily; the periodic sweep
/// covers the case where the unsubscribe could not be enqueued.
///
/// Obtained from [`Client::subscribe`].
///
/// [`Client::subscribe`]: crate::core::Client::subscribe
#[derive(Debug)]
pub struct Subscriber {
    sid: Sid,
    client: Client,
    receiver: mpsc::Receiver<Result<Delivery, ServerError>>,
    batch: Vec<Result<Delivery, ServerError>>,
    unsubscribed: bool,
}

impl Subscriber {
    pub(crate) fn new(
        sid: Sid,
        client: Client,
        receiver: mpsc::Receiver<Result<Delivery, ServerError>>,
    ) -> Self {
        Self {
            sid,
            client,
            receiver,
            batch: Vec::with_capacity(BATCH_RECEIVE_SIZE),
            unsubscribed: false,
        }
    }

    #[must_use]
    pub fn sid(&self) -> Sid {
        self.sid
    }

    /// Stop the subscription now
    ///
    /// Already-buffered deliveries continue to be yielded. Calling
    /// this more than once is a no-op.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn unsubscribe(&mut self) -> Result<(), ClientClosedError> {
        if !self.unsubscribed && !self.receiver.is_closed() {
            self.client.unsubscribe(self.sid, None).await?;
        }
        self.unsubscribed = true;
        Ok(())
    }

    /// Ask the broker to end the subscription after a total of
    /// `max_messages` deliveries
    ///
    /// The count is best-effort: reconnects and buffer overflow can
    /// make the stream yield fewer messages, and a race with already
    /// buffered broker-side deliveries can make it yield more.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn unsubscribe_after(
        &mut self,
        max_messages: NonZeroU64,
    ) -> Result<(), ClientClosedError> {
        if !self.unsubscribed && !self.receiver.is_closed() {
            self.client.unsubscribe(self.sid, Some(max_messages)).await?;
        }
        Ok(())
    }

    /// A rejection error forwarded by the connection task, if one is
    /// already buffered
    pub(crate) fn take_rejection(&mut self) -> Option<ServerError> {
        match self.receiver.try_recv() {
            Ok(Err(error)) => Some(error),
            Ok(Ok(delivery)) => {
                // Not a rejection; keep the delivery for the stream
                self.batch.push(Ok(delivery));
                None
            }
            Err(_) => None,
        }
    }
}

impl Stream for Subscriber {
    type Item = Result<Delivery, ServerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(item) = this.batch.pop() {
            return Poll::Ready(Some(item));
        }

        match this
            .receiver
            .poll_recv_many(cx, &mut this.batch, BATCH_RECEIVE_SIZE)
        {
            Poll::Pending => Poll::Pending,
            Poll::Ready(n @ 1..) => {
                debug_assert_eq!(n, this.batch.len());
                this.batch.reverse();
                Poll::Ready(this.batch.pop())
            }
            Poll::Ready(0) => {
                this.unsubscribed = true;
                Poll::Ready(None)
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.batch.len(), None)
    }
}

impl FusedStream for Subscriber {
    fn is_terminated(&self) -> bool {
        self.receiver.is_closed() && self.batch.is_empty()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if self.unsubscribed || self.receiver.is_closed() {
            return;
        }

        self.client.lazy_unsubscribe(self.sid, None);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future as _,
        task::{Context, Poll},
    };

    use bytes::Bytes;
    use claims::assert_matches;
    use futures_util::StreamExt as _;
    use pomelo_proto::{Delivery, HeaderMap, Message, Sid, Subject};
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::{client::Client, handler::Command, testing::CountingWaker};

    fn delivery(sid: Sid, num: usize) -> Delivery {
        Delivery {
            sid,
            status: None,
            status_description: None,
            message: Message {
                subject: format!("orders.{num}").try_into().unwrap(),
                reply_subject: None,
                headers: HeaderMap::new(),
                payload: Bytes::from_static(b"data"),
            },
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive_in_order() {
        let (client, mut handler) = Client::test(4);

        let subscribe = client.subscribe(Subject::from_static("orders.>"), None);
        tokio::pin!(subscribe);

        let (count, waker) = CountingWaker::new();
        let mut cx = Context::from_waker(&waker);
        assert!(subscribe.as_mut().poll(&mut cx).is_pending());

        let Command::Subscribe {
            sid,
            subject,
            queue_group,
            sink,
            ack,
        } = handler.receiver.try_recv().unwrap()
        else {
            panic!("expected Subscribe command");
        };
        assert_eq!(Sid::from(2), sid);
        assert_eq!(Subject::from_static("orders.>"), subject);
        assert_eq!(None, queue_group);

        assert_eq!(0, count.wakes());
        ack.send(()).unwrap();
        assert_eq!(1, count.wakes());
        let mut subscriber = match subscribe.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(subscriber)) => subscriber,
            other => panic!("subscribe did not resolve: {other:?}"),
        };

        for num in 0..8 {
            sink.try_send(Ok(delivery(sid, num))).unwrap();
        }
        for num in 0..8 {
            let received = subscriber.next().await.unwrap().unwrap();
            assert_eq!(format!("orders.{num}"), received.message.subject.as_str());
        }

        assert!(subscriber.poll_next_unpin(&mut cx).is_pending());
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let (client, mut handler) = Client::test(4);

        let subscribe = client.subscribe(Subject::from_static("a.b"), None);
        tokio::pin!(subscribe);

        let (_count, waker) = CountingWaker::new();
        let mut cx = Context::from_waker(&waker);
        assert!(subscribe.as_mut().poll(&mut cx).is_pending());

        let Command::Subscribe { ack, .. } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Subscribe command");
        };
        ack.send(()).unwrap();
        let Poll::Ready(Ok(mut subscriber)) = subscribe.as_mut().poll(&mut cx) else {
            panic!("subscribe did not resolve");
        };

        subscriber.unsubscribe().await.unwrap();
        assert_matches!(
            handler.receiver.try_recv().unwrap(),
            Command::Unsubscribe {
                max_messages: None,
                ..
            }
        );

        subscriber.unsubscribe().await.unwrap();
        assert_matches!(handler.receiver.try_recv(), Err(TryRecvError::Empty));

        drop(subscriber);
        assert_matches!(handler.receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn drop_sends_lazy_unsubscribe() {
        let (client, mut handler) = Client::test(4);

        let subscribe = client.subscribe(Subject::from_static("a.b"), None);
        tokio::pin!(subscribe);

        let (_count, waker) = CountingWaker::new();
        let mut cx = Context::from_waker(&waker);
        assert!(subscribe.as_mut().poll(&mut cx).is_pending());

        let Command::Subscribe { sid, ack, .. } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Subscribe command");
        };
        ack.send(()).unwrap();
        let Poll::Ready(Ok(subscriber)) = subscribe.as_mut().poll(&mut cx) else {
            panic!("subscribe did not resolve");
        };

        drop(subscriber);
        assert_matches!(
            handler.receiver.try_recv().unwrap(),
            Command::Unsubscribe { sid: dropped, max_messages: None } if dropped == sid
        );
    }

    #[tokio::test]
    async fn canceled_subscribe_unsubscribes() {
        let (client, mut handler) = Client::test(4);

        {
            let subscribe = client.subscribe(Subject::from_static("a.b"), None);
            tokio::pin!(subscribe);

            let (_count, waker) = CountingWaker::new();
            let mut cx = Context::from_waker(&waker);
            assert!(subscribe.as_mut().poll(&mut cx).is_pending());
            // Dropped before the broker acknowledged
        }

        assert_matches!(
            handler.receiver.try_recv().unwrap(),
            Command::Subscribe { .. }
        );
        assert_matches!(
            handler.receiver.try_recv().unwrap(),
            Command::Unsubscribe {
                max_messages: None,
                ..
            }
        );
    }

    #[tokio::test]
    async fn sid_allocation_is_strictly_increasing() {
        let (client, mut handler) = Client::test(16);

        let mut sids = Vec::new();
        for _ in 0..4 {
            let subscribe = client.subscribe(Subject::from_static("x"), None);
            tokio::pin!(subscribe);

            let (_count, waker) = CountingWaker::new();
            let mut cx = Context::from_waker(&waker);
            let _ = subscribe.as_mut().poll(&mut cx);

            let Command::Subscribe { sid, .. } = handler.receiver.try_recv().unwrap() else {
                panic!("expected Subscribe command");
            };
            sids.push(u64::from(sid));
        }

        for pair in sids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }
}
