use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytestring::ByteString;
use pin_project_lite::pin_project;
use pomelo_proto::{Delivery, HeaderMap, StatusCode};
use tokio::{sync::oneshot, time::Sleep};

use crate::{client::Client, error::RequestError};

/// Options for [`Client::request_with`]
///
/// [`Client::request_with`]: crate::core::Client::request_with
#[derive(Debug, Default)]
pub struct RequestOptions {
    pub(crate) headers: HeaderMap,
    pub(crate) timeout: Option<Duration>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Headers to attach to the request message
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Reply deadline, overriding the client-wide default
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pin_project! {
    /// A [`Future`] resolving to the first reply of a request
    ///
    /// Obtained from [`Client::request`]. Dropping it deregisters the
    /// reply waiter.
    ///
    /// [`Client::request`]: crate::core::Client::request
    #[derive(Debug)]
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct ResponseFut {
        token: ByteString,
        receiver: oneshot::Receiver<Delivery>,
        client: Client,
        #[pin]
        timeout: Sleep,
        resolved: bool,
    }

    impl PinnedDrop for ResponseFut {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if !*this.resolved {
                this.client.lazy_forget_request(this.token.clone());
            }
        }
    }
}

impl ResponseFut {
    pub(crate) fn new(
        token: ByteString,
        receiver: oneshot::Receiver<Delivery>,
        client: Client,
        timeout: Sleep,
    ) -> Self {
        Self {
            token,
            receiver,
            client,
            timeout,
            resolved: false,
        }
    }
}

impl Future for ResponseFut {
    type Output = Result<Delivery, RequestError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match Pin::new(this.receiver).poll(cx) {
            Poll::Ready(Ok(delivery)) => {
                *this.resolved = true;
                if delivery.status == Some(StatusCode::NO_RESPONDERS) {
                    Poll::Ready(Err(RequestError::NoResponders))
                } else {
                    Poll::Ready(Ok(delivery))
                }
            }
            Poll::Ready(Err(_dropped)) => {
                // The connection was replaced before the reply arrived
                *this.resolved = true;
                Poll::Ready(Err(RequestError::Canceled))
            }
            Poll::Pending => match this.timeout.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(()) => {
                    *this.resolved = true;
                    this.client.lazy_forget_request(this.token.clone());
                    Poll::Ready(Err(RequestError::Timeout))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use claims::assert_matches;
    use pomelo_proto::{Delivery, HeaderMap, Message, StatusCode, Subject};

    use crate::{
        client::Client,
        error::RequestError,
        handler::{Command, INBOX_WILDCARD_SID},
        request::RequestOptions,
    };

    fn make_reply(subject: Subject, status: Option<StatusCode>) -> Delivery {
        let payload = if status.is_some() {
            Bytes::new()
        } else {
            Bytes::from_static(b"pong")
        };
        Delivery {
            sid: INBOX_WILDCARD_SID,
            status,
            status_description: None,
            message: Message {
                subject,
                reply_subject: None,
                headers: HeaderMap::new(),
                payload,
            },
        }
    }

    #[tokio::test]
    async fn request_resolves_with_the_reply() {
        let (client, mut handler) = Client::test(4);

        let response = client
            .request(Subject::from_static("service.echo"), Bytes::from_static(b"ping"))
            .await
            .unwrap();

        let Command::Request {
            subject,
            token,
            reply,
            payload,
            ..
        } = handler.receiver.try_recv().unwrap()
        else {
            panic!("expected Request command");
        };
        assert_eq!(Subject::from_static("service.echo"), subject);
        assert_eq!(Bytes::from_static(b"ping"), payload);

        let reply_subject = format!("_INBOX.conn.{token}").try_into().unwrap();
        reply.send(make_reply(reply_subject, None)).unwrap();

        let delivery = response.await.unwrap();
        assert_eq!(Bytes::from_static(b"pong"), delivery.message.payload);
    }

    #[tokio::test]
    async fn no_responders_is_an_error() {
        let (client, mut handler) = Client::test(4);

        let response = client
            .request(Subject::from_static("service.gone"), Bytes::new())
            .await
            .unwrap();

        let Command::Request { token, reply, .. } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Request command");
        };

        let reply_subject = format!("_INBOX.conn.{token}").try_into().unwrap();
        reply
            .send(make_reply(reply_subject, Some(StatusCode::NO_RESPONDERS)))
            .unwrap();

        assert_matches!(response.await, Err(RequestError::NoResponders));
    }

    #[tokio::test(start_paused = true)]
    async fn request_times_out_and_deregisters() {
        let (client, mut handler) = Client::test(4);

        let response = client
            .request_with(
                Subject::from_static("service.slow"),
                Bytes::new(),
                RequestOptions::new().timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        let Command::Request { token, .. } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Request command");
        };

        assert_matches!(response.await, Err(RequestError::Timeout));
        let Command::ForgetRequest { token: forgotten } = handler.receiver.try_recv().unwrap()
        else {
            panic!("expected ForgetRequest command");
        };
        assert_eq!(token, forgotten);
    }

    #[tokio::test]
    async fn dropped_response_deregisters() {
        let (client, mut handler) = Client::test(4);

        let response = client
            .request(Subject::from_static("service.echo"), Bytes::new())
            .await
            .unwrap();

        let Command::Request { token, .. } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Request command");
        };

        drop(response);
        let Command::ForgetRequest { token: forgotten } = handler.receiver.try_recv().unwrap()
        else {
            panic!("expected ForgetRequest command");
        };
        assert_eq!(token, forgotten);
    }

    #[tokio::test]
    async fn canceled_when_the_waiter_is_dropped() {
        let (client, mut handler) = Client::test(4);

        let response = client
            .request(Subject::from_static("service.echo"), Bytes::new())
            .await
            .unwrap();

        let Command::Request { reply, .. } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Request command");
        };

        drop(reply);
        assert_matches!(response.await, Err(RequestError::Canceled));
    }
}
