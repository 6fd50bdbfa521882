use std::{
    future::Future as _,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_core::{future::BoxFuture, FusedStream, Stream};
use pomelo_proto::{Delivery, Subject};
use tracing::{debug, warn};

use crate::client::random_token;

use super::{
    consumer::{AckInfo, AckPolicy, ConsumerConfig, DeliverPolicy},
    pull::{ConsumerError, Messages, PullConsumer, PullSettings},
    JetStream,
};

/// How long the broker keeps the ephemeral consumer alive with no
/// active pull, e.g. while the client reconnects
const ORDERED_INACTIVE_THRESHOLD: Duration = Duration::from_secs(300);

/// An ordered stream over an auto-managed ephemeral consumer
///
/// The backing consumer is memory-backed, single-replica and
/// acknowledgement-free, with a client-generated name. The stream
/// tracks the stream sequence of every delivery; on any gap or
/// consumer failure it deletes the consumer and recreates it at the
/// first missing sequence, invisibly to the caller.
///
/// Obtained from [`JetStream::ordered_consumer`].
#[must_use = "streams do nothing unless polled"]
pub struct OrderedMessages {
    js: JetStream,
    stream_name: String,
    filter_subject: Option<Subject>,
    last_sequence: u64,
    current_consumer: Option<String>,
    state: State,
}

enum State {
    /// Creating (or recreating) the backing consumer
    Starting {
        future: BoxFuture<'static, Result<(String, Messages), ConsumerError>>,
    },
    Running {
        messages: Messages,
    },
    /// An unrecoverable error was yielded
    Broken,
}

impl OrderedMessages {
    pub(crate) fn new(
        js: JetStream,
        stream_name: String,
        filter_subject: Option<Subject>,
    ) -> Self {
        let future = setup(js.clone(), stream_name.clone(), filter_subject.clone(), 0, None);

        Self {
            js,
            stream_name,
            filter_subject,
            last_sequence: 0,
            current_consumer: None,
            state: State::Starting { future },
        }
    }

    /// The stream sequence of the most recent delivery
    #[must_use]
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    fn restart(&mut self) {
        self.state = State::Starting {
            future: setup(
                self.js.clone(),
                self.stream_name.clone(),
                self.filter_subject.clone(),
                self.last_sequence,
                self.current_consumer.take(),
            ),
        };
    }
}

/// Delete the previous incarnation (if any) and create a fresh
/// consumer positioned right after `last_sequence`
fn setup(
    js: JetStream,
    stream_name: String,
    filter_subject: Option<Subject>,
    last_sequence: u64,
    previous: Option<String>,
) -> BoxFuture<'static, Result<(String, Messages), ConsumerError>> {
    Box::pin(async move {
        if let Some(previous) = previous {
            // Best effort: an inactive ephemeral consumer expires on
            // its own
            if let Err(err) = js.delete_consumer(&stream_name, &previous).await {
                debug!(consumer = %previous, %err, "could not delete the previous consumer");
            }
        }

        let name = format!("ordered_{}", &random_token()[..12]);
        let deliver_policy = if last_sequence == 0 {
            DeliverPolicy::All
        } else {
            DeliverPolicy::ByStartSequence {
                start_sequence: last_sequence + 1,
            }
        };
        let config = ConsumerConfig {
            name: name.clone(),
            filter_subject,
            deliver_policy,
            ack_policy: AckPolicy::None,
            num_replicas: 1,
            memory_storage: true,
            inactive_threshold: ORDERED_INACTIVE_THRESHOLD,
            ..ConsumerConfig::default()
        };

        let info = js
            .create_consumer(&stream_name, config)
            .await
            .map_err(ConsumerError::Api)?;
        let consumer = PullConsumer::new(js, info.stream_name, info.name.clone());
        let (messages, _notifications) = consumer.consume(PullSettings::default()).await?;

        Ok((info.name, messages))
    })
}

impl Stream for OrderedMessages {
    type Item = Result<Delivery, ConsumerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                State::Starting { future } => match future.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok((name, messages))) => {
                        debug!(consumer = %name, "ordered consumer ready");
                        this.current_consumer = Some(name);
                        this.state = State::Running { messages };
                    }
                    Poll::Ready(Err(err)) => {
                        warn!(%err, "ordered consumer could not start");
                        this.state = State::Broken;
                        return Poll::Ready(Some(Err(err)));
                    }
                },
                State::Running { messages } => match Pin::new(messages).poll_next(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(delivery))) => {
                        let sequence = delivery
                            .message
                            .reply_subject
                            .as_ref()
                            .and_then(AckInfo::parse)
                            .map(|info| info.stream_sequence);

                        match sequence {
                            Some(sequence)
                                if this.last_sequence == 0
                                    || sequence == this.last_sequence + 1 =>
                            {
                                this.last_sequence = sequence;
                                return Poll::Ready(Some(Ok(delivery)));
                            }
                            Some(sequence) => {
                                debug!(
                                    expected = this.last_sequence + 1,
                                    observed = sequence,
                                    "sequence gap, recreating the ordered consumer"
                                );
                                this.restart();
                            }
                            None => {
                                // Not a stream delivery; pass it through
                                return Poll::Ready(Some(Ok(delivery)));
                            }
                        }
                    }
                    Poll::Ready(Some(Err(err))) => {
                        // Any consumer failure is repaired by starting
                        // over from the last known sequence
                        debug!(%err, "ordered consumer failed, recreating");
                        this.restart();
                    }
                    Poll::Ready(None) => {
                        this.restart();
                    }
                },
                State::Broken => return Poll::Ready(None),
            }
        }
    }
}

impl FusedStream for OrderedMessages {
    fn is_terminated(&self) -> bool {
        matches!(self.state, State::Broken)
    }
}

impl std::fmt::Debug for OrderedMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedMessages")
            .field("stream_name", &self.stream_name)
            .field("filter_subject", &self.filter_subject)
            .field("last_sequence", &self.last_sequence)
            .field("current_consumer", &self.current_consumer)
            .finish_non_exhaustive()
    }
}
