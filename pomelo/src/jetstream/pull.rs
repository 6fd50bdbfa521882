use std::{
    future::Future as _,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use bytestring::ByteString;
use futures_core::{FusedStream, Stream};
use pomelo_proto::{error::ServerError, Delivery, HeaderName, Message, StatusCode, Subject};
use serde_json::json;
use tokio::{
    sync::mpsc,
    time::{self, Instant, Sleep},
};
use tracing::{debug, warn};

use crate::{
    client::Client,
    error::{PublishError, SubscribeError, UsageError},
    events::ClientEvent,
    jetstream::JetStream,
    subscription::Subscriber,
};

use super::consumer::ConsumerInfo;
use super::JetStreamError;

/// Stand-in batch size when only a byte limit bounds the pull
const BYTE_LIMITED_BATCH: u64 = 1_000_000;
const DEFAULT_MAX_MSGS: u64 = 500;
const DEFAULT_EXPIRES: Duration = Duration::from_secs(30);
const MIN_EXPIRES: Duration = Duration::from_secs(1);
const MAX_EXPIRES: Duration = Duration::from_secs(300);
const DEFAULT_IDLE_HEARTBEAT: Duration = Duration::from_secs(15);
const MIN_IDLE_HEARTBEAT: Duration = Duration::from_millis(500);
const MAX_IDLE_HEARTBEAT: Duration = Duration::from_secs(30);
/// Client-side slack past the server-side `expires` so legitimate
/// late deliveries are not cut off
const EXPIRY_GRACE: Duration = Duration::from_secs(5);
const EVENT_BUFFER: usize = 32;

/// A handle to a pull consumer
///
/// Obtained from [`JetStream::pull_consumer`] or
/// [`JetStream::create_pull_consumer`].
#[derive(Debug, Clone)]
pub struct PullConsumer {
    js: JetStream,
    stream_name: String,
    consumer_name: String,
}

/// Flow-control settings for one [`PullConsumer::consume`] call
///
/// `max_msgs` and `max_bytes` are mutually exclusive; the thresholds
/// default to half of the corresponding limit. `expires` is clamped to
/// 1..=300 seconds and `idle_heartbeat` to 0.5..=30 seconds.
#[derive(Debug, Clone, Default)]
pub struct PullSettings {
    /// Upper bound on messages the broker may have in flight
    pub max_msgs: Option<u64>,
    /// Upper bound on bytes the broker may have in flight
    pub max_bytes: Option<u64>,
    /// Refill once outstanding messages drop to this level
    pub threshold_msgs: Option<u64>,
    /// Refill once outstanding bytes drop to this level
    pub threshold_bytes: Option<u64>,
    /// Server-side lifetime of each pull request (zero means default)
    pub expires: Duration,
    /// Expected cadence of idle heartbeats (zero means default)
    pub idle_heartbeat: Duration,
}

/// Validated and clamped credit plan derived from [`PullSettings`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PullPlan {
    batch: u64,
    max_bytes: u64,
    threshold_msgs: u64,
    threshold_bytes: u64,
    expires: Duration,
    idle_heartbeat: Duration,
    byte_limited: bool,
}

impl PullSettings {
    /// Limit in-flight credit to `max_msgs` messages
    #[must_use]
    pub fn max_msgs(mut self, max_msgs: u64) -> Self {
        self.max_msgs = Some(max_msgs);
        self
    }

    /// Limit in-flight credit to `max_bytes` bytes
    #[must_use]
    pub fn max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    fn plan(&self) -> Result<PullPlan, UsageError> {
        if self.max_msgs.is_some() && self.max_bytes.is_some() {
            return Err(UsageError::BothLimits);
        }
        if self.max_msgs == Some(0) || self.max_bytes == Some(0) {
            return Err(UsageError::ZeroLimit);
        }
        if self.threshold_msgs == Some(0) || self.threshold_bytes == Some(0) {
            return Err(UsageError::ZeroLimit);
        }

        let expires = match self.expires {
            Duration::ZERO => DEFAULT_EXPIRES,
            expires => expires.clamp(MIN_EXPIRES, MAX_EXPIRES),
        };
        let idle_heartbeat = match self.idle_heartbeat {
            Duration::ZERO => DEFAULT_IDLE_HEARTBEAT,
            idle_heartbeat => idle_heartbeat.clamp(MIN_IDLE_HEARTBEAT, MAX_IDLE_HEARTBEAT),
        };

        Ok(match self.max_bytes {
            Some(max_bytes) => PullPlan {
                batch: BYTE_LIMITED_BATCH,
                max_bytes,
                threshold_msgs: BYTE_LIMITED_BATCH / 2,
                threshold_bytes: self
                    .threshold_bytes
                    .unwrap_or(max_bytes / 2)
                    .min(max_bytes),
                expires,
                idle_heartbeat,
                byte_limited: true,
            },
            None => {
                let batch = self.max_msgs.unwrap_or(DEFAULT_MAX_MSGS);
                PullPlan {
                    batch,
                    max_bytes: 0,
                    threshold_msgs: self.threshold_msgs.unwrap_or(batch / 2).min(batch),
                    threshold_bytes: 0,
                    expires,
                    idle_heartbeat,
                    byte_limited: false,
                }
            }
        })
    }
}

/// An error produced while consuming from a pull consumer
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("invalid pull settings")]
    Usage(#[source] UsageError),
    /// An admin api call made on the consumer's behalf failed
    #[error("admin api failure")]
    Api(#[source] JetStreamError),
    #[error("could not subscribe the delivery inbox")]
    Subscribe(#[source] SubscribeError),
    #[error("could not send the pull request")]
    Publish(#[source] PublishError),
    #[error("connection error on the delivery inbox")]
    Server(#[source] ServerError),
    /// The broker ended the consumer; no automatic recovery applies
    #[error("consumer terminated with status {status}")]
    Terminated {
        status: StatusCode,
        description: Option<ByteString>,
    },
    #[error("the delivery inbox was closed")]
    Closed,
}

/// Lifecycle notifications emitted alongside the message stream
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConsumerEvent {
    /// The initial pull was sent
    Pulled { batch: u64, max_bytes: u64 },
    /// Credit fell to the threshold and was replenished
    Refilled { batch: u64, max_bytes: u64 },
    /// A pull expired (server 408 or client-side timer)
    PullExpired,
    /// No heartbeat arrived within twice the configured cadence
    HeartbeatsMissed,
    /// The broker terminated the consumer
    Terminated {
        status: StatusCode,
        description: Option<ByteString>,
    },
}

/// Receiver half of the notification channel
///
/// Lossy: notifications are dropped when the receiver falls behind.
#[derive(Debug)]
pub struct Notifications {
    receiver: mpsc::Receiver<ConsumerEvent>,
}

impl Stream for Notifications {
    type Item = ConsumerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl PullConsumer {
    pub(crate) fn new(js: JetStream, stream_name: String, consumer_name: String) -> Self {
        Self {
            js,
            stream_name,
            consumer_name,
        }
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.consumer_name
    }

    /// Fetch the consumer's current state from the broker.
    ///
    /// # Errors
    ///
    /// It returns an error if the consumer no longer exists.
    pub async fn info(&self) -> Result<ConsumerInfo, JetStreamError> {
        self.js
            .consumer_info(&self.stream_name, &self.consumer_name)
            .await
    }

    fn next_subject(&self) -> Subject {
        Subject::new_unchecked(
            format!(
                "{}.CONSUMER.MSG.NEXT.{}.{}",
                self.js.api_prefix(),
                self.stream_name,
                self.consumer_name
            )
            .into(),
        )
    }

    /// Start a continuous, credit-managed consumption.
    ///
    /// Returns the ordered message stream together with the lifecycle
    /// notification stream. The engine keeps one pull open against the
    /// broker and replenishes credit whenever it falls to the
    /// configured threshold.
    ///
    /// # Errors
    ///
    /// It returns an error if the settings are contradictory or the
    /// delivery inbox cannot be established.
    pub async fn consume(
        &self,
        settings: PullSettings,
    ) -> Result<(Messages, Notifications), ConsumerError> {
        let plan = settings.plan().map_err(ConsumerError::Usage)?;
        let client = self.js.client().clone();

        let inbox = client.new_inbox();
        let subscription = client
            .subscribe(inbox.clone(), None)
            .await
            .map_err(ConsumerError::Subscribe)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let mut messages = Messages {
            client,
            subscription,
            next_subject: self.next_subject(),
            inbox,
            plan,
            pending_msgs: 0,
            pending_bytes: 0,
            watchdog: Box::pin(time::sleep(plan.idle_heartbeat * 2)),
            pull_deadline: Box::pin(time::sleep(plan.expires + EXPIRY_GRACE)),
            events: events_tx,
            pull_due: true,
            draining: false,
            terminated: false,
        };
        messages
            .send_pull(plan.batch, plan.max_bytes, true)
            .await
            .map_err(ConsumerError::Publish)?;

        Ok((messages, Notifications { receiver: events_rx }))
    }

    /// Request at most `batch` messages with a single expiring pull.
    ///
    /// The returned stream ends as soon as the broker reports the
    /// batch complete, the stream empty (`404`) or the pull expired
    /// (`408`).
    ///
    /// # Errors
    ///
    /// It returns an error if the delivery inbox cannot be established
    /// or the pull cannot be sent.
    pub async fn fetch(&self, batch: u64, expires: Duration) -> Result<Fetch, ConsumerError> {
        let expires = expires.clamp(MIN_EXPIRES, MAX_EXPIRES);
        let client = self.js.client().clone();

        let inbox = client.new_inbox();
        let subscription = client
            .subscribe(inbox.clone(), None)
            .await
            .map_err(ConsumerError::Subscribe)?;

        let request = json!({
            "batch": batch,
            "expires": expires.as_nanos(),
            "no_wait": true,
        });
        client
            .publish_message(Message {
                subject: self.next_subject(),
                reply_subject: Some(inbox),
                headers: pomelo_proto::HeaderMap::new(),
                payload: serde_json::to_vec(&request)
                    .expect("pull request serialization")
                    .into(),
            })
            .await
            .map_err(ConsumerError::Publish)?;

        Ok(Fetch {
            subscription,
            deadline: Box::pin(time::sleep(expires + EXPIRY_GRACE)),
            remaining: batch,
            done: false,
        })
    }
}

/// The ordered message stream of a [`PullConsumer::consume`] call
///
/// Yields deliveries in broker order. Dropping the stream cancels
/// the consumption; [`Messages::drain`] stops replenishment and
/// lets the open pull run out instead.
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct Messages {
    client: Client,
    subscription: Subscriber,
    next_subject: Subject,
    inbox: Subject,
    plan: PullPlan,
    pending_msgs: u64,
    pending_bytes: u64,
    watchdog: Pin<Box<Sleep>>,
    pull_deadline: Pin<Box<Sleep>>,
    events: mpsc::Sender<ConsumerEvent>,
    // A pull could not be enqueued and must be retried
    pull_due: bool,
    draining: bool,
    terminated: bool,
}

impl Messages {
    /// Acknowledge a delivery
    ///
    /// Required for consumers with an explicit acknowledgement policy;
    /// unacknowledged deliveries are redelivered after `ack_wait`.
    ///
    /// # Errors
    ///
    /// It returns an error if the client is closed.
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), PublishError> {
        let Some(reply_subject) = &delivery.message.reply_subject else {
            return Ok(());
        };

        self.client
            .publish(reply_subject.clone(), Bytes::new())
            .await
    }

    /// Stop replenishing credit and end the stream once the open pull
    /// has run its course
    pub fn drain(&mut self) {
        self.draining = true;
    }

    /// The outstanding message credit granted to the broker
    #[must_use]
    pub fn pending_msgs(&self) -> u64 {
        self.pending_msgs
    }

    /// The outstanding byte credit granted to the broker
    #[must_use]
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes
    }

    async fn send_pull(
        &mut self,
        batch: u64,
        max_bytes: u64,
        initial: bool,
    ) -> Result<(), PublishError> {
        let message = self.pull_message(batch, max_bytes);
        self.client.publish_message(message).await?;
        self.after_pull(batch, max_bytes, initial);
        Ok(())
    }

    fn try_send_pull(&mut self, batch: u64, max_bytes: u64) -> bool {
        let message = self.pull_message(batch, max_bytes);
        if self.client.try_publish_message(message).is_ok() {
            self.after_pull(batch, max_bytes, false);
            true
        } else {
            self.pull_due = true;
            false
        }
    }

    fn pull_message(&self, batch: u64, max_bytes: u64) -> Message {
        let mut request = json!({
            "batch": batch,
            "expires": self.plan.expires.as_nanos(),
            "idle_heartbeat": self.plan.idle_heartbeat.as_nanos(),
        });
        if max_bytes > 0 {
            request["max_bytes"] = json!(max_bytes);
        }

        Message {
            subject: self.next_subject.clone(),
            reply_subject: Some(self.inbox.clone()),
            headers: pomelo_proto::HeaderMap::new(),
            payload: serde_json::to_vec(&request)
                .expect("pull request serialization")
                .into(),
        }
    }

    /// Credit bookkeeping once a pull is on its way
    fn after_pull(&mut self, batch: u64, max_bytes: u64, initial: bool) {
        self.pull_due = false;
        self.pending_msgs = self.plan.batch;
        self.pending_bytes = self.plan.max_bytes;
        self.reset_pull_deadline();
        self.reset_watchdog();

        let event = if initial {
            ConsumerEvent::Pulled { batch, max_bytes }
        } else {
            ConsumerEvent::Refilled { batch, max_bytes }
        };
        let _ = self.events.try_send(event);
    }

    fn reset_watchdog(&mut self) {
        self.watchdog
            .as_mut()
            .reset(Instant::now() + self.plan.idle_heartbeat * 2);
    }

    fn reset_pull_deadline(&mut self) {
        self.pull_deadline
            .as_mut()
            .reset(Instant::now() + self.plan.expires + EXPIRY_GRACE);
    }

    fn refill_due(&self) -> bool {
        self.pending_msgs <= self.plan.threshold_msgs
            || (self.plan.byte_limited && self.pending_bytes <= self.plan.threshold_bytes)
    }

    /// The refill restores credit to the maximum, carrying only the
    /// message delta (byte-limited pulls keep the stand-in batch)
    fn refill_amounts(&self) -> (u64, u64) {
        if self.plan.byte_limited {
            (
                self.plan.batch,
                self.plan.max_bytes.saturating_sub(self.pending_bytes),
            )
        } else {
            (self.plan.batch.saturating_sub(self.pending_msgs), 0)
        }
    }

    /// A pull ended early or expired: give back what the broker still
    /// held for it, preferring the counts it reported in the headers
    fn absorb_expired_pull(&mut self, delivery: Option<&Delivery>) {
        let reported = |name: &HeaderName| -> Option<u64> {
            delivery?
                .message
                .headers
                .get(name)
                .and_then(|value| value.parse::<u64>().ok())
        };

        match reported(&HeaderName::PENDING_MESSAGES) {
            Some(unfilled) => self.pending_msgs = self.pending_msgs.saturating_sub(unfilled),
            None => self.pending_msgs = 0,
        }
        match reported(&HeaderName::PENDING_BYTES) {
            Some(unfilled) => self.pending_bytes = self.pending_bytes.saturating_sub(unfilled),
            None => self.pending_bytes = 0,
        }
    }

    fn terminate(
        &mut self,
        status: StatusCode,
        description: Option<ByteString>,
    ) -> ConsumerError {
        warn!(%status, "consumer terminated by the broker");
        self.terminated = true;
        let _ = self.events.try_send(ConsumerEvent::Terminated {
            status,
            description: description.clone(),
        });
        self.client.emit_event(ClientEvent::ConsumerTerminated {
            status,
            description: description.clone(),
        });
        ConsumerError::Terminated {
            status,
            description,
        }
    }
}

impl Stream for Messages {
    type Item = Result<Delivery, ConsumerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.terminated {
                return Poll::Ready(None);
            }

            if this.draining && !this.plan.byte_limited && this.pending_msgs == 0 {
                // The open pull is exhausted and no refill will follow
                this.terminated = true;
                return Poll::Ready(None);
            }

            if this.pull_due && !this.draining {
                let (batch, max_bytes) = this.refill_amounts();
                if !this.try_send_pull(batch, max_bytes) {
                    // The command buffer is full; retry on the next poll
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
            }

            if this.watchdog.as_mut().poll(cx).is_ready() {
                if this.draining {
                    this.terminated = true;
                    return Poll::Ready(None);
                }

                debug!("idle heartbeats missed, restarting the pull");
                let _ = this.events.try_send(ConsumerEvent::HeartbeatsMissed);
                this.client.emit_event(ClientEvent::HeartbeatLost);

                // The open pull is presumed lost together with its credit
                this.pending_msgs = 0;
                this.pending_bytes = 0;
                this.reset_watchdog();
                let (batch, max_bytes) = this.refill_amounts();
                if !this.try_send_pull(batch, max_bytes) {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                continue;
            }

            if this.pull_deadline.as_mut().poll(cx).is_ready() {
                if this.draining {
                    this.terminated = true;
                    return Poll::Ready(None);
                }

                let _ = this.events.try_send(ConsumerEvent::PullExpired);
                this.absorb_expired_pull(None);
                let (batch, max_bytes) = this.refill_amounts();
                if !this.try_send_pull(batch, max_bytes) {
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                continue;
            }

            match Pin::new(&mut this.subscription).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.terminated = true;
                    return Poll::Ready(Some(Err(ConsumerError::Closed)));
                }
                Poll::Ready(Some(Err(error))) => {
                    this.terminated = true;
                    return Poll::Ready(Some(Err(ConsumerError::Server(error))));
                }
                Poll::Ready(Some(Ok(delivery))) => {
                    let Some(status) = delivery.status else {
                        // A data message: consume credit, top it up if
                        // the threshold was crossed
                        this.pending_msgs = this.pending_msgs.saturating_sub(1);
                        let wire_size =
                            u64::try_from(delivery.message.wire_size()).unwrap_or(u64::MAX);
                        this.pending_bytes = this.pending_bytes.saturating_sub(wire_size);
                        this.reset_watchdog();

                        if !this.draining && this.refill_due() {
                            let (batch, max_bytes) = this.refill_amounts();
                            let _ = this.try_send_pull(batch, max_bytes);
                        }

                        return Poll::Ready(Some(Ok(delivery)));
                    };

                    match status {
                        StatusCode::IDLE_HEARTBEAT => {
                            this.reset_watchdog();
                        }
                        StatusCode::NO_MESSAGES | StatusCode::REQUEST_TIMEOUT => {
                            let _ = this.events.try_send(ConsumerEvent::PullExpired);
                            this.absorb_expired_pull(Some(&delivery));
                            if this.draining {
                                this.terminated = true;
                                return Poll::Ready(None);
                            }
                            let (batch, max_bytes) = this.refill_amounts();
                            if !this.try_send_pull(batch, max_bytes) {
                                cx.waker().wake_by_ref();
                                return Poll::Pending;
                            }
                        }
                        status if status.is_error() => {
                            let error =
                                this.terminate(status, delivery.status_description.clone());
                            return Poll::Ready(Some(Err(error)));
                        }
                        _ => {
                            // 2xx statuses carry no control meaning here
                        }
                    }
                }
            }
        }
    }
}

impl FusedStream for Messages {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// The message stream of a single [`PullConsumer::fetch`] batch
#[derive(Debug)]
#[must_use = "streams do nothing unless polled"]
pub struct Fetch {
    subscription: Subscriber,
    deadline: Pin<Box<Sleep>>,
    remaining: u64,
    done: bool,
}

impl Stream for Fetch {
    type Item = Result<Delivery, ConsumerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.done || this.remaining == 0 {
                this.done = true;
                return Poll::Ready(None);
            }

            if this.deadline.as_mut().poll(cx).is_ready() {
                this.done = true;
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.subscription).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(error))) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(ConsumerError::Server(error))));
                }
                Poll::Ready(Some(Ok(delivery))) => match delivery.status {
                    None => {
                        this.remaining -= 1;
                        return Poll::Ready(Some(Ok(delivery)));
                    }
                    Some(StatusCode::IDLE_HEARTBEAT) => {}
                    Some(StatusCode::NO_MESSAGES | StatusCode::REQUEST_TIMEOUT) => {
                        // Empty batch or expiry both mean end-of-pull
                        this.done = true;
                        return Poll::Ready(None);
                    }
                    Some(status) if status.is_error() => {
                        this.done = true;
                        return Poll::Ready(Some(Err(ConsumerError::Terminated {
                            status,
                            description: delivery.status_description.clone(),
                        })));
                    }
                    Some(_) => {}
                },
            }
        }
    }
}

impl FusedStream for Fetch {
    fn is_terminated(&self) -> bool {
        self.done || self.remaining == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{
        future::Future as _,
        task::{Context, Poll},
        time::Duration,
    };

    use bytes::Bytes;
    use claims::{assert_matches, assert_none, assert_ok};
    use futures_util::StreamExt as _;
    use pomelo_proto::{Delivery, HeaderMap, HeaderName, HeaderValue, Message, Sid, StatusCode};
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::{
        client::{Client, TestHandler},
        error::UsageError,
        handler::Command,
        jetstream::JetStream,
        testing::CountingWaker,
    };

    use super::{
        ConsumerEvent, Messages, Notifications, PullSettings, BYTE_LIMITED_BATCH,
    };

    struct Driven {
        messages: Messages,
        notifications: Notifications,
        handler: TestHandler,
        sink: tokio::sync::mpsc::Sender<Result<Delivery, pomelo_proto::error::ServerError>>,
        sid: Sid,
    }

    /// Start a consume() against the in-memory command channel,
    /// acknowledging the inbox subscription by hand
    fn drive_consume(settings: PullSettings) -> Driven {
        let (client, mut handler) = Client::test(64);
        let js = JetStream::new(client);
        let consumer = js.pull_consumer("EVENTS", "worker");

        let consume = consumer.consume(settings);
        tokio::pin!(consume);

        let (_count, waker) = CountingWaker::new();
        let mut cx = Context::from_waker(&waker);
        assert!(consume.as_mut().poll(&mut cx).is_pending());

        let Command::Subscribe { sid, sink, ack, .. } = handler.receiver.try_recv().unwrap()
        else {
            panic!("expected the inbox Subscribe command");
        };
        ack.send(()).unwrap();

        let (messages, notifications) = match consume.as_mut().poll(&mut cx) {
            Poll::Ready(Ok(pair)) => pair,
            other => panic!("consume did not resolve: {other:?}"),
        };

        Driven {
            messages,
            notifications,
            handler,
            sink,
            sid,
        }
    }

    fn pull_payload(command: Command) -> serde_json::Value {
        let Command::Publish { message } = command else {
            panic!("expected a pull Publish command, got {command:?}");
        };
        assert!(message
            .subject
            .as_str()
            .starts_with("$JS.API.CONSUMER.MSG.NEXT.EVENTS.worker"));
        serde_json::from_slice(&message.payload).unwrap()
    }

    fn data_delivery(sid: Sid, size: usize) -> Delivery {
        Delivery {
            sid,
            status: None,
            status_description: None,
            message: Message {
                subject: pomelo_proto::Subject::from_static("events.data"),
                reply_subject: Some(pomelo_proto::Subject::from_static(
                    "$JS.ACK.EVENTS.worker.1.1.1.1700000000000000000.0",
                )),
                headers: HeaderMap::new(),
                payload: Bytes::from(vec![0_u8; size]),
            },
        }
    }

    fn status_delivery(sid: Sid, status: StatusCode, headers: HeaderMap) -> Delivery {
        Delivery {
            sid,
            status: Some(status),
            status_description: None,
            message: Message {
                subject: pomelo_proto::Subject::from_static("inbox.reply"),
                reply_subject: None,
                headers,
                payload: Bytes::new(),
            },
        }
    }

    #[tokio::test]
    async fn message_credit_refills_at_the_threshold() {
        let mut driven = drive_consume(PullSettings {
            max_msgs: Some(100),
            threshold_msgs: Some(10),
            ..PullSettings::default()
        });

        let initial = pull_payload(driven.handler.receiver.try_recv().unwrap());
        assert_eq!(100, initial["batch"]);
        assert_none!(initial.get("max_bytes"));
        assert_eq!(
            Some(ConsumerEvent::Pulled {
                batch: 100,
                max_bytes: 0
            }),
            driven.notifications.next().await
        );

        for _ in 0..89 {
            driven
                .sink
                .try_send(Ok(data_delivery(driven.sid, 128)))
                .unwrap();
        }
        for _ in 0..89 {
            driven.messages.next().await.unwrap().unwrap();
        }
        assert_eq!(11, driven.messages.pending_msgs());
        assert_matches!(driven.handler.receiver.try_recv(), Err(TryRecvError::Empty));

        driven
            .sink
            .try_send(Ok(data_delivery(driven.sid, 128)))
            .unwrap();
        driven.messages.next().await.unwrap().unwrap();

        let refill = pull_payload(driven.handler.receiver.try_recv().unwrap());
        assert_eq!(90, refill["batch"]);
        assert_none!(refill.get("max_bytes"));
        assert_eq!(100, driven.messages.pending_msgs());
        assert_eq!(
            Some(ConsumerEvent::Refilled {
                batch: 90,
                max_bytes: 0
            }),
            driven.notifications.next().await
        );
    }

    #[tokio::test]
    async fn byte_credit_refills_at_the_threshold() {
        let mut driven = drive_consume(PullSettings {
            max_bytes: Some(1000),
            threshold_bytes: Some(100),
            ..PullSettings::default()
        });

        let initial = pull_payload(driven.handler.receiver.try_recv().unwrap());
        assert_eq!(BYTE_LIMITED_BATCH, initial["batch"]);
        assert_eq!(1000, initial["max_bytes"]);

        for _ in 0..89 {
            driven
                .sink
                .try_send(Ok(data_delivery(driven.sid, 10)))
                .unwrap();
        }
        for _ in 0..89 {
            driven.messages.next().await.unwrap().unwrap();
        }
        assert_eq!(110, driven.messages.pending_bytes());
        assert_matches!(driven.handler.receiver.try_recv(), Err(TryRecvError::Empty));

        driven
            .sink
            .try_send(Ok(data_delivery(driven.sid, 10)))
            .unwrap();
        driven.messages.next().await.unwrap().unwrap();

        let refill = pull_payload(driven.handler.receiver.try_recv().unwrap());
        assert_eq!(BYTE_LIMITED_BATCH, refill["batch"]);
        assert_eq!(900, refill["max_bytes"]);
        assert_eq!(1000, driven.messages.pending_bytes());
    }

    #[tokio::test]
    async fn heartbeats_do_not_consume_credit() {
        let mut driven = drive_consume(PullSettings {
            max_msgs: Some(10),
            ..PullSettings::default()
        });
        let _initial = driven.handler.receiver.try_recv().unwrap();

        driven
            .sink
            .try_send(Ok(status_delivery(
                driven.sid,
                StatusCode::IDLE_HEARTBEAT,
                HeaderMap::new(),
            )))
            .unwrap();
        driven
            .sink
            .try_send(Ok(data_delivery(driven.sid, 4)))
            .unwrap();

        // The heartbeat is swallowed; the data message comes through
        let delivery = driven.messages.next().await.unwrap().unwrap();
        assert_eq!(None, delivery.status);
        assert_eq!(9, driven.messages.pending_msgs());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_heartbeats_restart_the_pull() {
        let mut driven = drive_consume(PullSettings {
            max_msgs: Some(100),
            idle_heartbeat: Duration::from_secs(1),
            ..PullSettings::default()
        });
        let _initial = driven.handler.receiver.try_recv().unwrap();

        // No heartbeat for 2 × idle_heartbeat
        tokio::time::advance(Duration::from_millis(2100)).await;

        let (_count, waker) = CountingWaker::new();
        let mut cx = Context::from_waker(&waker);
        assert!(driven.messages.poll_next_unpin(&mut cx).is_pending());

        assert_eq!(
            Some(ConsumerEvent::Pulled {
                batch: 100,
                max_bytes: 0
            }),
            driven.notifications.next().await
        );
        assert_eq!(
            Some(ConsumerEvent::HeartbeatsMissed),
            driven.notifications.next().await
        );

        let recovery = pull_payload(driven.handler.receiver.try_recv().unwrap());
        assert_eq!(100, recovery["batch"]);
        assert_eq!(100, driven.messages.pending_msgs());
    }

    #[tokio::test]
    async fn request_timeout_reclaims_reported_credit() {
        let mut driven = drive_consume(PullSettings {
            max_msgs: Some(100),
            ..PullSettings::default()
        });
        let _initial = driven.handler.receiver.try_recv().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::PENDING_MESSAGES,
            HeaderValue::from_static("100"),
        );
        driven
            .sink
            .try_send(Ok(status_delivery(
                driven.sid,
                StatusCode::REQUEST_TIMEOUT,
                headers,
            )))
            .unwrap();

        let (_count, waker) = CountingWaker::new();
        let mut cx = Context::from_waker(&waker);
        assert!(driven.messages.poll_next_unpin(&mut cx).is_pending());

        // The expired pull's credit was reclaimed and re-granted
        let refill = pull_payload(driven.handler.receiver.try_recv().unwrap());
        assert_eq!(100, refill["batch"]);
        assert_eq!(100, driven.messages.pending_msgs());
    }

    #[tokio::test]
    async fn conflict_status_terminates_the_stream() {
        let mut driven = drive_consume(PullSettings {
            max_msgs: Some(10),
            ..PullSettings::default()
        });
        let _initial = driven.handler.receiver.try_recv().unwrap();

        let mut terminal = status_delivery(driven.sid, StatusCode::CONFLICT, HeaderMap::new());
        terminal.status_description = Some("Consumer Deleted".into());
        driven.sink.try_send(Ok(terminal)).unwrap();

        let error = driven.messages.next().await.unwrap().unwrap_err();
        assert_matches!(
            error,
            super::ConsumerError::Terminated { status, .. } if status == StatusCode::CONFLICT
        );
        assert_none!(driven.messages.next().await);

        let _pulled = driven.notifications.next().await.unwrap();
        assert_matches!(
            driven.notifications.next().await,
            Some(ConsumerEvent::Terminated { .. })
        );
    }

    #[test]
    fn defaults_fill_in() {
        let plan = assert_ok!(PullSettings::default().plan());
        assert_eq!(super::DEFAULT_MAX_MSGS, plan.batch);
        assert_eq!(0, plan.max_bytes);
        assert_eq!(super::DEFAULT_MAX_MSGS / 2, plan.threshold_msgs);
        assert_eq!(Duration::from_secs(30), plan.expires);
        assert_eq!(Duration::from_secs(15), plan.idle_heartbeat);
        assert!(!plan.byte_limited);
    }

    #[test]
    fn threshold_defaults_are_half_of_the_limit() {
        let plan = assert_ok!(PullSettings::default().max_msgs(10_000).plan());
        assert_eq!(5_000, plan.threshold_msgs);

        let plan = assert_ok!(PullSettings::default().max_bytes(1024).plan());
        assert_eq!(512, plan.threshold_bytes);
        assert_eq!(BYTE_LIMITED_BATCH, plan.batch);
        assert!(plan.byte_limited);
    }

    #[test]
    fn expires_clamps() {
        let cases = [
            (Duration::from_millis(100), Duration::from_secs(1)),
            (Duration::from_secs(300), Duration::from_secs(300)),
            (Duration::from_secs(400), Duration::from_secs(300)),
            (Duration::from_secs(10), Duration::from_secs(10)),
        ];
        for (input, expected) in cases {
            let plan = assert_ok!(PullSettings {
                expires: input,
                ..PullSettings::default()
            }
            .plan());
            assert_eq!(expected, plan.expires, "expires {input:?}");
        }
    }

    #[test]
    fn idle_heartbeat_clamps() {
        let cases = [
            (Duration::from_millis(100), Duration::from_millis(500)),
            (Duration::from_secs(60), Duration::from_secs(30)),
            (Duration::from_secs(10), Duration::from_secs(10)),
        ];
        for (input, expected) in cases {
            let plan = assert_ok!(PullSettings {
                idle_heartbeat: input,
                ..PullSettings::default()
            }
            .plan());
            assert_eq!(expected, plan.idle_heartbeat, "idle_heartbeat {input:?}");
        }
    }

    #[test]
    fn both_limits_are_rejected() {
        assert_matches!(
            PullSettings::default().max_msgs(10).max_bytes(10).plan(),
            Err(UsageError::BothLimits)
        );
    }

    #[test]
    fn zero_limits_are_rejected() {
        assert_matches!(
            PullSettings::default().max_msgs(0).plan(),
            Err(UsageError::ZeroLimit)
        );
        assert_matches!(
            PullSettings::default().max_bytes(0).plan(),
            Err(UsageError::ZeroLimit)
        );
    }
}
