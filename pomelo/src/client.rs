use std::{
    num::NonZeroU64,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use bytestring::ByteString;
use pomelo_net::error::EstablishError;
use pomelo_proto::{HeaderMap, Message, QueueGroup, Sid, Subject};
use rand::RngCore as _;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    config::ClientBuilder,
    error::{ClientClosedError, PublishError, SubscribeError, TryCommandError, UsageError},
    events::{ClientEvent, ConnectionState},
    handler::{Command, Handler, HandlerOutput, RecycledHandler, SharedState, INBOX_WILDCARD_SID},
    pool::{Backoff, ServerPool},
    request::{RequestOptions, ResponseFut},
    subscription::Subscriber,
};

const EVENT_CHANNEL_SIZE: usize = 64;

/// A messaging client
///
/// `Client` is a `Clone`able handle to one supervised broker
/// connection. If the connection is lost the supervisor reconnects
/// with randomized exponential backoff, rotating through the seed and
/// discovered server list, and replays every open subscription.
#[derive(Debug, Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    commands: mpsc::Sender<Command>,
    shared: Arc<SharedState>,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    inbox_prefix: Subject,
    next_sid: AtomicU64,
    request_timeout: Duration,
    subscription_capacity: usize,
    supervisor: JoinHandle<()>,
}

/// An error encountered while connecting a new [`Client`]
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The builder holds no server addresses
    #[error("no servers configured")]
    NoServers,
    /// Every configured server rejected the connection; carries the
    /// last failure
    #[error("could not connect to any configured server")]
    Establish(#[source] EstablishError),
}

impl Client {
    /// Start building a new client
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect to a single broker URL with the default configuration.
    ///
    /// # Errors
    ///
    /// It returns an error if `url` is invalid or the broker does not
    /// accept the connection.
    pub async fn connect(url: &str) -> Result<Self, ConnectError> {
        Self::builder()
            .server(url)
            .map_err(|_| ConnectError::NoServers)?
            .connect()
            .await
    }

    pub(crate) async fn connect_with(builder: ClientBuilder) -> Result<Self, ConnectError> {
        if builder.servers.is_empty() {
            return Err(ConnectError::NoServers);
        }

        let (commands_tx, commands_rx) = mpsc::channel(builder.command_buffer_size);
        let (events_tx, _events_rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(SharedState::disconnected());
        let tls_connector = builder.build_tls_connector();

        let mut pool = ServerPool::new(builder.servers.clone());
        let mut recycle = Some(RecycledHandler::new(
            commands_rx,
            Arc::clone(&shared),
            events_tx.clone(),
            &builder,
        ));

        // One full rotation through the seed list before giving up
        let mut handler = None;
        let mut last_error = None;
        for _ in 0..pool.len() {
            let addr = pool.next();
            state_tx.send_replace(ConnectionState::Connecting);
            let on_socket_open = || {
                state_tx.send_replace(ConnectionState::Handshaking);
            };
            match Handler::connect(
                &addr,
                &builder,
                &tls_connector,
                recycle.take().expect("recycle is reassigned on every non-terminal iteration"),
                on_socket_open,
            )
            .await
            {
                Ok(connected) => {
                    handler = Some(connected);
                    break;
                }
                Err((err, prev_recycle)) => {
                    warn!(%addr, %err, "connection attempt failed");
                    last_error = Some(err);
                    recycle = Some(prev_recycle);
                }
            }
        }
        let Some(handler) = handler else {
            state_tx.send_replace(ConnectionState::Closed);
            recycle
                .expect("recycle is reassigned on every non-terminal iteration")
                .close();
            return Err(ConnectError::Establish(
                last_error.expect("at least one attempt was made"),
            ));
        };

        pool.merge_discovered(&shared.server_info().connect_urls);
        state_tx.send_replace(ConnectionState::Open);
        let _ = events_tx.send(ClientEvent::Connected);

        let inbox_prefix = handler.inbox_prefix().clone();
        let request_timeout = builder.request_timeout;
        let subscription_capacity = builder.object_pool_size;
        let supervisor = tokio::spawn(supervise(
            handler,
            builder,
            tls_connector,
            pool,
            Arc::clone(&shared),
            state_tx,
            events_tx.clone(),
        ));

        Ok(Self {
            inner: Arc::new(ClientInner {
                commands: commands_tx,
                shared,
                events: events_tx,
                state: state_rx,
                inbox_prefix,
                next_sid: AtomicU64::new(u64::from(INBOX_WILDCARD_SID) + 1),
                request_timeout,
                subscription_capacity,
                supervisor,
            }),
        })
    }

    /// Publish `payload` under `subject`
    ///
    /// Suspends while the command buffer is full. Returning `Ok` means
    /// the message was handed to the connection task, not that the
    /// broker received it.
    ///
    /// # Errors
    ///
    /// It returns an error if the subject contains wildcards, the
    /// payload exceeds the broker's `max_payload` or the client is
    /// closed.
    pub async fn publish(&self, subject: Subject, payload: Bytes) -> Result<(), PublishError> {
        self.publish_message(Message {
            subject,
            reply_subject: None,
            headers: HeaderMap::new(),
            payload,
        })
        .await
    }

    /// Publish a message with full control over headers and reply
    /// subject.
    ///
    /// # Errors
    ///
    /// See [`Client::publish`].
    pub async fn publish_message(&self, message: Message) -> Result<(), PublishError> {
        self.check_publishable(&message)?;
        self.enqueue_command(Command::Publish { message })
            .await
            .map_err(PublishError::Canceled)
    }

    /// Publish a message if the command buffer has room right now.
    ///
    /// # Errors
    ///
    /// It returns an error if the buffer is full, the message is not
    /// publishable or the client is closed.
    pub fn try_publish_message(&self, message: Message) -> Result<(), TryCommandError> {
        if self.check_publishable(&message).is_err() {
            return Err(TryCommandError::Closed(ClientClosedError));
        }
        self.try_enqueue_command(Command::Publish { message })
    }

    fn check_publishable(&self, message: &Message) -> Result<(), PublishError> {
        if !message.subject.is_literal() {
            return Err(PublishError::Usage(UsageError::WildcardPublish));
        }

        let max_payload = self.inner.shared.server_info().max_payload;
        let size = message.payload.len();
        if u64::try_from(size).unwrap_or(u64::MAX) > max_payload {
            return Err(PublishError::PayloadTooLarge { size, max_payload });
        }

        Ok(())
    }

    /// Publish a request and await the first reply over the shared
    /// inbox.
    ///
    /// # Errors
    ///
    /// It returns an error if the request cannot be published; the
    /// returned future fails with `Timeout` if no reply arrives in
    /// time.
    pub async fn request(
        &self,
        subject: Subject,
        payload: Bytes,
    ) -> Result<ResponseFut, PublishError> {
        self.request_with(subject, payload, RequestOptions::default())
            .await
    }

    /// [`Client::request`] with explicit headers and timeout.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn request_with(
        &self,
        subject: Subject,
        payload: Bytes,
        options: RequestOptions,
    ) -> Result<ResponseFut, PublishError> {
        if !subject.is_literal() {
            return Err(PublishError::Usage(UsageError::WildcardPublish));
        }
        let max_payload = self.inner.shared.server_info().max_payload;
        if u64::try_from(payload.len()).unwrap_or(u64::MAX) > max_payload {
            return Err(PublishError::PayloadTooLarge {
                size: payload.len(),
                max_payload,
            });
        }

        let token = ByteString::from(random_token());
        let (reply_tx, reply_rx) = oneshot::channel();

        self.enqueue_command(Command::Request {
            subject,
            token: token.clone(),
            headers: options.headers,
            payload,
            reply: reply_tx,
        })
        .await
        .map_err(PublishError::Canceled)?;

        let timeout = options.timeout.unwrap_or(self.inner.request_timeout);
        Ok(ResponseFut::new(
            token,
            reply_rx,
            self.clone(),
            time::sleep(timeout),
        ))
    }

    /// Subscribe to `subject`, waiting for the broker to acknowledge
    /// the subscription.
    ///
    /// Messages matching the (possibly wildcarded) subject are
    /// buffered in the returned [`Subscriber`] and must be consumed
    /// continuously; when the buffer is full further deliveries are
    /// dropped.
    ///
    /// # Errors
    ///
    /// It returns an error if a queue group is combined with an inbox
    /// subject, the broker rejects the subscription or the client is
    /// closed.
    pub async fn subscribe(
        &self,
        subject: Subject,
        queue_group: Option<QueueGroup>,
    ) -> Result<Subscriber, SubscribeError> {
        if queue_group.is_some() && subject.starts_with(&*self.inner.inbox_prefix) {
            return Err(SubscribeError::Usage(UsageError::QueueGroupOnInbox));
        }

        let sid = self.allocate_sid();
        let (sink, receiver) = mpsc::channel(self.inner.subscription_capacity);
        let (ack_tx, ack_rx) = oneshot::channel();

        self.enqueue_command(Command::Subscribe {
            sid,
            subject,
            queue_group,
            sink,
            ack: ack_tx,
        })
        .await
        .map_err(SubscribeError::Closed)?;

        // Constructed before the ack so cancellation unsubscribes
        let mut subscriber = Subscriber::new(sid, self.clone(), receiver);

        match ack_rx.await {
            Ok(()) => Ok(subscriber),
            Err(_dropped) => match subscriber.take_rejection() {
                Some(error) => Err(SubscribeError::Rejected(error)),
                None => Err(SubscribeError::Closed(ClientClosedError)),
            },
        }
    }

    fn allocate_sid(&self) -> Sid {
        let sid = self.inner.next_sid.fetch_add(1, Ordering::AcqRel);
        assert!(sid != u64::MAX, "subscription id space exhausted");
        Sid::from(sid)
    }

    /// A fresh inbox subject under this client's reply namespace
    #[must_use]
    pub fn new_inbox(&self) -> Subject {
        Subject::new_unchecked(
            format!("{}.{}", self.inner.inbox_prefix, random_token()).into(),
        )
    }

    /// The most recent `INFO` snapshot received from the broker
    #[must_use]
    pub fn server_info(&self) -> Arc<pomelo_proto::ServerInfo> {
        self.inner.shared.server_info()
    }

    /// Whether a connection is currently established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.shared.is_connected()
    }

    /// Whether the broker announced it is shutting down
    #[must_use]
    pub fn is_lame_duck(&self) -> bool {
        self.inner.shared.is_lame_duck()
    }

    /// The current state of the supervised connection
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// A watch receiver following [`Client::state`]
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    /// Subscribe to [`ClientEvent`]s
    ///
    /// The channel is lossy: a receiver that falls behind misses
    /// events instead of applying backpressure to the connection.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit_event(&self, event: ClientEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn default_request_timeout(&self) -> Duration {
        self.inner.request_timeout
    }

    pub(crate) fn subscription_capacity(&self) -> usize {
        self.inner.subscription_capacity
    }

    pub(crate) async fn unsubscribe(
        &self,
        sid: Sid,
        max_messages: Option<NonZeroU64>,
    ) -> Result<(), ClientClosedError> {
        self.enqueue_command(Command::Unsubscribe { sid, max_messages })
            .await
    }

    pub(crate) fn lazy_unsubscribe(&self, sid: Sid, max_messages: Option<NonZeroU64>) {
        if self
            .try_enqueue_command(Command::Unsubscribe { sid, max_messages })
            .is_err()
        {
            // The sweep catches the closed sink later
            self.inner.shared.request_sweep();
        }
    }

    pub(crate) fn lazy_forget_request(&self, token: ByteString) {
        if self
            .try_enqueue_command(Command::ForgetRequest { token })
            .is_err()
        {
            self.inner.shared.request_sweep();
        }
    }

    pub(crate) async fn enqueue_command(&self, command: Command) -> Result<(), ClientClosedError> {
        self.inner
            .commands
            .send(command)
            .await
            .map_err(|_| ClientClosedError)
    }

    pub(crate) fn try_enqueue_command(&self, command: Command) -> Result<(), TryCommandError> {
        self.inner
            .commands
            .try_send(command)
            .map_err(|err| TryCommandError::from_try_send(&err))
    }

    /// Close the client after the connection task has processed every
    /// buffered command
    ///
    /// Commands issued after this call fail with a closed error.
    pub async fn close(&self) {
        let (sender, receiver) = oneshot::channel();
        if self
            .enqueue_command(Command::Close(sender))
            .await
            .is_err()
        {
            return;
        }

        let _ = receiver.await;
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[cfg(test)]
pub(crate) struct TestHandler {
    pub(crate) receiver: mpsc::Receiver<Command>,
    pub(crate) _shared: Arc<SharedState>,
    pub(crate) _events: broadcast::Receiver<ClientEvent>,
}

#[cfg(test)]
impl Client {
    /// A client wired to an in-memory command channel instead of a
    /// real connection task
    pub(crate) fn test(command_buffer: usize) -> (Self, TestHandler) {
        let builder = ClientBuilder::new();
        let (commands_tx, commands_rx) = mpsc::channel(command_buffer);
        let (events_tx, events_rx) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Open);

        let shared = Arc::new(SharedState::disconnected());
        shared.store_info(pomelo_proto::ServerInfo {
            server_id: "pomelo-test".to_owned(),
            server_name: "pomelo-test".to_owned(),
            version: "2.10.17".to_owned(),
            protocol_version: 1,
            max_payload: 1024 * 1024,
            client_id: Some(1),
            auth_required: false,
            tls_required: false,
            tls_available: false,
            supports_headers: true,
            connect_urls: Vec::new(),
            lame_duck_mode: false,
            supports_jetstream: true,
            nonce: None,
        });
        shared.mark_connected(true);

        let inbox_prefix = Subject::new_unchecked(
            format!("{}.{}", builder.inbox_prefix, random_token()).into(),
        );

        let client = Self {
            inner: Arc::new(ClientInner {
                commands: commands_tx,
                shared: Arc::clone(&shared),
                events: events_tx,
                state: state_rx,
                inbox_prefix,
                next_sid: AtomicU64::new(u64::from(INBOX_WILDCARD_SID) + 1),
                request_timeout: builder.request_timeout,
                subscription_capacity: builder.object_pool_size,
                supervisor: tokio::spawn(async {}),
            }),
        };
        let handler = TestHandler {
            receiver: commands_rx,
            _shared: shared,
            _events: events_rx,
        };
        (client, handler)
    }
}

async fn supervise(
    mut handler: Handler,
    builder: ClientBuilder,
    tls_connector: pomelo_net::TlsConnector,
    mut pool: ServerPool,
    shared: Arc<SharedState>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
) {
    loop {
        match (&mut handler).await {
            HandlerOutput::Closed => {
                debug!("client closed");
                state.send_replace(ConnectionState::Closed);
                let _ = events.send(ClientEvent::Closed);
                handler.recycle().await.close();
                return;
            }
            HandlerOutput::Desynchronized => {
                // The ack FIFO slipped; keep running rather than drop
                // the connection over bookkeeping
                warn!("acknowledgement tracking desynchronized");
            }
            HandlerOutput::Disconnected => {
                debug!("connection lost, scheduling reconnect");
                let _ = events.send(ClientEvent::Disconnected);
                state.send_replace(ConnectionState::Reconnecting);

                let mut recycle = handler.recycle().await;
                pool.merge_discovered(&shared.server_info().connect_urls);

                let mut backoff = Backoff::new(
                    builder.reconnect_delay_min,
                    builder.reconnect_delay_max,
                    builder.reconnect_jitter,
                );
                let mut attempts: u32 = 0;

                loop {
                    if builder
                        .max_reconnects
                        .is_some_and(|max_reconnects| attempts >= max_reconnects)
                    {
                        warn!(attempts, "reconnect budget exhausted, closing");
                        state.send_replace(ConnectionState::Closed);
                        let _ = events.send(ClientEvent::Closed);
                        recycle.close();
                        return;
                    }

                    let _ = events.send(ClientEvent::Reconnecting);
                    time::sleep(backoff.next_delay()).await;

                    let addr = pool.next();
                    state.send_replace(ConnectionState::Connecting);
                    let on_socket_open = || {
                        state.send_replace(ConnectionState::Handshaking);
                    };
                    match Handler::connect(&addr, &builder, &tls_connector, recycle, on_socket_open)
                        .await
                    {
                        Ok(reconnected) => {
                            debug!(%addr, "reconnected");
                            handler = reconnected;
                            pool.merge_discovered(&shared.server_info().connect_urls);
                            state.send_replace(ConnectionState::Open);
                            let _ = events.send(ClientEvent::Reconnected);
                            break;
                        }
                        Err((err, prev_recycle)) => {
                            warn!(%addr, %err, "reconnect attempt failed");
                            state.send_replace(ConnectionState::Reconnecting);
                            recycle = prev_recycle;
                            attempts += 1;
                        }
                    }
                }
            }
        }
    }
}

/// A 128-bit random token in fixed-width hex, used for inbox subjects
/// and generated consumer names
pub(crate) fn random_token() -> String {
    let mut bytes = [0_u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{:032x}", u128::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use claims::assert_matches;
    use pomelo_proto::Subject;

    use crate::{
        error::{PublishError, SubscribeError, UsageError},
        handler::Command,
    };

    use super::{random_token, Client};

    #[tokio::test]
    async fn publish_enqueues_the_message() {
        let (client, mut handler) = Client::test(4);

        client
            .publish(Subject::from_static("orders.created"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let Command::Publish { message } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Publish command");
        };
        assert_eq!("orders.created", message.subject.as_str());
        assert_eq!(Bytes::from_static(b"x"), message.payload);
    }

    #[tokio::test]
    async fn wildcard_publishes_are_rejected() {
        let (client, _handler) = Client::test(4);

        assert_matches!(
            client
                .publish(Subject::from_static("orders.*"), Bytes::new())
                .await,
            Err(PublishError::Usage(UsageError::WildcardPublish))
        );
        assert_matches!(
            client
                .publish(Subject::from_static("orders.>"), Bytes::new())
                .await,
            Err(PublishError::Usage(UsageError::WildcardPublish))
        );
    }

    #[tokio::test]
    async fn oversize_publishes_fail_locally() {
        let (client, _handler) = Client::test(4);

        // The test INFO advertises a 1 MiB max_payload
        let payload = Bytes::from(vec![0_u8; 1024 * 1024 + 1]);
        assert_matches!(
            client.publish(Subject::from_static("big"), payload).await,
            Err(PublishError::PayloadTooLarge {
                size,
                max_payload: 1_048_576,
            }) if size == 1024 * 1024 + 1
        );

        // At the limit it goes through
        let payload = Bytes::from(vec![0_u8; 1024 * 1024]);
        client
            .publish(Subject::from_static("big"), payload)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_payloads_are_valid() {
        let (client, mut handler) = Client::test(4);

        client
            .publish(Subject::from_static("empty"), Bytes::new())
            .await
            .unwrap();

        let Command::Publish { message } = handler.receiver.try_recv().unwrap() else {
            panic!("expected Publish command");
        };
        assert!(message.payload.is_empty());
    }

    #[tokio::test]
    async fn queue_group_on_inbox_is_a_usage_error() {
        let (client, _handler) = Client::test(4);

        let inbox = client.new_inbox();
        assert_matches!(
            client
                .subscribe(inbox, Some("workers".to_owned().try_into().unwrap()))
                .await,
            Err(SubscribeError::Usage(UsageError::QueueGroupOnInbox))
        );
    }

    #[test]
    fn inbox_tokens_are_fixed_width_and_unique() {
        let a = random_token();
        let b = random_token();
        assert_eq!(32, a.len());
        assert_eq!(32, b.len());
        assert_ne!(a, b);
    }
}
