use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
    num::NonZeroU64,
    ops::ControlFlow,
    pin::Pin,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::Bytes;
use bytestring::ByteString;
use pomelo_net::{
    error::EstablishError, establish, ConnectOptions, FramedConnection, MaybeTls, TlsConnector,
};
use pomelo_proto::{
    error::ServerError, ClientFrame, Delivery, HeaderMap, Message, QueueGroup, ServerAddr,
    ServerFrame, ServerInfo, Sid, Subject,
};
use tokio::{
    net::TcpStream,
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    time::{self, Instant, Interval, MissedTickBehavior, Sleep},
};
use tracing::{debug, warn};

use crate::{client::random_token, config::ClientBuilder, events::ClientEvent};

/// The wildcard inbox subscription always takes the first SID
pub(crate) const INBOX_WILDCARD_SID: Sid = Sid::MIN;
const COMMAND_RECV_BATCH: usize = 16;

type Conn = FramedConnection<MaybeTls<TcpStream>>;
pub(crate) type DeliverySink = mpsc::Sender<Result<Delivery, ServerError>>;

/// The connection actor
///
/// Owns the transport exclusively and multiplexes, in one task:
/// command intake from the [`Client`] handles, the socket read path,
/// write draining with optional delayed flushing, the ping watchdog
/// and the subscription sweep.
///
/// [`Client`]: crate::core::Client
#[derive(Debug)]
pub(crate) struct Handler {
    conn: Conn,
    shared: Arc<SharedState>,
    events: broadcast::Sender<ClientEvent>,

    ping_interval: Duration,
    ping_timer: Pin<Box<Sleep>>,
    pending_pings: u8,

    sweep_timer: Interval,
    delayed_flush: Option<DelayedFlush>,
    flushing: bool,
    shutting_down: bool,

    commands: mpsc::Receiver<Command>,
    recv_buf: Vec<Command>,
    in_flight: VecDeque<InFlight>,

    registry: Registry,
    inbox: InboxRouter,

    awaiting_close: Vec<oneshot::Sender<()>>,
}

/// Connection-independent state handed from one [`Handler`]
/// incarnation to the next across reconnects
#[derive(Debug)]
pub(crate) struct RecycledHandler {
    commands: mpsc::Receiver<Command>,
    shared: Arc<SharedState>,
    events: broadcast::Sender<ClientEvent>,
    registry: Registry,
    inbox_prefix: Subject,
    awaiting_close: Vec<oneshot::Sender<()>>,
}

/// State shared lock-free between the actor and the client handles
#[derive(Debug)]
pub(crate) struct SharedState {
    info: ArcSwap<ServerInfo>,
    flags: AtomicU32,
}

const FLAG_CONNECTED: u32 = 1 << 0;
const FLAG_LAMEDUCK: u32 = 1 << 1;
const FLAG_SWEEP_DUE: u32 = 1 << 31;

#[derive(Debug)]
struct DelayedFlush {
    // INVARIANT: `interval != Duration::ZERO`
    interval: Duration,
    delay: Pin<Box<Option<Sleep>>>,
}

#[derive(Debug, Default)]
struct Registry {
    entries: BTreeMap<Sid, SubEntry>,
}

#[derive(Debug)]
struct SubEntry {
    subject: Subject,
    queue_group: Option<QueueGroup>,
    sink: DeliverySink,
    remaining: Option<NonZeroU64>,
    pending_ack: Option<oneshot::Sender<()>>,
    rejected: bool,
}

#[derive(Debug)]
struct InboxRouter {
    prefix: Subject,
    waiters: Option<BTreeMap<ByteString, oneshot::Sender<Delivery>>>,
}

#[derive(Debug)]
pub(crate) enum Command {
    Publish {
        message: Message,
    },
    Request {
        subject: Subject,
        token: ByteString,
        headers: HeaderMap,
        payload: Bytes,
        reply: oneshot::Sender<Delivery>,
    },
    ForgetRequest {
        token: ByteString,
    },
    Subscribe {
        sid: Sid,
        subject: Subject,
        queue_group: Option<QueueGroup>,
        sink: DeliverySink,
        ack: oneshot::Sender<()>,
    },
    Unsubscribe {
        sid: Sid,
        max_messages: Option<NonZeroU64>,
    },
    Close(oneshot::Sender<()>),
}

/// One entry per command the broker will acknowledge in verbose mode
#[derive(Debug)]
enum InFlight {
    Plain,
    Subscribe { sid: Sid },
}

#[derive(Debug)]
pub(crate) enum HandlerOutput {
    /// The transport failed or the broker sent a fatal error
    Disconnected,
    /// The acknowledgement FIFO lost sync with the broker
    Desynchronized,
    /// The client asked for a clean shutdown
    Closed,
}

impl Handler {
    pub(crate) async fn connect(
        addr: &ServerAddr,
        builder: &ClientBuilder,
        tls_connector: &TlsConnector,
        recycle: RecycledHandler,
        on_socket_open: impl FnOnce(),
    ) -> Result<Self, (EstablishError, RecycledHandler)> {
        let options = ConnectOptions {
            client_name: builder.client_name.clone(),
            echo: builder.echo,
            tls_mode: builder.tls_mode,
            tls_connector,
            auth: builder.auth.as_ref(),
        };

        let outcome = match time::timeout(
            builder.ping_timeout.max(Duration::from_secs(1)) + Duration::from_secs(5),
            establish(addr, options, on_socket_open),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_elapsed) => {
                return Err((
                    EstablishError::Io(std::io::ErrorKind::TimedOut.into()),
                    recycle,
                ))
            }
        };
        let (mut conn, info) = match outcome {
            Ok(items) => items,
            Err(err) => return Err((err, recycle)),
        };

        recycle.shared.info.store(Arc::from(info));
        recycle.shared.set_flag(FLAG_CONNECTED, true);
        recycle.shared.set_flag(FLAG_LAMEDUCK, false);

        let mut registry = recycle.registry;
        let mut in_flight = VecDeque::new();
        registry.replay(&mut conn, &mut in_flight);

        let mut sweep_timer = time::interval(builder.subscription_cleanup_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a fresh interval fires immediately
        sweep_timer.reset();

        let delayed_flush = if builder.flush_interval.is_zero() {
            None
        } else {
            Some(DelayedFlush {
                interval: builder.flush_interval,
                delay: Box::pin(None),
            })
        };

        Ok(Self {
            conn,
            shared: recycle.shared,
            events: recycle.events,
            ping_interval: builder.ping_interval,
            ping_timer: Box::pin(time::sleep(builder.ping_interval)),
            pending_pings: 0,
            sweep_timer,
            delayed_flush,
            flushing: false,
            shutting_down: false,
            commands: recycle.commands,
            recv_buf: Vec::with_capacity(COMMAND_RECV_BATCH),
            in_flight,
            registry,
            inbox: InboxRouter {
                prefix: recycle.inbox_prefix,
                waiters: None,
            },
            awaiting_close: recycle.awaiting_close,
        })
    }

    /// Tear the connection down, keeping everything that survives a
    /// reconnect
    pub(crate) async fn recycle(mut self) -> RecycledHandler {
        self.shared.set_flag(FLAG_CONNECTED, false);
        let _ = self.conn.shutdown().await;

        RecycledHandler {
            commands: self.commands,
            shared: self.shared,
            events: self.events,
            registry: self.registry,
            // Dropping the waiters fails every in-flight request; the
            // broker-side interest died with the old connection
            inbox_prefix: self.inbox.prefix,
            awaiting_close: self.awaiting_close,
        }
    }

    pub(crate) fn inbox_prefix(&self) -> &Subject {
        &self.inbox.prefix
    }

    fn handle_frame(&mut self, frame: ServerFrame) -> ControlFlow<HandlerOutput, ()> {
        match frame {
            ServerFrame::Delivery { delivery } if delivery.sid == INBOX_WILDCARD_SID => {
                self.inbox.route(delivery);
            }
            ServerFrame::Delivery { delivery } => {
                self.registry
                    .deliver(delivery, &mut self.conn, &mut self.in_flight, &self.events);
            }
            ServerFrame::Ok => {
                let Some(in_flight) = self.in_flight.pop_front() else {
                    return ControlFlow::Break(HandlerOutput::Desynchronized);
                };

                if let InFlight::Subscribe { sid } = in_flight {
                    self.registry.confirm(sid);
                }
            }
            ServerFrame::Error { error } if error.is_fatal() == Some(false) => {
                let Some(in_flight) = self.in_flight.pop_front() else {
                    return ControlFlow::Break(HandlerOutput::Desynchronized);
                };

                match in_flight {
                    InFlight::Plain => {
                        warn!(%error, "broker rejected a command");
                    }
                    InFlight::Subscribe { sid } => {
                        self.registry.reject(sid, error);
                        self.shared.set_flag(FLAG_SWEEP_DUE, true);
                    }
                }
            }
            ServerFrame::Error { error } => {
                warn!(%error, "fatal broker error");
                return ControlFlow::Break(HandlerOutput::Disconnected);
            }
            ServerFrame::Ping => {
                self.conn.enqueue(&ClientFrame::Pong);
            }
            ServerFrame::Pong => {
                self.pending_pings = self.pending_pings.saturating_sub(1);
            }
            ServerFrame::Info { info } => {
                debug!(lame_duck = info.lame_duck_mode, "INFO update");
                self.shared.set_flag(FLAG_LAMEDUCK, info.lame_duck_mode);
                self.shared.info.store(Arc::from(info));
            }
        }

        ControlFlow::Continue(())
    }

    #[cold]
    fn ping(&mut self, cx: &mut Context<'_>) -> Result<(), HandlerOutput> {
        if self.pending_pings >= 2 {
            // Two unanswered pings, the connection is presumed dead
            return Err(HandlerOutput::Disconnected);
        }

        loop {
            self.reset_ping_timer();
            if Pin::new(&mut self.ping_timer).poll(cx).is_pending() {
                break;
            }
        }

        self.conn.enqueue(&ClientFrame::Ping);
        self.pending_pings += 1;
        Ok(())
    }

    fn reset_ping_timer(&mut self) {
        Sleep::reset(self.ping_timer.as_mut(), Instant::now() + self.ping_interval);
    }

    fn receive_commands(&mut self, cx: &mut Context<'_>) -> ReceiveOutcome {
        while self.conn.may_enqueue() {
            debug_assert!(self.recv_buf.is_empty());

            match self
                .commands
                .poll_recv_many(cx, &mut self.recv_buf, COMMAND_RECV_BATCH)
            {
                Poll::Pending => return ReceiveOutcome::Drained,
                Poll::Ready(1..) => {
                    for command in self.recv_buf.drain(..) {
                        match command {
                            Command::Publish { message } => {
                                self.in_flight.push_back(InFlight::Plain);
                                self.conn.enqueue(&ClientFrame::Publish { message });
                            }
                            Command::Request {
                                subject,
                                token,
                                headers,
                                payload,
                                reply,
                            } => {
                                let waiters = ensure_inbox_subscription(
                                    &mut self.inbox,
                                    &mut self.conn,
                                    &mut self.in_flight,
                                );
                                waiters.insert(token.clone(), reply);

                                let reply_subject = Subject::new_unchecked(
                                    format!("{}.{token}", self.inbox.prefix).into(),
                                );
                                self.in_flight.push_back(InFlight::Plain);
                                self.conn.enqueue(&ClientFrame::Publish {
                                    message: Message {
                                        subject,
                                        reply_subject: Some(reply_subject),
                                        headers,
                                        payload,
                                    },
                                });
                            }
                            Command::ForgetRequest { token } => {
                                if let Some(waiters) = &mut self.inbox.waiters {
                                    let _ = waiters.remove(&token);
                                }
                            }
                            Command::Subscribe {
                                sid,
                                subject,
                                queue_group,
                                sink,
                                ack,
                            } => {
                                self.registry.entries.insert(
                                    sid,
                                    SubEntry {
                                        subject: subject.clone(),
                                        queue_group: queue_group.clone(),
                                        sink,
                                        remaining: None,
                                        pending_ack: Some(ack),
                                        rejected: false,
                                    },
                                );
                                self.in_flight.push_back(InFlight::Subscribe { sid });
                                self.conn.enqueue(&ClientFrame::Subscribe {
                                    sid,
                                    subject,
                                    queue_group,
                                });
                            }
                            Command::Unsubscribe {
                                sid,
                                max_messages: Some(max_messages),
                            } => {
                                // Unknown SIDs are ignored: the subscribe may
                                // have been canceled before registration
                                if let Some(entry) = self.registry.entries.get_mut(&sid) {
                                    entry.remaining = Some(max_messages);
                                    self.in_flight.push_back(InFlight::Plain);
                                    self.conn.enqueue(&ClientFrame::Unsubscribe {
                                        sid,
                                        max_messages: Some(max_messages),
                                    });
                                }
                            }
                            Command::Unsubscribe {
                                sid,
                                max_messages: None,
                            } => {
                                if self.registry.entries.remove(&sid).is_some() {
                                    self.in_flight.push_back(InFlight::Plain);
                                    self.conn.enqueue(&ClientFrame::Unsubscribe {
                                        sid,
                                        max_messages: None,
                                    });
                                }
                            }
                            Command::Close(sender) => {
                                self.shutting_down = true;
                                self.awaiting_close.push(sender);
                                self.commands.close();
                            }
                        }
                    }
                }
                Poll::Ready(0) => {
                    // Every sender is gone and the buffer has drained
                    self.shutting_down = true;
                    return ReceiveOutcome::Drained;
                }
            }
        }

        ReceiveOutcome::WriterFull
    }

    #[cold]
    fn sweep(&mut self) {
        self.shared.set_flag(FLAG_SWEEP_DUE, false);
        self.inbox.purge_closed();
        self.registry
            .sweep(&mut self.conn, &mut self.in_flight, &self.events);
    }
}

#[derive(Debug, Copy, Clone)]
enum ReceiveOutcome {
    /// No more commands are queued
    Drained,
    /// The writer has no room for further frames
    WriterFull,
}

impl Future for Handler {
    type Output = HandlerOutput;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        #[derive(Debug, Copy, Clone)]
        enum FlushAction {
            Start,
            Stop,
        }

        let this = self.get_mut();

        if Pin::new(&mut this.ping_timer).poll(cx).is_ready() {
            if let Err(output) = this.ping(cx) {
                return Poll::Ready(output);
            }
        }

        if this.sweep_timer.poll_tick(cx).is_ready() || this.shared.flag(FLAG_SWEEP_DUE) {
            this.sweep();
        }

        let mut handled_frame = false;
        loop {
            match this.conn.poll_read_frame(cx) {
                Poll::Pending => break,
                Poll::Ready(Ok(frame)) => {
                    if let ControlFlow::Break(output) = this.handle_frame(frame) {
                        return Poll::Ready(output);
                    }
                    handled_frame = true;
                }
                Poll::Ready(Err(err)) => {
                    debug!(%err, "read path failed");
                    return Poll::Ready(HandlerOutput::Disconnected);
                }
            }
        }
        if handled_frame {
            // Broker traffic counts as liveness
            this.pending_pings = 0;
            this.reset_ping_timer();
        }

        loop {
            let receive_outcome = this.receive_commands(cx);
            let write_blocked = if this.conn.has_pending_writes() {
                match this.conn.poll_write_next(cx) {
                    Poll::Pending => true,
                    Poll::Ready(Ok(_n)) => false,
                    Poll::Ready(Err(err)) => {
                        debug!(%err, "write path failed");
                        return Poll::Ready(HandlerOutput::Disconnected);
                    }
                }
            } else {
                true
            };

            let flush_action = match (receive_outcome, this.conn.may_flush()) {
                (ReceiveOutcome::Drained, true) => FlushAction::Start,
                (ReceiveOutcome::WriterFull, true) => FlushAction::Start,
                (_, false) => FlushAction::Stop,
            };
            match flush_action {
                FlushAction::Start => {
                    this.flushing = true;
                    if let Some(delayed_flush) = &mut this.delayed_flush {
                        if delayed_flush.delay.is_none() {
                            delayed_flush
                                .delay
                                .set(Some(time::sleep(delayed_flush.interval)));
                        }
                    }
                }
                FlushAction::Stop => {
                    this.flushing = false;
                }
            }

            match (receive_outcome, write_blocked) {
                // No progress can be made on either half
                (ReceiveOutcome::Drained | ReceiveOutcome::WriterFull, true) => break,
                (_, false) => continue,
            }
        }

        if this.flushing {
            let mut can_flush = true;
            if let Some(delayed_flush) = &mut this.delayed_flush {
                if let Some(delay) = delayed_flush.delay.as_mut().as_pin_mut() {
                    if delay.poll(cx).is_ready() {
                        delayed_flush.delay.set(None);
                    } else {
                        can_flush = false;
                    }
                }
            }

            if can_flush {
                match this.conn.poll_flush(cx) {
                    Poll::Pending => {}
                    Poll::Ready(Ok(())) => this.flushing = false,
                    Poll::Ready(Err(err)) => {
                        debug!(%err, "flush failed");
                        return Poll::Ready(HandlerOutput::Disconnected);
                    }
                }
            }
        }

        if this.shutting_down && !this.conn.has_pending_writes() && !this.flushing {
            Poll::Ready(HandlerOutput::Closed)
        } else {
            Poll::Pending
        }
    }
}

impl RecycledHandler {
    pub(crate) fn new(
        commands: mpsc::Receiver<Command>,
        shared: Arc<SharedState>,
        events: broadcast::Sender<ClientEvent>,
        builder: &ClientBuilder,
    ) -> Self {
        let inbox_prefix = Subject::new_unchecked(
            format!("{}.{}", builder.inbox_prefix, random_token()).into(),
        );

        Self {
            commands,
            shared,
            events,
            registry: Registry::default(),
            inbox_prefix,
            awaiting_close: Vec::new(),
        }
    }

    /// Resolve every close waiter; used when the supervisor gives up
    pub(crate) fn close(mut self) {
        self.commands.close();
        for waiter in self.awaiting_close.drain(..) {
            let _ = waiter.send(());
        }
    }
}

impl Registry {
    /// Re-issue `SUB` (and the remaining-message `UNSUB`) for every
    /// live subscription on a fresh connection
    fn replay(&mut self, conn: &mut Conn, in_flight: &mut VecDeque<InFlight>) {
        self.entries.retain(|_sid, entry| !entry.rejected);

        for (&sid, entry) in &self.entries {
            in_flight.push_back(InFlight::Subscribe { sid });
            conn.enqueue(&ClientFrame::Subscribe {
                sid,
                subject: entry.subject.clone(),
                queue_group: entry.queue_group.clone(),
            });

            if let Some(remaining) = entry.remaining {
                in_flight.push_back(InFlight::Plain);
                conn.enqueue(&ClientFrame::Unsubscribe {
                    sid,
                    max_messages: Some(remaining),
                });
            }
        }
    }

    fn deliver(
        &mut self,
        delivery: Delivery,
        conn: &mut Conn,
        in_flight: &mut VecDeque<InFlight>,
        events: &broadcast::Sender<ClientEvent>,
    ) {
        let sid = delivery.sid;
        let Some(entry) = self.entries.get_mut(&sid) else {
            // Deliveries can race an unsubscribe
            return;
        };

        match entry.sink.try_send(Ok(delivery)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(%sid, "subscription buffer full, dropping message");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%sid, "subscription sink dropped, unsubscribing");
                self.entries.remove(&sid);
                in_flight.push_back(InFlight::Plain);
                conn.enqueue(&ClientFrame::Unsubscribe {
                    sid,
                    max_messages: None,
                });
                let _ = events.send(ClientEvent::SubscriptionDropped { sid });
                return;
            }
        }

        if let Some(remaining) = &mut entry.remaining {
            match NonZeroU64::new(remaining.get() - 1) {
                Some(new_remaining) => *remaining = new_remaining,
                None => {
                    // Max-messages reached, the broker already removed
                    // its side
                    self.entries.remove(&sid);
                }
            }
        }
    }

    /// The broker acknowledged the `SUB` for `sid`
    fn confirm(&mut self, sid: Sid) {
        if let Some(entry) = self.entries.get_mut(&sid) {
            if let Some(ack) = entry.pending_ack.take() {
                let _ = ack.send(());
            }
        }
    }

    /// The broker rejected the `SUB` for `sid`
    fn reject(&mut self, sid: Sid, error: ServerError) {
        let Some(mut entry) = self.entries.remove(&sid) else {
            return;
        };

        // Dropping the ack makes the pending `subscribe` call fail
        entry.pending_ack = None;
        match entry.sink.try_send(Err(error)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => {
                // The sink must stay registered so the sweep can issue
                // the unsubscribe once the consumer drains it
                entry.rejected = true;
                self.entries.insert(sid, entry);
            }
        }
    }

    fn sweep(
        &mut self,
        conn: &mut Conn,
        in_flight: &mut VecDeque<InFlight>,
        events: &broadcast::Sender<ClientEvent>,
    ) {
        let dead = self
            .entries
            .iter()
            .filter(|(_sid, entry)| entry.sink.is_closed() || entry.rejected)
            .map(|(&sid, _entry)| sid)
            .collect::<Vec<_>>();

        for sid in dead {
            debug!(%sid, "sweep removing abandoned subscription");
            self.entries.remove(&sid);
            in_flight.push_back(InFlight::Plain);
            conn.enqueue(&ClientFrame::Unsubscribe {
                sid,
                max_messages: None,
            });
            let _ = events.send(ClientEvent::SubscriptionDropped { sid });
        }
    }
}

impl InboxRouter {
    /// Deliver a reply to its waiter, keyed by the final subject token
    fn route(&mut self, delivery: Delivery) {
        let Some(waiters) = &mut self.waiters else {
            return;
        };

        let token = delivery.message.subject.last_token();
        if let Some(waiter) = waiters.remove(token) {
            let _ = waiter.send(delivery);
        }
    }

    fn purge_closed(&mut self) {
        if let Some(waiters) = &mut self.waiters {
            waiters.retain(|_token, waiter| !waiter.is_closed());
        }
    }
}

#[cold]
fn ensure_inbox_subscription<'a>(
    inbox: &'a mut InboxRouter,
    conn: &mut Conn,
    in_flight: &mut VecDeque<InFlight>,
) -> &'a mut BTreeMap<ByteString, oneshot::Sender<Delivery>> {
    if inbox.waiters.is_none() {
        in_flight.push_back(InFlight::Subscribe {
            sid: INBOX_WILDCARD_SID,
        });
        conn.enqueue(&ClientFrame::Subscribe {
            sid: INBOX_WILDCARD_SID,
            subject: Subject::new_unchecked(format!("{}.*", inbox.prefix).into()),
            queue_group: None,
        });
    }

    inbox.waiters.get_or_insert_with(BTreeMap::new)
}

impl SharedState {
    /// State for a client that has not completed its first handshake;
    /// the placeholder `INFO` is replaced before the client is handed
    /// to the caller
    pub(crate) fn disconnected() -> Self {
        Self {
            info: ArcSwap::new(Arc::new(ServerInfo {
                server_id: String::new(),
                server_name: String::new(),
                version: String::new(),
                protocol_version: 0,
                max_payload: 1024 * 1024,
                client_id: None,
                auth_required: false,
                tls_required: false,
                tls_available: false,
                supports_headers: false,
                connect_urls: Vec::new(),
                lame_duck_mode: false,
                supports_jetstream: false,
                nonce: None,
            })),
            flags: AtomicU32::new(0),
        }
    }

    pub(crate) fn server_info(&self) -> Arc<ServerInfo> {
        self.info.load_full()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.flag(FLAG_CONNECTED)
    }

    pub(crate) fn is_lame_duck(&self) -> bool {
        self.flag(FLAG_LAMEDUCK)
    }

    #[cfg(test)]
    pub(crate) fn mark_connected(&self, connected: bool) {
        self.set_flag(FLAG_CONNECTED, connected);
    }

    #[cfg(test)]
    pub(crate) fn store_info(&self, info: ServerInfo) {
        self.info.store(Arc::new(info));
    }

    pub(crate) fn request_sweep(&self) {
        self.set_flag(FLAG_SWEEP_DUE, true);
    }

    fn flag(&self, mask: u32) -> bool {
        self.flags.load(Ordering::Acquire) & mask != 0
    }

    fn set_flag(&self, mask: u32, value: bool) {
        debug_assert_eq!(mask.count_ones(), 1);

        if value {
            self.flags.fetch_or(mask, Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!mask, Ordering::AcqRel);
        }
    }
}

