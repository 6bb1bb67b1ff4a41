//! The connection state machine.
//!
//! A [`Connection`] is a polymorphic endpoint covering both roles. The
//! actual work happens on a dedicated tokio task (the *driver*) which owns
//! the upgraded byte stream wrapped in a [`Framed`] codec: it reassembles
//! fragmented messages, runs the extension pipeline, answers pings, measures
//! heartbeat latency, drives the close handshake and its watchdog, and for
//! clients re-runs the handshake when the reconnect policy schedules a new
//! attempt.
//!
//! Everything per-connection is serialized on that one task: parser,
//! extension streams and writer never overlap. The application talks to the
//! driver through the cloneable [`Connection`] handle (commands in) and the
//! [`Events`] stream (typed [`ConnectionEvent`]s out):
//!
//! ```text
//!  application ── send/close/ping ──▶ ┌────────────┐
//!                                     │   driver   │ ◀──▶ Framed<io, FrameCodec>
//!  application ◀── ConnectionEvent ── └────────────┘
//! ```
//!
//! State transitions follow the RFC lifecycle: `Connecting → Open` after the
//! handshake, `Open → Closing` when either side sends a Close frame, and
//! `Closing → Closed` when the close handshake completes, the socket ends,
//! or the 10-second watchdog fires. Abnormal terminations surface a close
//! event with `was_clean == false` and code 1006/1009/1011 per the error
//! taxonomy; 1006 is never put on the wire.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, SinkExt, StreamExt};
use hyper::Request;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use url::Url;

use crate::{
    close::CloseCode,
    codec::FrameCodec,
    deflate::PermessageDeflate,
    extension::Pipeline,
    frame::{Frame, OpCode},
    handshake::{self, HttpResponse, Negotiated, UpgradedIo},
    options::{Options, CLOSE_TIMEOUT},
    Error, ErrorKind, Result,
};

/// Floor for the heartbeat liveness timeout.
const MIN_LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// The role the endpoint is taking.
///
/// Client frames are masked on the wire, server frames are not.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Lifecycle state of a connection, in the order it is traversed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    /// The handshake has not completed yet (also between reconnect
    /// attempts).
    Connecting = 0,
    /// Messages can flow.
    Open = 1,
    /// A Close frame has been sent or received; draining.
    Closing = 2,
    /// Terminal. All timers are cancelled and resources released.
    Closed = 3,
}

/// How binary message payloads are surfaced.
///
/// Rust has no `Blob` analogue, so every variant currently surfaces
/// [`Bytes`]; the enum exists so configuration written against the wider
/// API keeps working.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BinaryType {
    /// A reference-counted byte buffer (the default).
    #[default]
    Buffer,
    /// A contiguous byte buffer.
    ArrayBuffer,
    /// Falls back to the byte-buffer surface.
    Blob,
}

/// Payload of an application message, text or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    /// A UTF-8 text message (opcode 0x1).
    Text(String),
    /// A binary message (opcode 0x2).
    Binary(Bytes),
}

impl MessagePayload {
    /// Whether this is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, MessagePayload::Binary(_))
    }

    /// The payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            MessagePayload::Text(text) => text.len(),
            MessagePayload::Binary(bytes) => bytes.len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The text content, when this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePayload::Text(text) => Some(text),
            MessagePayload::Binary(_) => None,
        }
    }

    /// The raw bytes of either variant.
    pub fn into_bytes(self) -> Bytes {
        match self {
            MessagePayload::Text(text) => Bytes::from(text),
            MessagePayload::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for MessagePayload {
    fn from(text: String) -> Self {
        MessagePayload::Text(text)
    }
}

impl From<&str> for MessagePayload {
    fn from(text: &str) -> Self {
        MessagePayload::Text(text.to_string())
    }
}

impl From<Bytes> for MessagePayload {
    fn from(bytes: Bytes) -> Self {
        MessagePayload::Binary(bytes)
    }
}

impl From<Vec<u8>> for MessagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        MessagePayload::Binary(bytes.into())
    }
}

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// The close code, 1005 when the peer sent a codeless Close frame.
    pub code: u16,
    /// The close reason, possibly empty.
    pub reason: String,
    /// `true` only when the close handshake completed.
    pub was_clean: bool,
}

/// Typed events delivered on the [`Events`] stream.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The handshake completed; messages can flow.
    Open,
    /// A whole data message arrived. `data.is_binary()` distinguishes text
    /// from binary.
    Message { data: MessagePayload },
    /// A ping arrived (the pong reply has already been queued).
    Ping { data: Bytes },
    /// A pong arrived. `latency` is the round trip of the ping it answers,
    /// when one was outstanding.
    Pong {
        data: Bytes,
        latency: Option<Duration>,
    },
    /// The connection reached `Closed`.
    Close(CloseEvent),
    /// Something went wrong; a close event follows.
    Error { kind: ErrorKind, message: String },
}

/// Receiving half for [`ConnectionEvent`]s, also a [`futures::Stream`].
pub struct Events {
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Events {
    /// Waits for the next event; `None` once the connection is closed and
    /// all buffered events are drained.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

impl futures::Stream for Events {
    type Item = ConnectionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// A transport suitable for a client connection: any established duplex
/// byte stream (TLS, if any, already applied by the caller).
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Socket for T {}

/// A boxed [`Socket`], what a [`RequestFactory`] produces per attempt.
pub type BoxSocket = Box<dyn Socket>;

/// Produces a fresh transport and target URL for each (re)connect attempt.
pub type RequestFactory =
    Box<dyn FnMut() -> BoxFuture<'static, Result<(BoxSocket, Url)>> + Send>;

enum Command {
    Send {
        data: MessagePayload,
        ack: Option<oneshot::Sender<Result<()>>>,
    },
    Ping {
        payload: Bytes,
    },
    Pong {
        payload: Bytes,
    },
    Probe {
        reply: oneshot::Sender<Result<Duration>>,
    },
    Close {
        code: CloseCode,
        reason: String,
    },
}

/// Attributes fixed (or re-fixed per reconnect) by the handshake.
#[derive(Default, Clone)]
struct EndpointInfo {
    url: Option<String>,
    path: String,
    ip: Option<String>,
    port: Option<u16>,
    origin: Option<String>,
    protocol: Option<String>,
    extensions: Option<String>,
}

struct Shared {
    id: u64,
    role: Role,
    binary_type: BinaryType,
    heartbeat_interval: Option<Duration>,
    state: watch::Sender<ReadyState>,
    /// Milliseconds; `u64::MAX` until the first round trip is measured.
    latency_ms: AtomicU64,
    info: Mutex<EndpointInfo>,
    close_event: Mutex<Option<CloseEvent>>,
    /// Set once the connection has been adopted by a registry.
    registered: AtomicBool,
}

impl Shared {
    fn new(role: Role, options: &Options) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (state, _) = watch::channel(ReadyState::Connecting);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            role,
            binary_type: options.binary_type,
            heartbeat_interval: options.heartbeat_interval,
            state,
            latency_ms: AtomicU64::new(u64::MAX),
            info: Mutex::new(EndpointInfo::default()),
            close_event: Mutex::new(None),
            registered: AtomicBool::new(false),
        })
    }

    fn set_state(&self, state: ReadyState) {
        self.state.send_replace(state);
    }

    fn set_info(&self, info: EndpointInfo) {
        *self.info.lock().expect("info lock") = info;
    }

    fn record_close(&self, event: &CloseEvent) {
        *self.close_event.lock().expect("close lock") = Some(event.clone());
    }
}

/// A WebSocket endpoint handle.
///
/// Cloneable and cheap to pass around; all clones talk to the same driver
/// task. Dropping every clone closes the connection with a normal closure.
///
/// Attribute getters ([`ready_state`](Self::ready_state),
/// [`latency`](Self::latency), [`protocol`](Self::protocol), …) read shared
/// state and never block on the driver.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Connection {
    /// Accepts a server-side upgrade request.
    ///
    /// Validates the request and negotiates subprotocol, origin and
    /// extensions. The returned [`HttpResponse`] must be sent back to the
    /// client; the returned [`Accept`] future resolves into the connection
    /// once hyper completes the protocol switch.
    ///
    /// ```no_run
    /// use hyper::{body::Incoming, Request};
    /// use wavesock::{Connection, Options};
    ///
    /// async fn upgrade(mut req: Request<Incoming>) -> wavesock::Result<wavesock::HttpResponse> {
    ///     let (response, accept) = Connection::accept(&mut req, Options::default())?;
    ///     tokio::spawn(async move {
    ///         if let Ok((conn, mut events)) = accept.await {
    ///             while let Some(event) = events.recv().await {
    ///                 let _ = (&conn, event);
    ///             }
    ///         }
    ///     });
    ///     Ok(response)
    /// }
    /// ```
    pub fn accept<B>(request: &mut Request<B>, options: Options) -> Result<(HttpResponse, Accept)> {
        let mut pipeline = build_pipeline(Role::Server, &options);
        let upgrade = handshake::negotiate_server(request, &options, &mut pipeline)?;

        let accept = Accept {
            on_upgrade: upgrade.on_upgrade,
            pending: Some(PendingServer {
                options,
                pipeline,
                negotiated: upgrade.negotiated,
                path: upgrade.path,
                origin: upgrade.origin,
                forwarded_ip: upgrade.forwarded_ip,
            }),
        };

        Ok((upgrade.response, accept))
    }

    /// Connects as a client over an established byte stream.
    ///
    /// Runs the upgrade handshake against `url` and resolves once the
    /// connection is open. Auto-reconnect is not available through this
    /// entry point (there is no way to obtain a fresh transport); use
    /// [`Connection::connect_with`] for that.
    pub async fn connect<S>(io: S, url: Url, options: Options) -> Result<(Connection, Events)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut pipeline = build_pipeline(Role::Client, &options);
        let (stream, negotiated) = handshake::client_handshake(io, &url, &options, &mut pipeline).await?;

        let shared = Shared::new(Role::Client, &options);
        shared.set_info(client_info(&url, &options, &negotiated));

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(Role::Client, stream, pipeline, &options, shared.clone(), events_tx);
        tokio::spawn(async move {
            driver.run(commands_rx).await;
        });

        Ok((
            Connection {
                shared,
                commands: commands_tx,
            },
            Events { rx: events_rx },
        ))
    }

    /// Connects as a client through a request factory, enabling
    /// auto-reconnect.
    ///
    /// The factory is invoked for the initial attempt and for every
    /// reconnect scheduled by [`Options::reconnect`]; each invocation must
    /// yield a fresh transport and target URL. The handle is returned
    /// immediately with the connection in `Connecting`; watch the event
    /// stream for `Open`.
    pub fn connect_with(factory: RequestFactory, options: Options) -> (Connection, Events) {
        let shared = Shared::new(Role::Client, &options);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor_shared = shared.clone();
        tokio::spawn(async move {
            run_client(factory, options, supervisor_shared, events_tx, commands_rx).await;
        });

        (
            Connection {
                shared,
                commands: commands_tx,
            },
            Events { rx: events_rx },
        )
    }

    /// The endpoint's role.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Current lifecycle state.
    pub fn ready_state(&self) -> ReadyState {
        *self.shared.state.borrow()
    }

    /// Whether messages can currently be sent.
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    /// The negotiated subprotocol, empty selection is `None`.
    pub fn protocol(&self) -> Option<String> {
        self.shared.info.lock().expect("info lock").protocol.clone()
    }

    /// The raw negotiated `Sec-WebSocket-Extensions` value, if any.
    pub fn extensions(&self) -> Option<String> {
        self.shared.info.lock().expect("info lock").extensions.clone()
    }

    /// Last measured heartbeat round trip.
    pub fn latency(&self) -> Option<Duration> {
        match self.shared.latency_ms.load(Ordering::Relaxed) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// The connect URL (client role).
    pub fn url(&self) -> Option<String> {
        self.shared.info.lock().expect("info lock").url.clone()
    }

    /// The request path of the upgrade.
    pub fn path(&self) -> String {
        self.shared.info.lock().expect("info lock").path.clone()
    }

    /// Peer IP: the target host for clients, the `x-forwarded-for` address
    /// for servers behind a proxy.
    pub fn ip(&self) -> Option<String> {
        self.shared.info.lock().expect("info lock").ip.clone()
    }

    /// Peer port, when known.
    pub fn port(&self) -> Option<u16> {
        self.shared.info.lock().expect("info lock").port
    }

    /// The request origin (server role) or the origin sent (client role).
    pub fn origin(&self) -> Option<String> {
        self.shared.info.lock().expect("info lock").origin.clone()
    }

    /// How binary payloads are surfaced.
    pub fn binary_type(&self) -> BinaryType {
        self.shared.binary_type
    }

    /// The configured heartbeat interval, `None` when disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.shared.heartbeat_interval
    }

    /// How the connection ended, once it has.
    pub fn close_event(&self) -> Option<CloseEvent> {
        self.shared.close_event.lock().expect("close lock").clone()
    }

    /// Sends a message, resolving once the whole message has been flushed
    /// through the socket. This is the backpressure point: a slow peer
    /// delays the returned future, not the connection task's control
    /// frames.
    pub async fn send(&self, data: impl Into<MessagePayload>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Send {
                data: data.into(),
                ack: Some(ack),
            })
            .map_err(|_| Error::ConnectionClosed)?;
        done.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Sends a text message.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send(MessagePayload::Text(text.into())).await
    }

    /// Sends a binary message.
    pub async fn send_binary(&self, bytes: impl Into<Bytes>) -> Result<()> {
        self.send(MessagePayload::Binary(bytes.into())).await
    }

    /// Enqueues a message without waiting for the flush; failures are
    /// dropped. Used by registry broadcast.
    pub(crate) fn send_detached(&self, data: MessagePayload) {
        let _ = self.commands.send(Command::Send { data, ack: None });
    }

    /// Queues a ping frame. The payload is truncated to 125 bytes.
    pub fn send_ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.commands
            .send(Command::Ping {
                payload: payload.into(),
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Queues an unsolicited pong frame.
    pub fn send_pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.commands
            .send(Command::Pong {
                payload: payload.into(),
            })
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Sends a ping now and resolves with the measured round trip when the
    /// pong arrives.
    pub async fn heartbeat(&self) -> Result<Duration> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Probe { reply })
            .map_err(|_| Error::ConnectionClosed)?;
        done.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Initiates the close handshake. Idempotent: re-entry from either side
    /// is ignored once a close is in flight.
    pub fn close(&self, code: CloseCode, reason: &str) {
        let _ = self.commands.send(Command::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Resolves once the connection reaches `Closed`, with the close event.
    pub async fn closed(&self) -> CloseEvent {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == ReadyState::Closed).await;
        self.close_event().unwrap_or(CloseEvent {
            code: u16::from(CloseCode::Abnormal),
            reason: String::new(),
            was_clean: false,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// Marks registry membership; returns `false` when already registered.
    pub(crate) fn mark_registered(&self) -> bool {
        !self.shared.registered.swap(true, Ordering::Relaxed)
    }

    pub(crate) fn clear_registered(&self) {
        self.shared.registered.store(false, Ordering::Relaxed);
    }
}

/// What a pending server-side connection still needs once hyper yields the
/// upgraded stream.
struct PendingServer {
    options: Options,
    pipeline: Pipeline,
    negotiated: Negotiated,
    path: String,
    origin: Option<String>,
    forwarded_ip: Option<String>,
}

/// Future resolving a server-side upgrade into a live [`Connection`].
///
/// The associated [`HttpResponse`] must be sent to the client before this
/// future can complete.
#[pin_project]
pub struct Accept {
    #[pin]
    on_upgrade: hyper::upgrade::OnUpgrade,
    pending: Option<PendingServer>,
}

impl Future for Accept {
    type Output = Result<(Connection, Events)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let upgraded = ready!(this.on_upgrade.poll(cx))?;
        let pending = this.pending.take().expect("polled after completion");

        let io = hyper_util::rt::TokioIo::new(upgraded);
        let shared = Shared::new(Role::Server, &pending.options);
        shared.set_info(EndpointInfo {
            url: None,
            path: pending.path,
            ip: pending.forwarded_ip,
            port: None,
            origin: pending.origin,
            protocol: pending.negotiated.protocol,
            extensions: pending.negotiated.extensions,
        });

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let driver = Driver::new(
            Role::Server,
            io,
            pending.pipeline,
            &pending.options,
            shared.clone(),
            events_tx,
        );
        tokio::spawn(async move {
            driver.run(commands_rx).await;
        });

        Poll::Ready(Ok((
            Connection {
                shared,
                commands: commands_tx,
            },
            Events { rx: events_rx },
        )))
    }
}

fn build_pipeline(role: Role, options: &Options) -> Pipeline {
    let mut pipeline = Pipeline::new();
    if let Some(deflate) = &options.compression {
        pipeline.push(Box::new(PermessageDeflate::new(role, deflate.clone())));
    }
    pipeline
}

fn client_info(url: &Url, options: &Options, negotiated: &Negotiated) -> EndpointInfo {
    EndpointInfo {
        url: Some(url.to_string()),
        path: url.path().to_string(),
        ip: url.host_str().map(str::to_string),
        port: url.port_or_known_default(),
        origin: options.origin.clone(),
        protocol: negotiated.protocol.clone(),
        extensions: negotiated.extensions.clone(),
    }
}

/// A data message being reassembled from fragments.
struct FragmentState {
    opcode: OpCode,
    compressed: bool,
}

/// How a driver session ended, for the reconnect supervisor.
struct SessionEnd {
    event: CloseEvent,
    /// The application called `close` (or dropped every handle); reconnect
    /// must not resurrect the connection.
    locally_closed: bool,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// The per-connection task state.
struct Driver {
    role: Role,
    framed: Framed<UpgradedIo, FrameCodec>,
    pipeline: Pipeline,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,

    check_utf8: bool,
    max_read_buffer: usize,
    write_chunk: usize,

    fragment: Option<FragmentState>,
    accumulated: BytesMut,

    heartbeat_interval: Option<Duration>,
    next_ping: Option<Instant>,
    ping_sent_at: Option<Instant>,
    liveness_deadline: Option<Instant>,
    probes: Vec<(Instant, oneshot::Sender<Result<Duration>>)>,

    close_sent: bool,
    locally_closed: bool,
    watchdog: Option<Instant>,
    close_event: Option<CloseEvent>,

    commands_open: bool,
    done: bool,
}

impl Driver {
    fn new(
        role: Role,
        io: UpgradedIo,
        pipeline: Pipeline,
        options: &Options,
        shared: Arc<Shared>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let codec = FrameCodec::new(role, options.effective_max_payload());
        Self {
            role,
            framed: Framed::new(io, codec),
            pipeline,
            shared,
            events,
            check_utf8: options.check_utf8,
            max_read_buffer: options.effective_read_buffer(),
            write_chunk: options.effective_write_chunk(),
            fragment: None,
            accumulated: BytesMut::new(),
            heartbeat_interval: options.heartbeat_interval,
            next_ping: None,
            ping_sent_at: None,
            liveness_deadline: None,
            probes: Vec::new(),
            close_sent: false,
            locally_closed: false,
            watchdog: None,
            close_event: None,
            commands_open: true,
            done: false,
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// The liveness window armed when a heartbeat ping goes out.
    fn liveness_timeout(&self) -> Duration {
        match self.heartbeat_interval {
            Some(interval) => (interval * 2).max(MIN_LIVENESS_TIMEOUT),
            None => MIN_LIVENESS_TIMEOUT,
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        [self.next_ping, self.liveness_deadline, self.watchdog]
            .into_iter()
            .flatten()
            .min()
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> SessionEnd {
        self.shared.set_state(ReadyState::Open);
        self.emit(ConnectionEvent::Open);
        if let Some(interval) = self.heartbeat_interval {
            self.next_ping = Some(Instant::now() + interval);
        }

        while !self.done {
            let deadline = self.earliest_deadline();

            tokio::select! {
                biased;

                command = commands.recv(), if self.commands_open => match command {
                    Some(command) => {
                        if let Err(err) = self.on_command(command).await {
                            self.fail(err).await;
                        }
                    }
                    None => {
                        // Every handle is gone; nobody can send or observe
                        // events any more.
                        self.commands_open = false;
                        self.locally_closed = true;
                        if let Err(err) = self.start_close(CloseCode::Normal, "").await {
                            self.fail(err).await;
                        }
                    }
                },

                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(err) = self.on_frame(frame).await {
                            self.fail(err).await;
                        }
                    }
                    Some(Err(err)) => self.fail(err).await,
                    None => self.on_eof(),
                },

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    if let Err(err) = self.on_deadline().await {
                        self.fail(err).await;
                    }
                }
            }
        }

        self.teardown(commands).await
    }

    async fn teardown(mut self, commands: mpsc::UnboundedReceiver<Command>) -> SessionEnd {
        self.pipeline.close();

        let event = self.close_event.take().unwrap_or(CloseEvent {
            code: u16::from(CloseCode::Abnormal),
            reason: String::new(),
            was_clean: false,
        });
        self.shared.record_close(&event);
        self.shared.set_state(ReadyState::Closed);
        self.emit(ConnectionEvent::Close(event.clone()));

        for (_, reply) in self.probes.drain(..) {
            let _ = reply.send(Err(Error::ConnectionClosed));
        }

        // Drain pending writes and half-close the stream; bounded so a
        // stuck peer cannot pin the task.
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.framed.close()).await;

        log::debug!(
            "{} connection closed: code={} clean={}",
            self.role,
            event.code,
            event.was_clean
        );

        SessionEnd {
            event,
            locally_closed: self.locally_closed,
            commands,
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Send { data, ack } => {
                if *self.shared.state.borrow() != ReadyState::Open || self.close_sent {
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(Error::ConnectionClosed));
                    }
                    return Ok(());
                }

                match self.send_message(data).await {
                    Ok(()) => {
                        if let Some(ack) = ack {
                            let _ = ack.send(Ok(()));
                        }
                        Ok(())
                    }
                    Err(err) => {
                        let fatal = classify_send_failure(&err);
                        if let Some(ack) = ack {
                            let _ = ack.send(Err(err));
                        }
                        Err(fatal)
                    }
                }
            }
            Command::Ping { payload } => {
                if self.close_sent {
                    return Ok(());
                }
                self.framed.send(Frame::ping(payload)).await
            }
            Command::Pong { payload } => {
                if self.close_sent {
                    return Ok(());
                }
                self.framed.send(Frame::pong(payload)).await
            }
            Command::Probe { reply } => {
                if *self.shared.state.borrow() != ReadyState::Open || self.close_sent {
                    let _ = reply.send(Err(Error::ConnectionClosed));
                    return Ok(());
                }
                let now = Instant::now();
                self.framed.send(Frame::ping(Bytes::new())).await?;
                self.probes.push((now, reply));
                self.liveness_deadline = Some(now + self.liveness_timeout());
                Ok(())
            }
            Command::Close { code, reason } => {
                self.locally_closed = true;
                self.start_close(code, &reason).await
            }
        }
    }

    /// Serializes one application message: extension pass, chunking into
    /// continuation frames, write and flush. Returning from here is the
    /// send-side backpressure signal.
    async fn send_message(&mut self, data: MessagePayload) -> Result<()> {
        let (opcode, payload) = match data {
            MessagePayload::Text(text) => (OpCode::Text, Bytes::from(text)),
            MessagePayload::Binary(bytes) => (OpCode::Binary, bytes),
        };

        let (payload, compressed) = self.pipeline.process_outgoing_message(opcode, payload)?;

        let total = payload.len();
        if total <= self.write_chunk {
            let frame = Frame::message(opcode, payload, true, compressed);
            let frame = self.pipeline.process_outgoing_frame(frame)?;
            self.framed.feed(frame).await?;
        } else {
            let mut offset = 0;
            let mut first = true;
            while offset < total {
                let end = (offset + self.write_chunk).min(total);
                let chunk = payload.slice(offset..end);
                let fin = end == total;

                let frame = if first {
                    Frame::message(opcode, chunk, fin, compressed)
                } else {
                    Frame::continuation(chunk, fin)
                };
                let frame = self.pipeline.process_outgoing_frame(frame)?;
                self.framed.feed(frame).await?;

                offset = end;
                first = false;
            }
        }

        self.framed.flush().await?;
        Ok(())
    }

    async fn on_frame(&mut self, frame: Frame) -> Result<()> {
        // Any inbound traffic counts as liveness: drop the pending timeout
        // and reschedule the next ping.
        self.liveness_deadline = None;
        if let Some(interval) = self.heartbeat_interval {
            if !self.close_sent {
                self.next_ping = Some(Instant::now() + interval);
            }
        }

        match frame.opcode {
            OpCode::Ping => {
                self.emit(ConnectionEvent::Ping {
                    data: frame.payload.clone(),
                });
                if !self.close_sent {
                    self.framed.send(Frame::pong(frame.payload)).await?;
                }
                Ok(())
            }
            OpCode::Pong => {
                self.on_pong(frame);
                Ok(())
            }
            OpCode::Close => self.on_close_frame(frame).await,
            OpCode::Text | OpCode::Binary => {
                if frame.is_compressed() && !self.pipeline.rsv1() {
                    return Err(Error::CompressionNotSupported);
                }
                if self.close_sent {
                    // Data arriving after we initiated the close handshake
                    // is legal but no longer surfaced.
                    return Ok(());
                }
                if self.fragment.is_some() {
                    return Err(Error::InvalidFragment);
                }

                let frame = self.pipeline.process_incoming_frame(frame)?;
                if frame.fin {
                    self.deliver_message(frame.opcode, frame.payload, frame.compressed)
                } else {
                    self.fragment = Some(FragmentState {
                        opcode: frame.opcode,
                        // RSV1 on the opening frame is the sole compression
                        // signal for the whole message.
                        compressed: frame.compressed,
                    });
                    self.accumulate(&frame.payload)
                }
            }
            OpCode::Continuation => {
                if self.close_sent {
                    return Ok(());
                }
                if self.fragment.is_none() {
                    return Err(Error::InvalidContinuationFrame);
                }

                let frame = self.pipeline.process_incoming_frame(frame)?;
                self.accumulate(&frame.payload)?;

                if frame.fin {
                    let fragment = self.fragment.take().expect("fragment state");
                    let payload = self.accumulated.split().freeze();
                    self.deliver_message(fragment.opcode, payload, fragment.compressed)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn accumulate(&mut self, chunk: &[u8]) -> Result<()> {
        if self.accumulated.len() + chunk.len() > self.max_read_buffer {
            return Err(Error::MessageTooLarge);
        }
        self.accumulated.extend_from_slice(chunk);
        Ok(())
    }

    fn deliver_message(&mut self, opcode: OpCode, payload: Bytes, compressed: bool) -> Result<()> {
        let payload = self.pipeline.process_incoming_message(payload, compressed)?;

        let data = match opcode {
            OpCode::Text => match String::from_utf8(payload.to_vec()) {
                Ok(text) => MessagePayload::Text(text),
                Err(_) if self.check_utf8 => return Err(Error::InvalidUtf8),
                Err(err) => MessagePayload::Text(
                    String::from_utf8_lossy(err.as_bytes()).into_owned(),
                ),
            },
            // Every configured binary type currently surfaces `Bytes`.
            _ => MessagePayload::Binary(payload),
        };

        self.emit(ConnectionEvent::Message { data });
        Ok(())
    }

    fn on_pong(&mut self, frame: Frame) {
        let now = Instant::now();

        let mut latency = self.ping_sent_at.take().map(|sent| now - sent);
        for (sent, reply) in self.probes.drain(..) {
            let rtt = now - sent;
            let _ = reply.send(Ok(rtt));
            latency.get_or_insert(rtt);
        }

        if let Some(latency) = latency {
            self.shared
                .latency_ms
                .store(latency.as_millis() as u64, Ordering::Relaxed);
        }

        self.liveness_deadline = None;
        if let Some(interval) = self.heartbeat_interval {
            if !self.close_sent {
                self.next_ping = Some(now + interval);
            }
        }

        self.emit(ConnectionEvent::Pong {
            data: frame.payload,
            latency,
        });
    }

    async fn on_close_frame(&mut self, frame: Frame) -> Result<()> {
        // Validate the close payload before acting on it.
        let (code, reason) = match frame.payload.len() {
            0 => (u16::from(CloseCode::Status), String::new()),
            1 => return Err(Error::InvalidCloseFrame),
            _ => {
                let code = frame.close_code().expect("close payload length checked");
                if !code.is_allowed() {
                    return Err(Error::InvalidCloseCode);
                }
                let reason = match frame.payload.len() {
                    2 => String::new(),
                    _ => frame
                        .close_reason()
                        .ok_or(Error::InvalidUtf8)?
                        .to_string(),
                };
                (u16::from(code), reason)
            }
        };

        if self.close_sent {
            // Our close is acknowledged; the handshake is complete.
            if let Some(event) = &mut self.close_event {
                event.was_clean = true;
            }
            self.done = true;
            return Ok(());
        }

        // Remote-initiated close: echo and finish. The `Closing` state can
        // be observably elided on fast closes; the close event is what
        // matters.
        self.shared.set_state(ReadyState::Closing);
        self.close_event = Some(CloseEvent {
            code,
            reason,
            was_clean: true,
        });
        self.close_sent = true;

        let echo = Frame::close_raw(frame.payload);
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.framed.send(echo)).await;
        self.done = true;
        Ok(())
    }

    /// Initiates the close handshake from this side. Idempotent.
    async fn start_close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if self.close_sent || self.done {
            return Ok(());
        }

        self.shared.set_state(ReadyState::Closing);
        self.close_event = Some(CloseEvent {
            code: u16::from(code),
            reason: reason.to_string(),
            was_clean: false,
        });

        // 1006 is reported locally, never sent.
        if code == CloseCode::Abnormal {
            self.done = true;
            return Ok(());
        }

        self.close_sent = true;
        let frame = Frame::close(code, reason);
        if tokio::time::timeout(CLOSE_TIMEOUT, self.framed.send(frame))
            .await
            .map_or(true, |sent| sent.is_err())
        {
            // The peer is unreachable; report the requested code but not a
            // clean close.
            self.done = true;
            return Ok(());
        }

        // Keep reading for the acknowledgement, bounded by the watchdog.
        self.watchdog = Some(Instant::now() + CLOSE_TIMEOUT);
        self.next_ping = None;
        self.liveness_deadline = None;
        Ok(())
    }

    /// An error escalates into an `Error` event plus an unclean close with
    /// the taxonomy's code.
    async fn fail(&mut self, err: Error) {
        if self.done {
            return;
        }

        let kind = err.kind();
        let code = err.close_code();
        let message = err.to_string();

        log::debug!("{} connection failed: {message}", self.role);
        self.emit(ConnectionEvent::Error {
            kind,
            message: message.clone(),
        });

        self.shared.set_state(ReadyState::Closing);
        self.close_event = Some(CloseEvent {
            code: u16::from(code),
            reason: message.clone(),
            was_clean: false,
        });

        // Protocol-class failures tell the peer why before the stream goes
        // away; transport failures cannot.
        if code != CloseCode::Abnormal && !self.close_sent {
            self.close_sent = true;
            let frame = Frame::close(code, &message);
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.framed.send(frame)).await;
        }

        self.done = true;
    }

    /// The peer ended the stream.
    fn on_eof(&mut self) {
        if self.close_event.is_none() {
            // No close frame was ever exchanged: abnormal closure.
            self.close_event = Some(CloseEvent {
                code: u16::from(CloseCode::Abnormal),
                reason: String::new(),
                was_clean: false,
            });
        }
        self.done = true;
    }

    async fn on_deadline(&mut self) -> Result<()> {
        let now = Instant::now();

        if self.watchdog.is_some_and(|at| at <= now) {
            // Close handshake never completed; force the transition.
            self.watchdog = None;
            self.done = true;
            return Ok(());
        }

        if self.liveness_deadline.is_some_and(|at| at <= now) {
            self.liveness_deadline = None;
            log::debug!("{} heartbeat timed out", self.role);
            self.locally_closed = false;
            self.close_event = Some(CloseEvent {
                code: u16::from(CloseCode::Abnormal),
                reason: "heartbeat timeout".to_string(),
                was_clean: false,
            });
            self.done = true;
            return Ok(());
        }

        if self.next_ping.is_some_and(|at| at <= now) {
            self.next_ping = None;
            if !self.close_sent {
                self.framed.send(Frame::ping(Bytes::new())).await?;
                self.ping_sent_at = Some(now);
                self.liveness_deadline = Some(now + self.liveness_timeout());
            }
        }

        Ok(())
    }
}

/// Write failures while sending belong to the transport class; the original
/// error goes to the caller, this one drives the state machine.
fn classify_send_failure(err: &Error) -> Error {
    match err.kind() {
        ErrorKind::Extension => Error::Compression(err.to_string()),
        _ => Error::ConnectionClosed,
    }
}

/// The client supervisor: connects, drives, and applies the reconnect
/// policy across sessions.
async fn run_client(
    mut factory: RequestFactory,
    options: Options,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut attempts: u32 = 0;

    loop {
        shared.set_state(ReadyState::Connecting);

        let session = async {
            let (io, url) = factory().await?;
            let mut pipeline = build_pipeline(Role::Client, &options);
            let (stream, negotiated) =
                handshake::client_handshake(io, &url, &options, &mut pipeline).await?;
            Ok::<_, Error>((stream, negotiated, pipeline, url))
        }
        .await;

        let (close_event, locally_closed) = match session {
            Ok((stream, negotiated, pipeline, url)) => {
                shared.set_info(client_info(&url, &options, &negotiated));
                // A successful open resets the attempt counter.
                attempts = 0;

                let driver = Driver::new(
                    Role::Client,
                    stream,
                    pipeline,
                    &options,
                    shared.clone(),
                    events.clone(),
                );
                let end = driver.run(commands).await;
                commands = end.commands;
                (end.event, end.locally_closed)
            }
            Err(err) => {
                let kind = err.kind();
                let message = err.to_string();
                log::debug!("client connect failed: {message}");
                let _ = events.send(ConnectionEvent::Error {
                    kind,
                    message: message.clone(),
                });

                // An extension the server rejected (or answered unusably)
                // surfaces as 1010; everything else is an abnormal 1006.
                let code = match kind {
                    ErrorKind::Extension => CloseCode::Extension,
                    _ => CloseCode::Abnormal,
                };
                let event = CloseEvent {
                    code: u16::from(code),
                    reason: message,
                    was_clean: false,
                };
                shared.record_close(&event);
                shared.set_state(ReadyState::Closed);
                let _ = events.send(ConnectionEvent::Close(event.clone()));
                (event, false)
            }
        };

        if locally_closed {
            return;
        }
        let Some(policy) = options.reconnect.clone() else {
            return;
        };
        if !(policy.should_reconnect)(&close_event) {
            return;
        }
        if !policy.allows_attempt(attempts) {
            log::debug!("reconnect attempts exhausted after {attempts}");
            let _ = events.send(ConnectionEvent::Error {
                kind: ErrorKind::Transport,
                message: Error::ReconnectExhausted.to_string(),
            });
            return;
        }

        let delay = policy.delay_for(attempts);
        attempts += 1;
        log::debug!("reconnect attempt {attempts} in {delay:?}");

        // Sleep, but keep answering the handle: an explicit close (or every
        // handle dropping) cancels the reconnect.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    None | Some(Command::Close { .. }) => return,
                    Some(Command::Send { ack, .. }) => {
                        if let Some(ack) = ack {
                            let _ = ack.send(Err(Error::ConnectionClosed));
                        }
                    }
                    Some(Command::Probe { reply }) => {
                        let _ = reply.send(Err(Error::ConnectionClosed));
                    }
                    Some(Command::Ping { .. }) | Some(Command::Pong { .. }) => {}
                },
            }
        }
    }
}

/// In-memory client/server rigs shared by the crate's integration-style
/// tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;

    /// Serves exactly one upgrade request on `io` and hands the accepted
    /// connection back through the returned receiver.
    pub(crate) fn serve_once(
        io: DuplexStream,
        options: Options,
    ) -> oneshot::Receiver<Result<(Connection, Events)>> {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(StdMutex::new(Some(tx)));

        tokio::spawn(async move {
            let service = service_fn(move |mut req: Request<Incoming>| {
                let options = options.clone();
                let tx = tx.clone();
                async move {
                    let (response, accept) = Connection::accept(&mut req, options)?;
                    tokio::spawn(async move {
                        let result = accept.await;
                        if let Some(tx) = tx.lock().unwrap().take() {
                            let _ = tx.send(result);
                        }
                    });
                    Ok::<_, Error>(response)
                }
            });

            let conn = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(io), service)
                .with_upgrades();
            let _ = conn.await;
        });

        rx
    }

    /// An in-memory client/server pair with both sides fully driven.
    pub(crate) async fn pair(
        server_options: Options,
        client_options: Options,
    ) -> ((Connection, Events), (Connection, Events)) {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let accepted = serve_once(server_io, server_options);

        let client = Connection::connect(
            client_io,
            "ws://localhost/chat".parse().unwrap(),
            client_options,
        )
        .await
        .expect("client handshake");
        let server = accepted.await.expect("accept resolved").expect("server side");

        (client, server)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{pair, serve_once};
    use super::*;
    use crate::deflate::DeflateOptions;
    use hyper::body::Incoming;
    use hyper::header;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use tokio::io::AsyncReadExt;

    async fn next_message(events: &mut Events) -> MessagePayload {
        loop {
            match events.recv().await.expect("event stream ended") {
                ConnectionEvent::Message { data } => return data,
                ConnectionEvent::Open | ConnectionEvent::Ping { .. } | ConnectionEvent::Pong { .. } => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    async fn next_close(events: &mut Events) -> CloseEvent {
        loop {
            match events.recv().await.expect("event stream ended") {
                ConnectionEvent::Close(event) => return event,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn echo_text_roundtrip() {
        let ((client, mut client_events), (server, mut server_events)) =
            pair(Options::default(), Options::default()).await;

        assert!(matches!(
            client_events.recv().await,
            Some(ConnectionEvent::Open)
        ));
        assert!(matches!(
            server_events.recv().await,
            Some(ConnectionEvent::Open)
        ));
        assert_eq!(client.ready_state(), ReadyState::Open);

        client.send_text("hello").await.unwrap();
        let data = next_message(&mut server_events).await;
        assert!(!data.is_binary());
        assert_eq!(data.as_text(), Some("hello"));

        // Echo back.
        server.send(data).await.unwrap();
        let data = next_message(&mut client_events).await;
        assert_eq!(data.as_text(), Some("hello"));

        // Clean close with 1000 on both sides.
        client.close(CloseCode::Normal, "Normal closure.");
        let server_close = next_close(&mut server_events).await;
        assert_eq!(server_close.code, 1000);
        assert_eq!(server_close.reason, "Normal closure.");
        assert!(server_close.was_clean);

        let client_close = next_close(&mut client_events).await;
        assert_eq!(client_close.code, 1000);
        assert!(client_close.was_clean);
        assert_eq!(client.ready_state(), ReadyState::Closed);
        assert_eq!(server.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn binary_roundtrip_is_byte_exact() {
        let ((client, _client_events), (_server, mut server_events)) =
            pair(Options::default(), Options::default()).await;

        let payload: Vec<u8> = (0..4096u32).map(|i| (i * 7) as u8).collect();
        client.send_binary(payload.clone()).await.unwrap();

        let data = next_message(&mut server_events).await;
        assert!(data.is_binary());
        assert_eq!(&data.into_bytes()[..], &payload[..]);
    }

    #[tokio::test]
    async fn large_message_fragments_and_reassembles() {
        // A small write chunk forces the client to fragment; the server
        // must still deliver exactly one message event.
        let client_options = Options::default().with_write_chunk_size(100_000);
        let ((client, _client_events), (_server, mut server_events)) =
            pair(Options::default(), client_options).await;

        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        client.send_binary(payload.clone()).await.unwrap();

        let data = next_message(&mut server_events).await;
        assert!(data.is_binary());
        let bytes = data.into_bytes();
        assert_eq!(bytes.len(), 300_000);
        assert_eq!(&bytes[..], &payload[..]);
    }

    #[tokio::test]
    async fn compression_negotiated_roundtrip() {
        let server_options =
            Options::default().with_compression(DeflateOptions::default());
        let client_options =
            Options::default().with_compression(DeflateOptions::default());
        let ((client, mut client_events), (server, mut server_events)) =
            pair(server_options, client_options).await;

        assert!(client
            .extensions()
            .is_some_and(|ext| ext.contains("permessage-deflate")));
        assert!(server
            .extensions()
            .is_some_and(|ext| ext.contains("permessage-deflate")));

        let text = "a".repeat(10_000);
        client.send_text(text.clone()).await.unwrap();
        let data = next_message(&mut server_events).await;
        assert_eq!(data.as_text(), Some(text.as_str()));

        server.send_text(text.clone()).await.unwrap();
        let data = next_message(&mut client_events).await;
        assert_eq!(data.as_text(), Some(text.as_str()));
    }

    #[tokio::test]
    async fn oversize_decompression_closes_with_1009() {
        // The server caps decompressed messages at 8 bytes.
        let server_options = Options::default()
            .with_compression(DeflateOptions::default().with_max_decompress_size(8));
        let client_options =
            Options::default().with_compression(DeflateOptions::default());
        let ((client, mut client_events), (_server, mut server_events)) =
            pair(server_options, client_options).await;

        client.send_binary(vec![0x42u8; 100]).await.unwrap();

        // Server side reports the extension failure and closes 1009.
        loop {
            match server_events.recv().await.expect("server events") {
                ConnectionEvent::Error { kind, .. } => {
                    assert_eq!(kind, ErrorKind::MessageTooLarge);
                }
                ConnectionEvent::Close(event) => {
                    assert_eq!(event.code, 1009);
                    assert!(!event.was_clean);
                    break;
                }
                _ => {}
            }
        }

        // The client observes the 1009 close frame.
        let close = next_close(&mut client_events).await;
        assert_eq!(close.code, 1009);
    }

    #[tokio::test]
    async fn subprotocol_negotiated_end_to_end() {
        let server_options = Options::default().with_protocols(["chat", "superchat"]);
        let client_options = Options::default().with_protocols(["superchat"]);
        let ((client, _), (server, _)) = pair(server_options, client_options).await;

        assert_eq!(client.protocol().as_deref(), Some("superchat"));
        assert_eq!(server.protocol().as_deref(), Some("superchat"));
    }

    #[tokio::test]
    async fn ping_pong_and_heartbeat_probe() {
        let ((client, mut client_events), (_server, mut server_events)) =
            pair(Options::default(), Options::default()).await;

        client.send_ping(&b"probe"[..]).unwrap();

        // Server surfaces the ping; client gets the echoed pong.
        loop {
            match server_events.recv().await.expect("server events") {
                ConnectionEvent::Ping { data } => {
                    assert_eq!(&data[..], b"probe");
                    break;
                }
                _ => {}
            }
        }
        loop {
            match client_events.recv().await.expect("client events") {
                ConnectionEvent::Pong { data, .. } => {
                    assert_eq!(&data[..], b"probe");
                    break;
                }
                _ => {}
            }
        }

        // An explicit heartbeat resolves with a finite round trip and
        // records it on the connection.
        let rtt = client.heartbeat().await.unwrap();
        assert!(rtt < Duration::from_secs(5));
        assert!(client.latency().is_some());
    }

    #[tokio::test]
    async fn heartbeat_timer_measures_latency() {
        let client_options =
            Options::default().with_heartbeat_interval(Duration::from_millis(20));
        let ((client, mut client_events), _server_side) =
            pair(Options::default(), client_options).await;

        // The timer-driven ping produces a pong event with a latency.
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match client_events.recv().await.expect("client events") {
                    ConnectionEvent::Pong { latency, .. } => {
                        if latency.is_some() {
                            return latency.unwrap();
                        }
                    }
                    _ => {}
                }
            }
        })
        .await;
        let latency = deadline.expect("pong within deadline");
        assert!(latency < Duration::from_secs(5));
        assert!(client.latency().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_closes_abnormally() {
        // A raw peer that completes the handshake but never answers pings.
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        tokio::spawn(async move {
            let service = service_fn(|mut req: Request<Incoming>| async move {
                let key = req
                    .headers()
                    .get(header::SEC_WEBSOCKET_KEY)
                    .unwrap()
                    .clone();
                let on_upgrade = hyper::upgrade::on(&mut req);
                tokio::spawn(async move {
                    if let Ok(upgraded) = on_upgrade.await {
                        // Swallow every frame without replying.
                        let mut io = TokioIo::new(upgraded);
                        let mut sink = [0u8; 1024];
                        while io.read(&mut sink).await.map_or(false, |n| n > 0) {}
                    }
                });
                hyper::Response::builder()
                    .status(hyper::StatusCode::SWITCHING_PROTOCOLS)
                    .header(header::CONNECTION, "Upgrade")
                    .header(header::UPGRADE, "websocket")
                    .header(
                        header::SEC_WEBSOCKET_ACCEPT,
                        handshake::accept_key(key.as_bytes()),
                    )
                    .body(http_body_util::Empty::<Bytes>::new())
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(server_io), service)
                .with_upgrades()
                .await;
        });

        let options = Options::default().with_heartbeat_interval(Duration::from_millis(50));
        let (client, mut events) = Connection::connect(
            client_io,
            "ws://localhost/quiet".parse().unwrap(),
            options,
        )
        .await
        .expect("handshake");

        // The liveness window is max(2 × 50ms, 30s) = 30s; paused time
        // fast-forwards through it.
        let close = tokio::time::timeout(Duration::from_secs(120), next_close(&mut events))
            .await
            .expect("close within liveness window");
        assert_eq!(close.code, 1006);
        assert_eq!(close.reason, "heartbeat timeout");
        assert!(!close.was_clean);
        assert_eq!(client.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn server_initiated_close_reaches_client() {
        let ((_client, mut client_events), (server, mut server_events)) =
            pair(Options::default(), Options::default()).await;

        server.close(CloseCode::Away, "maintenance");

        let client_close = next_close(&mut client_events).await;
        assert_eq!(client_close.code, 1001);
        assert_eq!(client_close.reason, "maintenance");
        assert!(client_close.was_clean);

        let server_close = next_close(&mut server_events).await;
        assert_eq!(server_close.code, 1001);
        assert!(server_close.was_clean);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let ((client, mut client_events), _server_side) =
            pair(Options::default(), Options::default()).await;

        client.close(CloseCode::Normal, "");
        next_close(&mut client_events).await;

        let err = client.send_text("too late").await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn closed_future_resolves_with_event() {
        let ((client, _client_events), (server, _server_events)) =
            pair(Options::default(), Options::default()).await;

        server.close(CloseCode::Normal, "bye");
        let event = client.closed().await;
        assert_eq!(event.code, 1000);
        assert_eq!(event.reason, "bye");
        assert!(event.was_clean);
        assert_eq!(client.close_event(), Some(event));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_server_drop() {
        // Factory that hands out fresh duplex pairs; each server side
        // accepts, then drops the connection after a short delay.
        let dial_count = Arc::new(AtomicU64::new(0));
        let counter = dial_count.clone();

        let factory: RequestFactory = Box::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                let (client_io, server_io) = tokio::io::duplex(16 * 1024);
                let accepted = serve_once(server_io, Options::default());
                tokio::spawn(async move {
                    if let Ok(Ok((server, mut events))) = accepted.await {
                        // Kill the session shortly after it opens.
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        server.close(CloseCode::Error, "going down");
                        while events.recv().await.is_some() {}
                    }
                });
                Ok((Box::new(client_io) as BoxSocket, "ws://localhost/retry".parse().unwrap()))
            })
        });

        let options = Options::default().with_reconnect(
            crate::ReconnectOptions::default()
                .with_base_delay(Duration::from_millis(10))
                .with_backoff(2.0)
                .with_max_delay(Duration::from_millis(100))
                .with_max_attempts(3),
        );

        let (conn, mut events) = Connection::connect_with(factory, options);

        // Observe at least two Opens: the initial connect and a reconnect.
        let mut opens = 0;
        let observed = tokio::time::timeout(Duration::from_secs(60), async {
            while let Some(event) = events.recv().await {
                if matches!(event, ConnectionEvent::Open) {
                    opens += 1;
                    if opens == 3 {
                        break;
                    }
                }
            }
            opens
        })
        .await
        .expect("reconnects within deadline");

        assert!(observed >= 2, "saw {observed} opens");
        assert!(dial_count.load(Ordering::Relaxed) >= 2);

        // Explicit close stops the reconnect loop for good.
        conn.close(CloseCode::Normal, "done");
    }

    #[tokio::test]
    async fn explicit_close_prevents_reconnect() {
        let dial_count = Arc::new(AtomicU64::new(0));
        let counter = dial_count.clone();

        let factory: RequestFactory = Box::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
                let (client_io, server_io) = tokio::io::duplex(16 * 1024);
                let accepted = serve_once(server_io, Options::default());
                tokio::spawn(async move {
                    if let Ok(Ok((_server, mut events))) = accepted.await {
                        while events.recv().await.is_some() {}
                    }
                });
                Ok((Box::new(client_io) as BoxSocket, "ws://localhost/once".parse().unwrap()))
            })
        });

        let options = Options::default()
            .with_reconnect(crate::ReconnectOptions::default().with_base_delay(Duration::from_millis(1)));
        let (conn, mut events) = Connection::connect_with(factory, options);

        // Wait for open, then close deliberately with a non-1000 code; the
        // local origin of the close must still suppress reconnection.
        loop {
            if matches!(events.recv().await, Some(ConnectionEvent::Open)) {
                break;
            }
        }
        conn.close(CloseCode::Away, "shutting down");
        next_close(&mut events).await;

        // Give a would-be reconnect time to happen.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dial_count.load(Ordering::Relaxed), 1);
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn fragmented_send_with_trailing_ping() {
        // A small chunk size fragments the message into four frames; a
        // ping queued right behind it must surface without disturbing
        // reassembly.
        let client_options = Options::default().with_write_chunk_size(8);
        let ((client, _client_events), (_server, mut server_events)) =
            pair(Options::default(), client_options).await;

        client.send_binary(vec![7u8; 32]).await.unwrap();
        client.send_ping(&b"tick"[..]).unwrap();

        let mut saw_ping = false;
        let mut got_message = false;
        while !(saw_ping && got_message) {
            match server_events.recv().await.expect("server events") {
                ConnectionEvent::Ping { data } => {
                    assert_eq!(&data[..], b"tick");
                    saw_ping = true;
                }
                ConnectionEvent::Message { data } => {
                    assert_eq!(data.into_bytes().len(), 32);
                    got_message = true;
                }
                _ => {}
            }
        }
    }
}
