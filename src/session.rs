//! HTTP/2 session dispatcher
//!
//! One [`Session`] per connection. After [`Session::start`] the session
//! runs two long-lived threads:
//!
//! - the **read pump**, sole reader of the transport: decodes frames,
//!   enforces connection-level invariants (preface, first-frame rule, open
//!   header blocks, size limits) and dispatches per frame type, and
//! - the **write pump**, sole writer: drains the outgoing queue, writes
//!   frames serialized, and gates `DATA` through the flow-control windows.
//!
//! Public APIs enqueue frames and are callable from any thread. The
//! SETTINGS-ACK and PING-ACK waiters are one-shot condition variables with
//! fixed timeouts; hitting either timeout disposes the session.

use crate::codec::FrameCodec;
use crate::error::{Error, ErrorCode, Result};
use crate::events::{EventBus, SessionEvent, SubscriptionId};
use crate::flow_control::FlowControlManager;
use crate::frames::*;
use crate::headers::{Header, HeaderCodec, HeaderSequencer, HpackCodec};
use crate::queue::{self, OutgoingQueue, QueueConsumer, QueueItem};
use crate::settings::{Settings, SettingsBuilder};
use crate::stream::StreamRegistry;
use crate::transport::{Shutdown, Transport};
use crate::{
    CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_MAX_CONCURRENT_STREAMS,
    DEFAULT_MAX_FRAME_SIZE, DEFAULT_STREAM_PRIORITY, MAX_PRIORITY,
};
use bytes::Bytes;
use crossbeam_channel::RecvTimeoutError;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long `write_settings` waits for the peer's SETTINGS ACK
pub const SETTINGS_ACK_TIMEOUT: Duration = Duration::from_secs(60);

/// How long `ping` waits for the peer's PING ACK
pub const PING_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Local endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// True for the client role
    pub fn is_client(self) -> bool {
        matches!(self, Role::Client)
    }
}

/// Cooperative cancellation signal shared with both pumps
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, uncancelled token
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One-shot acknowledgement waiter with a timeout
struct AckWaiter {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl AckWaiter {
    fn new() -> Self {
        AckWaiter {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Reset before enqueueing the frame whose ack is awaited
    fn arm(&self) {
        *self.signaled.lock() = false;
    }

    fn signal(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    /// Wait for the signal; returns false on timeout
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

/// Session state shared between the pumps and public callers
struct Shared {
    role: Role,
    secure: bool,
    cancel: CancelToken,
    queue: OutgoingQueue,
    flow: FlowControlManager,
    registry: Mutex<StreamRegistry>,
    sequencer: Mutex<HeaderSequencer>,
    header_codec: Mutex<Option<Box<dyn HeaderCodec>>>,
    events: EventBus,
    /// Promised stream id -> request path
    promised: Mutex<HashMap<u32, String>>,
    settings_ack: AckWaiter,
    ping_ack: AckWaiter,
    ping_counter: AtomicU64,
    local_settings: Mutex<Settings>,
    remote_settings: Mutex<Settings>,
    /// Peer's SETTINGS_MAX_FRAME_SIZE, caps frames we send
    send_max_frame_size: AtomicU32,
    /// Our SETTINGS_MAX_FRAME_SIZE, enforced on inbound frames
    recv_max_frame_size: AtomicU32,
    started: AtomicBool,
    settings_received: AtomicBool,
    response_received: AtomicBool,
    first_window_update_sent: AtomicBool,
    goaway_received: AtomicBool,
    goaway_sent: AtomicBool,
    disposed: AtomicBool,
    /// Set when the write pump died on an I/O error; `close` then skips the
    /// confirmed-drain step
    write_dead: AtomicBool,
    shutdown: Mutex<Option<Shutdown>>,
}

/// An HTTP/2 session over a duplex transport
pub struct Session<T: Transport> {
    shared: Arc<Shared>,
    transport: Mutex<Option<T>>,
    consumer: Mutex<Option<QueueConsumer>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> Session<T> {
    /// Create a session around a transport
    ///
    /// The session takes exclusive ownership of the transport; nothing is
    /// read or written until [`start`](Session::start).
    pub fn new(transport: T, role: Role, secure: bool, cancel: CancelToken) -> Self {
        let local_settings = SettingsBuilder::new()
            .header_table_size(DEFAULT_HEADER_TABLE_SIZE)
            .enable_push(true)
            .max_concurrent_streams(DEFAULT_MAX_CONCURRENT_STREAMS)
            .initial_window_size(crate::DEFAULT_INITIAL_WINDOW_SIZE)
            .max_frame_size(DEFAULT_MAX_FRAME_SIZE)
            .build()
            .expect("default settings are valid");

        let mut registry = StreamRegistry::new(role.is_client(), DEFAULT_STREAM_PRIORITY);
        registry.set_local_max_concurrent(Some(DEFAULT_MAX_CONCURRENT_STREAMS));

        let (outgoing, consumer) = queue::channel();

        Session {
            shared: Arc::new(Shared {
                role,
                secure,
                cancel,
                queue: outgoing,
                flow: FlowControlManager::new(),
                registry: Mutex::new(registry),
                sequencer: Mutex::new(HeaderSequencer::new()),
                header_codec: Mutex::new(Some(Box::new(HpackCodec::new()))),
                events: EventBus::new(),
                promised: Mutex::new(HashMap::new()),
                settings_ack: AckWaiter::new(),
                ping_ack: AckWaiter::new(),
                ping_counter: AtomicU64::new(1),
                local_settings: Mutex::new(local_settings),
                remote_settings: Mutex::new(Settings::default_settings()),
                send_max_frame_size: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
                recv_max_frame_size: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
                started: AtomicBool::new(false),
                settings_received: AtomicBool::new(false),
                response_received: AtomicBool::new(false),
                first_window_update_sent: AtomicBool::new(false),
                goaway_received: AtomicBool::new(false),
                goaway_sent: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                write_dead: AtomicBool::new(false),
                shutdown: Mutex::new(None),
            }),
            transport: Mutex::new(Some(transport)),
            consumer: Mutex::new(Some(consumer)),
            pumps: Mutex::new(Vec::new()),
        }
    }

    /// Replace the header compression codec before the session starts
    pub fn set_header_codec(&self, codec: Box<dyn HeaderCodec>) -> Result<()> {
        if self.shared.started.load(Ordering::Acquire) {
            return Err(Error::InvalidArgument(
                "header codec cannot change after start".to_string(),
            ));
        }
        *self.shared.header_codec.lock() = Some(codec);
        Ok(())
    }

    /// Start the session: spawn both pumps and perform connection setup
    ///
    /// `initial_request` is the upgraded HTTP/1.1 request for the unsecure
    /// upgrade hand-off; it materialises stream 1 half-closed on the
    /// appropriate side. A missing `:path` defaults to `/`.
    pub fn start(&self, initial_request: Option<Vec<Header>>) -> Result<()> {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidArgument(
                "session already started".to_string(),
            ));
        }

        let transport = self
            .transport
            .lock()
            .take()
            .ok_or(Error::NotReady)?;
        let consumer = self
            .consumer
            .lock()
            .take()
            .ok_or(Error::NotReady)?;

        let (reader, writer, shutdown) = transport.split()?;
        *self.shared.shutdown.lock() = Some(shutdown);

        if let Some(request) = initial_request {
            if self.shared.secure {
                return Err(Error::InvalidArgument(
                    "upgrade request supplied on a secure transport".to_string(),
                ));
            }
            self.install_upgrade_request(request);
        }

        // The client's first outbound frame is its SETTINGS
        if self.shared.role.is_client() {
            let frame = SettingsFrame::new(self.shared.local_settings.lock().clone());
            self.shared
                .events
                .emit(&SessionEvent::SettingsSent(frame.clone()));
            self.shared.queue.enqueue(Frame::Settings(frame));
        }

        let send_preface = self.shared.role.is_client();
        let write_shared = self.shared.clone();
        let write_pump = thread::Builder::new()
            .name("h2-write".to_string())
            .spawn(move || run_write_pump(write_shared, writer, consumer, send_preface))?;

        let read_shared = self.shared.clone();
        let read_pump = thread::Builder::new()
            .name("h2-read".to_string())
            .spawn(move || run_read_pump(read_shared, reader))?;

        self.pumps.lock().extend([write_pump, read_pump]);
        Ok(())
    }

    fn install_upgrade_request(&self, mut request: Vec<Header>) {
        if !request.iter().any(|(name, _)| name == b":path") {
            request.push((b":path".to_vec(), b"/".to_vec()));
        }

        let mut registry = self.shared.registry.lock();
        let stream = registry.install_upgrade_stream();
        stream.set_headers(request);
        stream.record_frame_sent();
        drop(registry);

        self.shared.flow.register_stream(1);
        debug!("upgrade hand-off: stream 1 installed");

        if self.shared.role.is_client() {
            self.shared
                .events
                .emit(&SessionEvent::RequestSent { stream_id: 1 });
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.shared.started.load(Ordering::Acquire) {
            return Err(Error::NotReady);
        }
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    /// Send a request on a new stream; client only
    ///
    /// Returns the stream id carrying the request. A `:path` matching an
    /// outstanding server promise is rejected without emitting any frame.
    pub fn send_request(
        &self,
        headers: Vec<Header>,
        priority: u32,
        end_stream: bool,
    ) -> Result<u32> {
        self.ensure_running()?;

        if !self.shared.role.is_client() {
            return Err(Error::InvalidArgument(
                "send_request is client-only".to_string(),
            ));
        }
        if headers.is_empty() {
            return Err(Error::InvalidArgument(
                "request headers must not be empty".to_string(),
            ));
        }
        if priority > MAX_PRIORITY {
            return Err(Error::InvalidArgument(format!(
                "priority {} out of range 0..={}",
                priority, MAX_PRIORITY
            )));
        }
        if self.shared.goaway_received.load(Ordering::Acquire) {
            return Err(Error::GoawayReceived);
        }

        if let Some(path) = header_value(&headers, b":path") {
            let promised = self.shared.promised.lock();
            if promised.values().any(|p| p.as_bytes() == path) {
                return Err(Error::ResourcePromised(
                    String::from_utf8_lossy(path).into_owned(),
                ));
            }
        }

        let block = {
            let mut codec = self.shared.header_codec.lock();
            codec
                .as_mut()
                .ok_or(Error::SessionClosed)?
                .encode(&headers)?
        };

        let max = self.shared.send_max_frame_size.load(Ordering::Relaxed) as usize;
        let frames = build_header_frames(0, block, end_stream, max);

        let mut registry = self.shared.registry.lock();
        let stream_id = registry.create_outbound(priority)?;
        let stream = registry.get_mut(stream_id).expect("stream just created");
        stream.send_headers(end_stream)?;
        stream.set_headers(headers);
        for _ in &frames {
            stream.record_frame_sent();
        }
        drop(registry);

        self.shared.flow.register_stream(stream_id);

        // Stream id was unknown while splitting; stamp it now
        let frames = restamp_stream_id(frames, stream_id);

        {
            let mut sequencer = self.shared.sequencer.lock();
            for frame in &frames {
                match frame {
                    Frame::Headers(f) => {
                        sequencer.record_sent(stream_id, &f.fragment, f.end_headers)
                    }
                    Frame::Continuation(f) => {
                        sequencer.record_sent(stream_id, &f.fragment, f.end_headers)
                    }
                    _ => {}
                }
            }
        }

        self.shared.queue.enqueue_block(frames);
        self.shared
            .events
            .emit(&SessionEvent::RequestSent { stream_id });

        trace!(stream = stream_id, "request enqueued");
        Ok(stream_id)
    }

    /// Enqueue DATA on an open stream
    ///
    /// The payload is chunked to the peer's maximum frame size; the write
    /// pump additionally gates each chunk through flow control.
    pub fn send_data(&self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<()> {
        self.ensure_running()?;

        let max = self.shared.send_max_frame_size.load(Ordering::Relaxed) as usize;
        let chunks = chunk_data(data, max);

        let mut registry = self.shared.registry.lock();
        let stream = registry
            .get_mut(stream_id)
            .ok_or(Error::StreamClosed(stream_id))?;
        stream.send_data(end_stream)?;
        for _ in &chunks {
            stream.record_frame_sent();
        }
        drop(registry);

        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let fin = end_stream && i == last;
            self.shared
                .queue
                .enqueue(Frame::Data(DataFrame::new(stream_id, chunk, fin)));
        }
        Ok(())
    }

    /// Write a SETTINGS frame
    ///
    /// Non-ACK settings block the caller until the peer acknowledges, up
    /// to [`SETTINGS_ACK_TIMEOUT`]; a timeout sends
    /// `GOAWAY(SETTINGS_TIMEOUT)` and disposes the session.
    pub fn write_settings(&self, settings: Settings, ack: bool) -> Result<()> {
        self.ensure_running()?;

        let frame = if ack {
            SettingsFrame::ack()
        } else {
            settings.validate()?;

            if let Some(size) = settings.max_frame_size {
                self.shared
                    .recv_max_frame_size
                    .store(size, Ordering::Relaxed);
            }
            if let Some(max) = settings.max_concurrent_streams {
                self.shared
                    .registry
                    .lock()
                    .set_local_max_concurrent(Some(max));
            }
            self.shared.local_settings.lock().merge(&settings);

            SettingsFrame::new(settings)
        };

        self.shared
            .events
            .emit(&SessionEvent::SettingsSent(frame.clone()));

        if !ack {
            self.shared.settings_ack.arm();
        }
        let is_ack = frame.ack;
        self.shared.queue.enqueue(Frame::Settings(frame));

        if !is_ack && !self.shared.settings_ack.wait(SETTINGS_ACK_TIMEOUT) {
            warn!("SETTINGS not acknowledged in time");
            self.shared.close(ErrorCode::SettingsTimeout);
            return Err(Error::SettingsTimeout);
        }
        Ok(())
    }

    /// Send a PING and measure the round trip
    ///
    /// Blocks up to [`PING_ACK_TIMEOUT`]; a timeout disposes the session.
    pub fn ping(&self) -> Result<Duration> {
        self.ensure_running()?;

        let data = self
            .shared
            .ping_counter
            .fetch_add(1, Ordering::Relaxed)
            .to_be_bytes();

        self.shared.ping_ack.arm();
        let start = Instant::now();
        self.shared.queue.enqueue(Frame::Ping(PingFrame::new(data)));

        if !self.shared.ping_ack.wait(PING_ACK_TIMEOUT) {
            warn!("PING not acknowledged in time");
            self.shared.close(ErrorCode::NoError);
            return Err(Error::Timeout);
        }
        Ok(start.elapsed())
    }

    /// Announce session termination to the peer
    pub fn write_goaway(&self, code: ErrorCode) -> Result<()> {
        self.ensure_running()?;

        let last = self.shared.registry.lock().last_peer_id();
        self.shared.goaway_sent.store(true, Ordering::Release);
        self.shared
            .queue
            .enqueue(Frame::Goaway(GoawayFrame::new(last, code, Bytes::new())));
        Ok(())
    }

    /// Grant the peer `increment` bytes of connection-level receive credit
    pub fn write_connection_window_update(&self, increment: u32) -> Result<()> {
        self.write_window_update(crate::CONNECTION_STREAM_ID, increment)
    }

    /// Grant the peer receive credit on a stream (0 for the connection)
    pub fn write_window_update(&self, stream_id: u32, increment: u32) -> Result<()> {
        self.ensure_running()?;

        if increment == 0 || increment > 0x7FFF_FFFF {
            return Err(Error::InvalidArgument(format!(
                "window increment {} out of range",
                increment
            )));
        }

        if stream_id == crate::CONNECTION_STREAM_ID {
            self.shared.flow.replenish_connection_recv(increment)?;
            self.shared
                .first_window_update_sent
                .store(true, Ordering::Release);
        } else {
            self.shared.flow.replenish_stream_recv(stream_id, increment)?;
        }

        self.shared
            .queue
            .enqueue(Frame::WindowUpdate(WindowUpdateFrame::new(
                stream_id, increment,
            )));
        Ok(())
    }

    /// Register an event subscriber
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(callback)
    }

    /// Remove an event subscriber
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.shared.events.unsubscribe(id);
    }

    /// Close the session; idempotent
    pub fn close(&self, code: ErrorCode) {
        self.shared.close(code);
    }

    /// Wait for both pumps to exit
    pub fn join(&self) {
        let pumps: Vec<_> = self.pumps.lock().drain(..).collect();
        for pump in pumps {
            let _ = pump.join();
        }
    }

    /// Whether the session was disposed
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Local endpoint role
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Whether the peer's SETTINGS frame has arrived
    pub fn settings_received(&self) -> bool {
        self.shared.settings_received.load(Ordering::Acquire)
    }

    /// Whether a response header block has arrived (client role)
    pub fn response_received(&self) -> bool {
        self.shared.response_received.load(Ordering::Acquire)
    }

    /// Whether a GOAWAY frame has arrived
    pub fn goaway_received(&self) -> bool {
        self.shared.goaway_received.load(Ordering::Acquire)
    }

    /// Paths currently promised by the server, by promised stream id
    pub fn promised_paths(&self) -> Vec<(u32, String)> {
        let promised = self.shared.promised.lock();
        let mut paths: Vec<_> = promised.iter().map(|(k, v)| (*k, v.clone())).collect();
        paths.sort_unstable();
        paths
    }

    /// State of a stream, if it is registered
    pub fn stream_state(&self, stream_id: u32) -> Option<crate::stream::StreamState> {
        self.shared.registry.lock().get(stream_id).map(|s| s.state())
    }

    /// Decoded headers attached to a stream
    pub fn stream_headers(&self, stream_id: u32) -> Option<Vec<Header>> {
        self.shared
            .registry
            .lock()
            .get(stream_id)
            .map(|s| s.headers().to_vec())
    }

    /// Body bytes accumulated on a stream
    pub fn stream_body(&self, stream_id: u32) -> Option<Vec<u8>> {
        self.shared
            .registry
            .lock()
            .get(stream_id)
            .map(|s| s.body().to_vec())
    }

    /// Priority currently assigned to a stream
    pub fn stream_priority(&self, stream_id: u32) -> Option<u32> {
        self.shared
            .registry
            .lock()
            .get(stream_id)
            .map(|s| s.priority())
    }

    /// Highest locally initiated stream id (0 if none)
    pub fn last_local_stream_id(&self) -> u32 {
        self.shared.registry.lock().last_local_id()
    }

    /// Header blocks sent on a stream, the mirror of the received side
    pub fn sent_header_blocks(&self, stream_id: u32) -> Vec<Bytes> {
        self.shared
            .sequencer
            .lock()
            .sent_blocks(stream_id)
            .to_vec()
    }
}

impl Shared {
    /// Orderly shutdown; every exit path funnels through here exactly once
    fn close(&self, code: ErrorCode) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(code = %code, "closing session");

        self.registry.lock().close_all();

        // A received (or suppressed) GOAWAY means ours stays unsent
        if !self.goaway_received.load(Ordering::Acquire)
            && !self.goaway_sent.swap(true, Ordering::AcqRel)
        {
            let last = self.registry.lock().last_peer_id();
            self.queue
                .enqueue(Frame::Goaway(GoawayFrame::new(last, code, Bytes::new())));
        }

        // Confirmed drain of the outgoing queue before the transport goes away
        if !self.write_dead.load(Ordering::Acquire) {
            self.queue.flush(Duration::from_secs(1));
        }
        self.queue.dispose();
        self.cancel.cancel();

        *self.header_codec.lock() = None;
        self.sequencer.lock().clear();
        self.promised.lock().clear();

        if let Some(shutdown) = self.shutdown.lock().take() {
            shutdown.shutdown();
        }

        self.events.emit(&SessionEvent::SessionDisposed);
        self.events.clear();
    }

    /// Reply to a stream error with at most one RST_STREAM
    fn reset_stream(&self, stream_id: u32, code: ErrorCode) {
        let mut registry = self.registry.lock();
        let stream = registry.lookup_or_synthesize(stream_id);
        let first = stream.mark_rst_sent();
        stream.close();
        drop(registry);

        self.flow.forget_stream(stream_id);
        self.promised.lock().remove(&stream_id);

        if first {
            debug!(stream = stream_id, code = %code, "resetting stream");
            self.queue.enqueue(Frame::RstStream(RstStreamFrame {
                stream_id,
                error_code: code,
            }));
        }
    }

    /// Dispatch one inbound frame
    fn handle_frame(&self, frame: Frame) -> Result<()> {
        // On a secure connection nothing may precede the peer's SETTINGS
        if self.secure
            && !self.settings_received.load(Ordering::Acquire)
            && !matches!(frame, Frame::Settings(_))
        {
            return Err(Error::Protocol(format!(
                "{} received before peer SETTINGS",
                frame.type_name()
            )));
        }

        // While a header block is open, only its CONTINUATION may arrive
        if let Some(open_id) = self.sequencer.lock().open_stream_id() {
            let legal = matches!(&frame, Frame::Continuation(c) if c.stream_id == open_id);
            if !legal {
                return Err(Error::Protocol(format!(
                    "{} interleaved into the header block open on stream {}",
                    frame.type_name(),
                    open_id
                )));
            }
        }

        let event_stream_id = frame.stream_id();
        let event = SessionEvent::FrameReceived {
            stream_id: event_stream_id,
            frame: frame.clone(),
        };

        match frame {
            Frame::Settings(f) => self.on_settings(f)?,
            Frame::Headers(f) => self.on_headers(f)?,
            Frame::Continuation(f) => self.on_continuation(f)?,
            Frame::Data(f) => self.on_data(f)?,
            Frame::Priority(f) => self.on_priority(f)?,
            Frame::RstStream(f) => self.on_rst_stream(f)?,
            Frame::Ping(f) => self.on_ping(f)?,
            Frame::WindowUpdate(f) => self.on_window_update(f)?,
            Frame::PushPromise(f) => self.on_push_promise(f)?,
            Frame::Goaway(f) => self.on_goaway(f),
            Frame::Unknown(f) => {
                trace!(frame_type = f.frame_type, "discarding unknown frame");
            }
        }

        if event_stream_id != 0 {
            if let Some(stream) = self.registry.lock().get_mut(event_stream_id) {
                stream.record_frame_received();
            }
        }
        self.events.emit(&event);
        Ok(())
    }

    fn on_settings(&self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            trace!("SETTINGS ACK received");
            self.settings_received.store(true, Ordering::Release);
            self.settings_ack.signal();
            return Ok(());
        }

        frame.settings.validate()?;

        if let Some(size) = frame.settings.initial_window_size {
            self.flow.set_initial_send_window(size)?;
        }
        if let Some(max) = frame.settings.max_concurrent_streams {
            self.registry.lock().set_remote_max_concurrent(Some(max));
        }
        if let Some(size) = frame.settings.header_table_size {
            if let Some(codec) = self.header_codec.lock().as_mut() {
                codec.set_max_table_size(size);
            }
        }
        if let Some(size) = frame.settings.max_frame_size {
            self.send_max_frame_size.store(size, Ordering::Relaxed);
        }
        self.remote_settings.lock().merge(&frame.settings);

        // Observable only once the parameters are in effect
        self.settings_received.store(true, Ordering::Release);
        debug!("peer SETTINGS applied");

        let ack = SettingsFrame::ack();
        self.events.emit(&SessionEvent::SettingsSent(ack.clone()));
        self.queue.enqueue(Frame::Settings(ack));
        Ok(())
    }

    fn on_headers(&self, frame: HeadersFrame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("HEADERS on stream 0".to_string()));
        }

        let completed = self.sequencer.lock().begin(
            frame.stream_id,
            None,
            frame.fragment,
            frame.end_stream,
            frame.end_headers,
            frame.priority,
        )?;

        if let Some(block) = completed {
            self.finish_inbound_block(block)?;
        }
        Ok(())
    }

    fn on_continuation(&self, frame: ContinuationFrame) -> Result<()> {
        let completed =
            self.sequencer
                .lock()
                .append(frame.stream_id, frame.fragment, frame.end_headers)?;

        if let Some(block) = completed {
            self.finish_inbound_block(block)?;
        }
        Ok(())
    }

    /// A header block closed; decode it and resolve the stream
    fn finish_inbound_block(&self, block: crate::headers::CompletedBlock) -> Result<()> {
        let headers = {
            let mut codec = self.header_codec.lock();
            codec
                .as_mut()
                .ok_or(Error::SessionClosed)?
                .decode(&block.block)?
        };

        // A completed PUSH_PROMISE block records the promised path
        if let Some(promised_id) = block.promised_id {
            let path = header_value(&headers, b":path")
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_else(|| "/".to_string());
            debug!(promised = promised_id, path = %path, "resource promised");
            self.promised.lock().insert(promised_id, path);

            if let Some(stream) = self.registry.lock().get_mut(promised_id) {
                stream.set_headers(headers);
            }
            return Ok(());
        }

        let local_parity = if self.role.is_client() { 1 } else { 0 };
        let mut registry = self.registry.lock();

        let stream = if block.stream_id % 2 == local_parity {
            // Headers on a stream we initiated (a response or trailers)
            match registry.get_mut(block.stream_id) {
                Some(stream) => stream,
                None => return Err(Error::StreamClosed(block.stream_id)),
            }
        } else if registry.get(block.stream_id).is_some() {
            // Continuing a known peer stream (e.g. a promised stream's HEADERS)
            registry.get_mut(block.stream_id).expect("checked above")
        } else {
            registry.create_inbound(block.stream_id)?;
            self.flow.register_stream(block.stream_id);
            registry
                .get_mut(block.stream_id)
                .ok_or(Error::StreamClosed(block.stream_id))?
        };

        stream.receive_headers(block.end_stream)?;
        stream.set_headers(headers);
        if let Some(priority) = block.priority {
            stream.set_priority(priority.weight as u32);
        }
        let closed = stream.state().is_closed();
        drop(registry);

        if self.role.is_client() && block.stream_id % 2 == local_parity {
            self.response_received.store(true, Ordering::Release);
        }
        if closed {
            self.flow.forget_stream(block.stream_id);
            self.promised.lock().remove(&block.stream_id);
        }
        Ok(())
    }

    fn on_data(&self, frame: DataFrame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("DATA on stream 0".to_string()));
        }

        let mut registry = self.registry.lock();
        let stream = registry.lookup_or_synthesize(frame.stream_id);
        if stream.state().is_closed() {
            return Err(Error::StreamClosed(frame.stream_id));
        }

        self.flow.debit_recv(frame.stream_id, frame.data.len());

        stream.receive_data(frame.end_stream)?;
        stream.push_body(&frame.data);
        let closed = stream.state().is_closed();
        drop(registry);

        if frame.end_stream {
            self.promised.lock().remove(&frame.stream_id);
        }
        if closed {
            self.flow.forget_stream(frame.stream_id);
        }
        Ok(())
    }

    fn on_priority(&self, frame: PriorityFrame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("PRIORITY on stream 0".to_string()));
        }
        // Legal in any state, closed included
        self.registry
            .lock()
            .lookup_or_synthesize(frame.stream_id)
            .set_priority(frame.priority.weight as u32);
        Ok(())
    }

    fn on_rst_stream(&self, frame: RstStreamFrame) -> Result<()> {
        if frame.stream_id == 0 {
            return Err(Error::Protocol("RST_STREAM on stream 0".to_string()));
        }
        debug!(stream = frame.stream_id, code = %frame.error_code, "stream reset by peer");

        // Never reply to RST_STREAM with RST_STREAM
        self.registry.lock().close_stream(frame.stream_id);
        self.flow.forget_stream(frame.stream_id);
        self.promised.lock().remove(&frame.stream_id);
        Ok(())
    }

    fn on_ping(&self, frame: PingFrame) -> Result<()> {
        if frame.ack {
            trace!("PING ACK received");
            self.ping_ack.signal();
            return Ok(());
        }
        self.queue.enqueue(Frame::Ping(PingFrame::ack(frame.data)));
        Ok(())
    }

    fn on_window_update(&self, frame: WindowUpdateFrame) -> Result<()> {
        if frame.stream_id == crate::CONNECTION_STREAM_ID {
            self.flow.credit_connection(frame.size_increment)?;
        } else {
            self.flow
                .credit_stream(frame.stream_id, frame.size_increment)?;
        }
        // Fresh credit may unpark gated DATA
        self.queue.poke();
        Ok(())
    }

    fn on_push_promise(&self, frame: PushPromiseFrame) -> Result<()> {
        if !self.role.is_client() {
            return Err(Error::Protocol(
                "PUSH_PROMISE received by server".to_string(),
            ));
        }
        if !self.local_settings.lock().get_enable_push() {
            return Err(Error::Protocol(
                "PUSH_PROMISE received with push disabled".to_string(),
            ));
        }
        if frame.stream_id == 0 {
            return Err(Error::Protocol("PUSH_PROMISE on stream 0".to_string()));
        }

        self.registry.lock().create_reserved(frame.promised_stream_id)?;
        self.flow.register_stream(frame.promised_stream_id);

        let completed = self.sequencer.lock().begin(
            frame.stream_id,
            Some(frame.promised_stream_id),
            frame.fragment,
            false,
            frame.end_headers,
            None,
        )?;

        if let Some(block) = completed {
            self.finish_inbound_block(block)?;
        }
        Ok(())
    }

    fn on_goaway(&self, frame: GoawayFrame) {
        debug!(
            last_stream = frame.last_stream_id,
            code = %frame.error_code,
            "GOAWAY received"
        );
        self.goaway_received.store(true, Ordering::Release);
        // Streams above the peer's high-water mark were never processed
        self.registry.lock().prune_after_goaway(frame.last_stream_id);
    }
}

/// Read pump: sole reader of the transport
fn run_read_pump<R: Read>(shared: Arc<Shared>, mut reader: R) {
    if shared.role == Role::Server {
        let mut preface = [0u8; 24];
        let ok = reader.read_exact(&mut preface).is_ok() && preface[..] == *CONNECTION_PREFACE;
        if !ok {
            debug!("connection preface mismatch");
            // The connection never spoke HTTP/2; suppress the GOAWAY
            shared.goaway_received.store(true, Ordering::Release);
            shared.close(ErrorCode::ProtocolError);
            return;
        }
        trace!("connection preface verified");

        // Reply with our own SETTINGS
        let frame = SettingsFrame::new(shared.local_settings.lock().clone());
        shared
            .events
            .emit(&SessionEvent::SettingsSent(frame.clone()));
        shared.queue.enqueue(Frame::Settings(frame));
    }

    loop {
        if shared.cancel.is_cancelled() || shared.disposed.load(Ordering::Acquire) {
            break;
        }

        let max = shared.recv_max_frame_size.load(Ordering::Relaxed);
        let frame = match FrameCodec::read_frame(&mut reader, max) {
            Ok(frame) => frame,
            Err(Error::Io(e)) => {
                // Connection presumed lost; dispose without a GOAWAY
                if !shared.disposed.load(Ordering::Acquire) {
                    debug!(error = %e, "read pump I/O error");
                }
                shared.goaway_received.store(true, Ordering::Release);
                shared.close(ErrorCode::NoError);
                break;
            }
            Err(e) => {
                debug!(error = %e, "malformed frame");
                shared.close(e.connection_code());
                break;
            }
        };

        trace!(
            frame = frame.type_name(),
            stream = frame.stream_id(),
            "frame received"
        );

        match shared.handle_frame(frame) {
            Ok(()) => {}
            Err(e) => match e.stream_scope() {
                Some((stream_id, code)) => shared.reset_stream(stream_id, code),
                None => {
                    debug!(error = %e, "connection error");
                    shared.close(e.connection_code());
                    break;
                }
            },
        }
    }
    trace!("read pump exited");
}

/// Write pump: sole writer to the transport
fn run_write_pump<W: Write>(
    shared: Arc<Shared>,
    mut writer: W,
    consumer: QueueConsumer,
    send_preface: bool,
) {
    if send_preface {
        if let Err(e) = writer.write_all(CONNECTION_PREFACE) {
            debug!(error = %e, "failed to write connection preface");
            shared.write_dead.store(true, Ordering::Release);
            shared.close(ErrorCode::NoError);
            return;
        }
        trace!("connection preface written");
    }

    // DATA withheld by flow control, per stream in enqueue order
    let mut parked: BTreeMap<u32, VecDeque<DataFrame>> = BTreeMap::new();

    let died = loop {
        if shared.cancel.is_cancelled() {
            break false;
        }

        match consumer.recv_timeout(Duration::from_millis(100)) {
            Ok(QueueItem::Frame(Frame::Data(frame))) => {
                if write_data(&shared, &mut writer, &mut parked, frame).is_err() {
                    break true;
                }
            }
            Ok(QueueItem::Frame(frame)) => {
                if write_encoded(&mut writer, &frame).is_err() {
                    break true;
                }
            }
            Ok(QueueItem::Block(frames)) => {
                // Header blocks are written back-to-back, never interleaved
                if frames
                    .iter()
                    .try_for_each(|frame| write_encoded(&mut writer, frame))
                    .is_err()
                {
                    break true;
                }
            }
            Ok(QueueItem::Poke) => {
                if retry_parked(&shared, &mut writer, &mut parked).is_err() {
                    break true;
                }
            }
            Ok(QueueItem::Flush(ack)) => {
                let result = retry_parked(&shared, &mut writer, &mut parked)
                    .and_then(|_| writer.flush());
                let _ = ack.send(());
                if result.is_err() {
                    break true;
                }
            }
            Ok(QueueItem::Shutdown) => break false,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break false,
        }
    };

    if died {
        debug!("write pump I/O error");
    }
    shared.write_dead.store(true, Ordering::Release);
    shared.close(ErrorCode::NoError);
    trace!("write pump exited");
}

fn write_encoded<W: Write>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    trace!(frame = frame.type_name(), stream = frame.stream_id(), "frame written");
    writer.write_all(&FrameCodec::encode(frame))
}

/// Write a DATA frame, withholding whatever flow control does not cover
fn write_data<W: Write>(
    shared: &Shared,
    writer: &mut W,
    parked: &mut BTreeMap<u32, VecDeque<DataFrame>>,
    frame: DataFrame,
) -> std::io::Result<()> {
    // Preserve per-stream order behind already-parked frames
    if parked.get(&frame.stream_id).is_some_and(|q| !q.is_empty()) {
        parked.entry(frame.stream_id).or_default().push_back(frame);
        return Ok(());
    }
    try_send_data(shared, writer, parked, frame)
}

fn try_send_data<W: Write>(
    shared: &Shared,
    writer: &mut W,
    parked: &mut BTreeMap<u32, VecDeque<DataFrame>>,
    mut frame: DataFrame,
) -> std::io::Result<()> {
    let wanted = frame.data.len();
    let granted = shared.flow.reserve_send(frame.stream_id, wanted);

    if granted == wanted {
        return write_encoded(writer, &Frame::Data(frame));
    }

    if granted > 0 {
        // Partial credit: send what fits, keep END_STREAM on the remainder
        let chunk = frame.data.split_to(granted);
        write_encoded(
            writer,
            &Frame::Data(DataFrame::new(frame.stream_id, chunk, false)),
        )?;
    }

    trace!(
        stream = frame.stream_id,
        withheld = frame.data.len(),
        "DATA gated by flow control"
    );
    parked.entry(frame.stream_id).or_default().push_back(frame);
    Ok(())
}

/// Retry parked DATA after new credit arrived
fn retry_parked<W: Write>(
    shared: &Shared,
    writer: &mut W,
    parked: &mut BTreeMap<u32, VecDeque<DataFrame>>,
) -> std::io::Result<()> {
    let streams: Vec<u32> = parked.keys().copied().collect();
    for stream_id in streams {
        loop {
            let Some(frame) = parked.get_mut(&stream_id).and_then(|q| q.pop_front()) else {
                break;
            };
            if shared.flow.available_send(stream_id) == 0 {
                parked.entry(stream_id).or_default().push_front(frame);
                break;
            }
            try_send_data(shared, writer, parked, frame)?;
            // A partial grant re-parks the remainder; stop when it does
            if parked.get(&stream_id).is_some_and(|q| !q.is_empty()) {
                break;
            }
        }
        if parked.get(&stream_id).is_some_and(|q| q.is_empty()) {
            parked.remove(&stream_id);
        }
    }
    Ok(())
}

/// Split a header block into HEADERS + CONTINUATION frames of at most
/// `max` bytes each; the stream id is stamped afterwards
fn build_header_frames(stream_id: u32, block: Bytes, end_stream: bool, max: usize) -> Vec<Frame> {
    if block.len() <= max {
        return vec![Frame::Headers(HeadersFrame::new(
            stream_id, block, end_stream, true,
        ))];
    }

    let mut frames = Vec::new();
    let mut rest = block;
    let first = rest.split_to(max);
    frames.push(Frame::Headers(HeadersFrame::new(
        stream_id, first, end_stream, false,
    )));

    while !rest.is_empty() {
        let take = rest.len().min(max);
        let fragment = rest.split_to(take);
        let end_headers = rest.is_empty();
        frames.push(Frame::Continuation(ContinuationFrame {
            stream_id,
            fragment,
            end_headers,
        }));
    }
    frames
}

fn restamp_stream_id(frames: Vec<Frame>, stream_id: u32) -> Vec<Frame> {
    frames
        .into_iter()
        .map(|frame| match frame {
            Frame::Headers(mut f) => {
                f.stream_id = stream_id;
                Frame::Headers(f)
            }
            Frame::Continuation(mut f) => {
                f.stream_id = stream_id;
                Frame::Continuation(f)
            }
            other => other,
        })
        .collect()
}

/// Split DATA payload into chunks of at most `max` bytes
fn chunk_data(data: Bytes, max: usize) -> Vec<Bytes> {
    if data.len() <= max {
        return vec![data];
    }
    let mut chunks = Vec::new();
    let mut rest = data;
    while rest.len() > max {
        chunks.push(rest.split_to(max));
    }
    chunks.push(rest);
    chunks
}

fn header_value<'a>(headers: &'a [Header], name: &[u8]) -> Option<&'a [u8]> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_slice())
}
