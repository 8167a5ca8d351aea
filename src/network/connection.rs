//! Connection handling for Labnode devices
//!
//! Manages the link to one device, including:
//! - Opening the transport and tracking connection state
//! - The read loop: bytes -> frames -> messages -> waiting callers
//! - The write path: one frame on the wire at a time
//! - Teardown and optional reconnection

use bytes::BytesMut;
use ciborium::value::Value;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;

use super::lock_ignore_poison;
use super::multiplexer::{deadline_after, Dispatch, PendingReply, RequestMultiplexer, Submission};
use super::retry::ReconnectPolicy;
use super::transport::{Transport, TransportConfig, TransportError, TransportReader, TransportStream, TransportWriter};
use crate::protocol::{
    function, CodecError, CorrelationId, FrameCodec, Framing, Message, MessageError, OperationMap,
    DEFAULT_ID_SPACE, DEFAULT_MAX_PAYLOAD,
};

/// Errors opening a connection
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Already connected")]
    AlreadyConnected,
}

pub type ConnectResult<T> = Result<T, ConnectError>;

/// Errors surfaced to a caller of [`ConnectionManager::send_request`]
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Request {correlation_id} timed out after {after:?}")]
    Timeout {
        correlation_id: CorrelationId,
        after: Duration,
    },

    #[error("All correlation ids are in use")]
    Exhausted,

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid reply: {0}")]
    InvalidReply(String),
}

pub type RequestResult<T> = Result<T, RequestError>;

/// State of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport open; sends fail immediately
    Disconnected,
    /// Opening (or reopening) the transport
    Connecting,
    /// Transport open, requests accepted
    Connected,
    /// Tearing down; pending requests are being failed
    Closing,
}

/// Runtime settings of a connection
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Default time to wait for a reply
    pub request_timeout: Duration,
    /// Time allowed for opening the transport
    pub connect_timeout: Duration,
    /// Number of correlation ids in use (1..=256)
    pub id_space: u16,
    /// Largest payload accepted in either direction
    pub max_payload: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(2500),
            connect_timeout: Duration::from_millis(2500),
            id_space: DEFAULT_ID_SPACE,
            max_payload: DEFAULT_MAX_PAYLOAD,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionOptions {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Connection statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Frames written
    pub frames_sent: u64,
    /// Messages decoded
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Frames or payloads dropped as malformed
    pub decode_errors: u64,
    /// Replies that matched no pending request
    pub stale_replies: u64,
    /// Requests that timed out
    pub timeouts: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    decode_errors: AtomicU64,
    stale_replies: AtomicU64,
    timeouts: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            stale_replies: self.stale_replies.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Type and API version reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_type: u32,
    pub api_version: (u8, u8, u8),
}

/// Write half of the current link
struct LinkWriter {
    epoch: u64,
    writer: TransportWriter,
    codec: FrameCodec,
    buf: BytesMut,
}

/// Read half of the current link, owned by the supervisor task
struct LinkReader {
    reader: TransportReader,
    codec: FrameCodec,
    buf: BytesMut,
}

/// Background task driving the read loop and reconnection
struct Supervisor {
    endpoint: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    options: ConnectionOptions,
    multiplexer: RequestMultiplexer,
    state: RwLock<ConnectionState>,
    writer: tokio::sync::Mutex<Option<LinkWriter>>,
    supervisor: Mutex<Option<Supervisor>>,
    /// Serializes connect() and close()
    lifecycle: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
    failed_epoch: AtomicU64,
    link_failed: Notify,
    stats: StatsCounters,
}

/// Client side of a device link.
///
/// Cheap to clone; all clones share one connection. Call [`close`](Self::close)
/// when done, otherwise the background task keeps the link open.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionOptions::default())
    }
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                multiplexer: RequestMultiplexer::new(options.id_space),
                options,
                state: RwLock::new(ConnectionState::Disconnected),
                writer: tokio::sync::Mutex::new(None),
                supervisor: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                epoch: AtomicU64::new(0),
                failed_epoch: AtomicU64::new(0),
                link_failed: Notify::new(),
                stats: StatsCounters::default(),
            }),
        }
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Get the current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Check if requests are currently accepted
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Endpoint of the current (or last) link
    pub fn endpoint(&self) -> Option<String> {
        lock_ignore_poison(&self.inner.supervisor)
            .as_ref()
            .map(|supervisor| supervisor.endpoint.clone())
    }

    /// Get connection statistics
    pub fn stats(&self) -> ConnectionStats {
        self.inner.stats.snapshot()
    }

    /// Number of requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.inner.multiplexer.pending_count()
    }

    /// Open the transport described by `config`
    pub async fn connect(&self, config: &TransportConfig) -> ConnectResult<()> {
        let transport = config.build(self.inner.options.connect_timeout)?;
        let framing = config
            .framing()
            .unwrap_or_else(|| transport.default_framing());
        self.connect_with(transport, framing).await
    }

    /// Open a connection over an already built transport
    pub async fn connect_with(&self, transport: Arc<dyn Transport>, framing: Framing) -> ConnectResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        {
            let mut state = self.inner.state.write().await;
            if *state != ConnectionState::Disconnected {
                return Err(ConnectError::AlreadyConnected);
            }
            *state = ConnectionState::Connecting;
        }

        // A supervisor that gave up reconnecting has already exited
        let stale = lock_ignore_poison(&self.inner.supervisor).take();
        if let Some(stale) = stale {
            let _ = stale.shutdown_tx.send(true);
            let _ = stale.task.await;
        }

        let endpoint = transport.endpoint();
        tracing::info!("Connecting to {} ({} framing)", endpoint, framing);

        let stream = match transport.open().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("Failed to connect to {}: {}", endpoint, e);
                self.inner.set_state(ConnectionState::Disconnected).await;
                return Err(e.into());
            }
        };

        let reader = self.inner.install(stream, framing).await;
        tracing::info!("Connected to {}", endpoint);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(
            self.inner.clone(),
            transport,
            framing,
            reader,
            shutdown_rx,
        ));

        *lock_ignore_poison(&self.inner.supervisor) = Some(Supervisor {
            endpoint,
            shutdown_tx,
            task,
        });

        Ok(())
    }

    /// Send a request to the device.
    ///
    /// With `response_expected` the call resolves with the reply's operation
    /// map (correlation id removed); otherwise it resolves with an empty map
    /// once the frame is written. `timeout` defaults to the configured
    /// request timeout and bounds the whole call, waiting for the write lock
    /// included. Dropping the returned future releases the correlation id.
    pub async fn send_request(
        &self,
        operations: OperationMap,
        response_expected: bool,
        timeout: Option<Duration>,
    ) -> RequestResult<OperationMap> {
        if self.state().await != ConnectionState::Connected {
            return Err(RequestError::NotConnected);
        }

        let timeout = timeout.unwrap_or(self.inner.options.request_timeout);
        let deadline = deadline_after(timeout);

        let Submission { request, reply } = self.inner.multiplexer.submit(operations, response_expected)?;
        let correlation_id = request.correlation_id;
        let ticket = reply.as_ref().map(PendingReply::ticket);

        // Written from its own task so a caller that gives up never leaves
        // half a frame on the link
        let write = tokio::spawn(self.inner.clone().write_message(request, ticket));
        match tokio::time::timeout_at(deadline, write).await {
            Ok(Ok(written)) => written?,
            Ok(Err(e)) => {
                tracing::error!("Write task for request {} failed: {}", correlation_id, e);
                return Err(RequestError::ConnectionLost);
            }
            Err(_) => {
                tracing::warn!(
                    "Request {} timed out after {:?} while writing",
                    correlation_id,
                    timeout
                );
                StatsCounters::bump(&self.inner.stats.timeouts, 1);
                return Err(RequestError::Timeout {
                    correlation_id,
                    after: timeout,
                });
            }
        }

        let Some(reply) = reply else {
            return Ok(OperationMap::new());
        };

        let result = self.inner.multiplexer.wait_until(reply, deadline, timeout).await;
        if matches!(result, Err(RequestError::Timeout { .. })) {
            StatsCounters::bump(&self.inner.stats.timeouts, 1);
        }
        result
    }

    /// Query the device type and API version
    pub async fn identify(&self) -> RequestResult<DeviceIdentity> {
        let operations = OperationMap::new()
            .with(function::GET_DEVICE_TYPE, Value::Null)
            .with(function::GET_API_VERSION, Value::Null);
        let reply = self.send_request(operations, true, None).await?;

        let device_type = reply
            .get(function::GET_DEVICE_TYPE)
            .and_then(Value::as_integer)
            .and_then(|int| u32::try_from(int).ok())
            .ok_or_else(|| RequestError::InvalidReply(format!("no device type in {:?}", reply)))?;

        let api_version = reply
            .get(function::GET_API_VERSION)
            .and_then(parse_version)
            .ok_or_else(|| RequestError::InvalidReply(format!("no API version in {:?}", reply)))?;

        Ok(DeviceIdentity {
            device_type,
            api_version,
        })
    }

    /// Close the connection.
    ///
    /// On return the transport is closed, reconnection has stopped and every
    /// pending request has been failed with `ConnectionLost`.
    pub async fn close(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let supervisor = lock_ignore_poison(&self.inner.supervisor).take();
        self.inner.set_state(ConnectionState::Closing).await;

        let endpoint = match supervisor {
            Some(supervisor) => {
                let _ = supervisor.shutdown_tx.send(true);
                if let Err(e) = supervisor.task.await {
                    tracing::warn!("Connection task for {} ended abnormally: {}", supervisor.endpoint, e);
                }
                supervisor.endpoint
            }
            None => "device".to_string(),
        };

        self.inner.drop_writer().await;
        let failed = self.inner.multiplexer.fail_all(|| RequestError::ConnectionLost);
        self.inner.set_state(ConnectionState::Disconnected).await;

        tracing::info!(
            "Connection to {} closed ({} pending requests failed)",
            endpoint,
            failed
        );
    }
}

impl Inner {
    async fn set_state(&self, new_state: ConnectionState) {
        let mut state = self.state.write().await;
        if *state != new_state {
            tracing::debug!("Connection state {:?} -> {:?}", *state, new_state);
            *state = new_state;
        }
    }

    /// Make a freshly opened stream the current link
    async fn install(&self, stream: TransportStream, framing: Framing) -> LinkReader {
        let TransportStream { reader, writer } = stream;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let codec = FrameCodec::with_max_payload(framing, self.options.max_payload);

        *self.writer.lock().await = Some(LinkWriter {
            epoch,
            writer,
            codec: codec.clone(),
            buf: BytesMut::with_capacity(256),
        });
        self.set_state(ConnectionState::Connected).await;

        LinkReader {
            reader,
            codec,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Encode, frame and write one request. Only one frame is in flight at a time.
    ///
    /// A request registered under `ticket` that is no longer pending by the
    /// time the lock is acquired is not written. A write the peer does not
    /// accept within the configured request timeout fails the link.
    async fn write_message(self: Arc<Self>, request: Message, ticket: Option<u64>) -> RequestResult<()> {
        let stall_after = self.options.request_timeout;
        let payload = request.encode()?;

        let mut guard = self.writer.lock().await;
        if let Some(ticket) = ticket {
            if !self.multiplexer.is_current(request.correlation_id, ticket) {
                tracing::debug!("Request {} abandoned before it was written", request.correlation_id);
                return Err(RequestError::ConnectionLost);
            }
        }
        let Some(link) = guard.as_mut() else {
            return Err(RequestError::NotConnected);
        };

        link.buf.clear();
        link.codec.encode(&payload, &mut link.buf)?;
        tracing::debug!(
            "Sending request {} ({} bytes): {:?}",
            request.correlation_id,
            link.buf.len(),
            request.operations
        );

        let write = async {
            match link.writer.write_all(&link.buf).await {
                Ok(()) => link.writer.flush().await,
                Err(e) => Err(e),
            }
        };
        let result = match tokio::time::timeout(stall_after, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("peer accepted no frame for {:?}", stall_after),
            )),
        };

        match result {
            Ok(()) => {
                StatsCounters::bump(&self.stats.frames_sent, 1);
                StatsCounters::bump(&self.stats.bytes_sent, link.buf.len() as u64);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Write failed: {}", e);
                let epoch = link.epoch;
                *guard = None;
                self.failed_epoch.store(epoch, Ordering::SeqCst);
                self.link_failed.notify_one();
                Err(RequestError::ConnectionLost)
            }
        }
    }

    async fn drop_writer(&self) {
        let link = self.writer.lock().await.take();
        if let Some(mut link) = link {
            if let Err(e) = link.writer.shutdown().await {
                tracing::debug!("Error shutting down transport: {}", e);
            }
        }
    }

    /// Read until the link fails. Returns the reason.
    ///
    /// Cancel safe: all decode state lives in `link`.
    async fn read_loop(&self, link: &mut LinkReader) -> String {
        loop {
            loop {
                match link.codec.decode(&mut link.buf) {
                    Ok(Some(payload)) => self.handle_payload(&payload),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("Dropping malformed frame: {}", e);
                        StatsCounters::bump(&self.stats.decode_errors, 1);
                    }
                }
            }

            link.buf.reserve(1024);
            match link.reader.read_buf(&mut link.buf).await {
                Ok(0) => return "connection closed by remote endpoint".to_string(),
                Ok(n) => StatsCounters::bump(&self.stats.bytes_received, n as u64),
                Err(e) => return format!("read error: {}", e),
            }
        }
    }

    fn handle_payload(&self, payload: &[u8]) {
        match Message::decode(payload) {
            Ok(response) => {
                StatsCounters::bump(&self.stats.frames_received, 1);
                tracing::debug!(
                    "Received reply {}: {:?}",
                    response.correlation_id,
                    response.operations
                );
                if self.multiplexer.on_message(response) == Dispatch::Stale {
                    StatsCounters::bump(&self.stats.stale_replies, 1);
                }
            }
            Err(e) => {
                tracing::warn!("Dropping undecodable payload ({} bytes): {}", payload.len(), e);
                StatsCounters::bump(&self.stats.decode_errors, 1);
            }
        }
    }

    /// Fail everything in flight after the link broke
    async fn tear_down(&self, endpoint: &str, reason: &str) {
        tracing::error!("Connection to {} lost: {}", endpoint, reason);

        self.set_state(ConnectionState::Closing).await;
        self.drop_writer().await;
        let failed = self.multiplexer.fail_all(|| RequestError::ConnectionLost);
        if failed > 0 {
            tracing::warn!("Failed {} pending requests on {}", failed, endpoint);
        }

        let mut state = self.state.write().await;
        *state = ConnectionState::Disconnected;
        if self.options.reconnect.enabled {
            *state = ConnectionState::Connecting;
        }
    }

    /// Reopen the transport with backoff. `None` if giving up or shutting down.
    async fn reconnect(
        &self,
        transport: &dyn Transport,
        framing: Framing,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Option<LinkReader> {
        let endpoint = transport.endpoint();
        let mut backoff = self.options.reconnect.backoff();

        loop {
            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    "Giving up reconnecting to {} after {} attempts",
                    endpoint,
                    backoff.attempt()
                );
                self.set_state(ConnectionState::Disconnected).await;
                return None;
            };

            tracing::info!(
                "Reconnecting to {} in {:?} (attempt {})",
                endpoint,
                delay,
                backoff.attempt()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => return None,
            }

            let opened = tokio::select! {
                opened = transport.open() => opened,
                _ = shutdown_rx.changed() => return None,
            };

            match opened {
                Ok(stream) => {
                    if *shutdown_rx.borrow() {
                        return None;
                    }
                    let link = self.install(stream, framing).await;
                    tracing::info!("Reconnected to {}", endpoint);
                    return Some(link);
                }
                Err(e) => tracing::warn!("Reconnect to {} failed: {}", endpoint, e),
            }
        }
    }
}

/// Drive one connection: read until the link fails, tear down, maybe reconnect
async fn supervise(
    inner: Arc<Inner>,
    transport: Arc<dyn Transport>,
    framing: Framing,
    mut link: LinkReader,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let endpoint = transport.endpoint();

    loop {
        let epoch = inner.epoch.load(Ordering::SeqCst);

        let reason = loop {
            tokio::select! {
                reason = inner.read_loop(&mut link) => break reason,
                _ = inner.link_failed.notified() => {
                    if inner.failed_epoch.load(Ordering::SeqCst) == epoch {
                        break "write failed".to_string();
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        };

        inner.tear_down(&endpoint, &reason).await;
        if !inner.options.reconnect.enabled {
            return;
        }

        match inner.reconnect(transport.as_ref(), framing, &mut shutdown_rx).await {
            Some(next) => link = next,
            None => return,
        }
    }
}

/// Parse a `[major, minor, patch]` array
fn parse_version(value: &Value) -> Option<(u8, u8, u8)> {
    let parts = value.as_array()?;
    let mut numbers = parts
        .iter()
        .map(|part| part.as_integer().and_then(|int| u8::try_from(int).ok()));
    let version = (numbers.next()??, numbers.next()??, numbers.next()??);
    if numbers.next().is_some() {
        return None;
    }
    Some(version)
}
