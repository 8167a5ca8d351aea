//! Simulated Labnode device for integration tests
//!
//! Every `open()` creates an in-memory duplex pipe and hands the device end
//! to the test through a channel, so a test can play the device, drop the
//! link, and accept the reconnection.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use labnode::network::{ConnectionManager, ConnectionState, Transport, TransportError, TransportResult, TransportStream};
use labnode::protocol::{CorrelationId, FrameCodec, Framing, Message, OperationId, OperationMap};
use labnode::Value;

pub struct SimulatedTransport {
    framing: Framing,
    links: mpsc::UnboundedSender<DeviceLink>,
    opens: AtomicUsize,
    refuse: AtomicBool,
}

impl SimulatedTransport {
    /// Number of open attempts, refused ones included
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make further opens fail as if the device were unplugged
    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn open(&self) -> TransportResult<TransportStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }

        let (client, device) = tokio::io::duplex(4096);
        let _ = self.links.send(DeviceLink::new(device, self.framing));
        Ok(TransportStream::from_io(client))
    }

    fn endpoint(&self) -> String {
        "simulated".to_string()
    }

    fn default_framing(&self) -> Framing {
        self.framing
    }
}

/// Create a transport and the receiver its device ends arrive on
pub fn simulated(framing: Framing) -> (Arc<SimulatedTransport>, mpsc::UnboundedReceiver<DeviceLink>) {
    let (links, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(SimulatedTransport {
        framing,
        links,
        opens: AtomicUsize::new(0),
        refuse: AtomicBool::new(false),
    });
    (transport, rx)
}

/// Connect `manager` to a fresh simulated device
pub async fn connect(manager: &ConnectionManager, framing: Framing) -> (Arc<SimulatedTransport>, mpsc::UnboundedReceiver<DeviceLink>, DeviceLink) {
    let (transport, mut links) = simulated(framing);
    manager
        .connect_with(transport.clone(), framing)
        .await
        .expect("connect to simulated device");
    let link = links.recv().await.expect("device link");
    (transport, links, link)
}

/// Transport whose writer accepts a fixed number of writes and then fails
/// with a broken pipe. Reads stay open and silent.
pub struct BrokenPipeTransport {
    accepted_writes: usize,
    device_ends: Mutex<Vec<DuplexStream>>,
}

impl BrokenPipeTransport {
    pub fn new(accepted_writes: usize) -> Arc<Self> {
        Arc::new(Self {
            accepted_writes,
            device_ends: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for BrokenPipeTransport {
    async fn open(&self) -> TransportResult<TransportStream> {
        let (client, device) = tokio::io::duplex(4096);
        self.device_ends.lock().unwrap().push(device);
        let writer = FailingWriter {
            remaining: self.accepted_writes,
        };
        Ok(TransportStream::new(Box::new(client), Box::new(writer)))
    }

    fn endpoint(&self) -> String {
        "broken-pipe".to_string()
    }

    fn default_framing(&self) -> Framing {
        Framing::Cobs
    }
}

struct FailingWriter {
    remaining: usize,
}

impl AsyncWrite for FailingWriter {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        self.remaining -= 1;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Device end of one link
pub struct DeviceLink {
    stream: DuplexStream,
    codec: FrameCodec,
    buf: BytesMut,
}

impl DeviceLink {
    fn new(stream: DuplexStream, framing: Framing) -> Self {
        Self {
            stream,
            codec: FrameCodec::new(framing),
            buf: BytesMut::new(),
        }
    }

    /// Next request from the client, `None` once the client hung up
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf).expect("client sent a malformed frame") {
                return Some(Message::decode(&frame).expect("client sent an undecodable message"));
            }
            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Send a framed message to the client
    pub async fn send(&mut self, message: &Message) {
        let payload = message.encode().expect("encode reply");
        let mut frame = BytesMut::new();
        self.codec.encode(&payload, &mut frame).expect("frame reply");
        self.send_raw(&frame).await;
    }

    /// Reply to `request` with `operations`
    pub async fn reply(&mut self, request: &Message, operations: OperationMap) {
        self.send(&reply_to(request.correlation_id, operations)).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("write to client");
    }

    /// Answer every request with `respond` until the client hangs up
    pub fn serve<F>(mut self, respond: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn(&OperationMap) -> Option<OperationMap> + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(request) = self.recv().await {
                if let Some(operations) = respond(&request.operations) {
                    self.reply(&request, operations).await;
                }
            }
        })
    }
}

pub fn reply_to(correlation_id: CorrelationId, operations: OperationMap) -> Message {
    Message {
        correlation_id,
        operations,
    }
}

pub fn op(id: u8) -> OperationId {
    OperationId(id)
}

pub fn int(value: i64) -> Value {
    Value::Integer(value.into())
}

/// Operations with null arguments
pub fn query(ids: &[u8]) -> OperationMap {
    ids.iter().map(|&id| (op(id), Value::Null)).collect()
}

/// One operation carrying `len` bytes, more than a link buffer holds
pub fn blob(len: usize) -> OperationMap {
    OperationMap::new().with(op(1), Value::Bytes(vec![0xAA; len]))
}

/// Reply to each operation with ten times its id
pub fn times_ten(request: &OperationMap) -> Option<OperationMap> {
    Some(request.keys().map(|id| (id, int(id.0 as i64 * 10))).collect())
}

/// Poll until the manager reaches `state`
pub async fn wait_for_state(manager: &ConnectionManager, state: ConnectionState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while manager.state().await != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "Connection never reached {:?}", state);
}
