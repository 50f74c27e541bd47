//! Networking primitives.
//!
//! Goals:
//! - Carry discrete messages over a TCP byte stream.
//! - Hide the socket behind a [`Transport`] trait so connections can be
//!   driven by an in-memory channel in tests.
//! - Turn each socket's incoming side into a stream of [`TransportEvent`]s.
//!
//! Framing: `[u32 big-endian payload length][u8 kind][payload]`, kind 1 is
//! binary and kind 2 is text.

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::{
    fmt,
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
    task::JoinHandle,
};
use tracing::debug;

/// Largest payload accepted in one message.
pub const MAX_MESSAGE_LEN: usize = 1 << 20;

const KIND_BINARY: u8 = 1;
const KIND_TEXT: u8 = 2;

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u32);

impl ConnId {
    pub fn new_unique() -> Self {
        ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Binary(Bytes),
    Text(String),
}

impl Message {
    fn kind(&self) -> u8 {
        match self {
            Message::Binary(_) => KIND_BINARY,
            Message::Text(_) => KIND_TEXT,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Message::Binary(b) => b,
            Message::Text(s) => s.as_bytes(),
        }
    }
}

/// What a socket's reader task reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(ConnId, Message),
    Error(ConnId, String),
    Closed(ConnId),
}

impl TransportEvent {
    pub fn conn(&self) -> ConnId {
        match self {
            TransportEvent::Message(id, _) | TransportEvent::Error(id, _) | TransportEvent::Closed(id) => *id,
        }
    }
}

/// Outgoing side of a connection.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, msg: Message) -> anyhow::Result<()>;

    /// Closes the outgoing side. Idempotent.
    async fn close(&mut self);

    fn peer_addr(&self) -> SocketAddr;
}

/// Frames one message into `[len][kind][payload]`.
pub fn encode_message(msg: &Message) -> anyhow::Result<Bytes> {
    let payload = msg.payload();
    if payload.len() > MAX_MESSAGE_LEN {
        bail!("message of {} bytes exceeds {MAX_MESSAGE_LEN}", payload.len());
    }
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(msg.kind());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

/// Reads framed messages from a byte stream.
#[derive(Debug)]
pub struct FramedReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Next message, or `None` once the peer closed cleanly between messages.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e).context("tcp read len"),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_MESSAGE_LEN {
            bail!("incoming message of {len} bytes exceeds {MAX_MESSAGE_LEN}");
        }

        let kind = self.inner.read_u8().await.context("tcp read kind")?;
        let mut payload = vec![0u8; len];
        self.inner
            .read_exact(&mut payload)
            .await
            .context("tcp read payload")?;

        match kind {
            KIND_BINARY => Ok(Some(Message::Binary(Bytes::from(payload)))),
            KIND_TEXT => {
                let text = String::from_utf8(payload).context("text message is not utf-8")?;
                Ok(Some(Message::Text(text)))
            }
            other => bail!("unknown message kind {other}"),
        }
    }
}

/// Writes framed messages to a byte stream.
#[derive(Debug)]
pub struct FramedWriter<W> {
    inner: W,
    peer: SocketAddr,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(inner: W, peer: SocketAddr) -> Self {
        Self {
            inner,
            peer,
            closed: false,
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for FramedWriter<W> {
    async fn send(&mut self, msg: Message) -> anyhow::Result<()> {
        if self.closed {
            bail!("transport to {} is closed", self.peer);
        }
        let buf = encode_message(&msg)?;
        self.inner.write_all(&buf).await.context("tcp write")?;
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Shutdown failed");
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

pub type TcpTransport = FramedWriter<OwnedWriteHalf>;
pub type TcpReader = FramedReader<OwnedReadHalf>;

/// Splits a connected stream into its framed halves.
pub fn split_stream(stream: TcpStream) -> anyhow::Result<(TcpReader, TcpTransport)> {
    let peer = stream.peer_addr().context("peer addr")?;
    stream.set_nodelay(true).context("set nodelay")?;
    let (read, write) = stream.into_split();
    Ok((FramedReader::new(read), FramedWriter::new(write, peer)))
}

/// Client side: connects and splits.
pub async fn connect(addr: SocketAddr) -> anyhow::Result<(TcpReader, TcpTransport)> {
    let stream = TcpStream::connect(addr).await.context("tcp connect")?;
    split_stream(stream)
}

/// TCP server listener.
pub struct FrameListener {
    listener: TcpListener,
}

impl FrameListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(TcpReader, TcpTransport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        let (reader, writer) = split_stream(stream)?;
        Ok((reader, writer, addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Forwards everything `reader` yields as events tagged with `conn`, ending
/// with exactly one `Closed`.
pub fn spawn_reader<R>(
    conn: ConnId,
    mut reader: FramedReader<R>,
    events: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(Some(msg)) => {
                    if events.send(TransportEvent::Message(conn, msg)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(conn, format!("{e:#}")));
                    break;
                }
            }
        }
        let _ = events.send(TransportEvent::Closed(conn));
    })
}

/// In-memory transport; the paired [`ChannelPeer`] sees what was sent.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Message>,
    peer: SocketAddr,
    closed: Arc<AtomicBool>,
}

/// Receiving end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelPeer {
    pub rx: mpsc::UnboundedReceiver<Message>,
    closed: Arc<AtomicBool>,
}

impl ChannelTransport {
    pub fn pair(peer: SocketAddr) -> (Self, ChannelPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                tx,
                peer,
                closed: Arc::clone(&closed),
            },
            ChannelPeer { rx, closed },
        )
    }
}

impl ChannelPeer {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Every message sent so far, without waiting.
    pub fn drain(&mut self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, msg: Message) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            bail!("channel to {} is closed", self.peer);
        }
        self.tx.send(msg).context("channel peer dropped")?;
        Ok(())
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}
