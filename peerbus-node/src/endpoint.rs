//! Endpoint: one stream wrapped with framing. A dedicated reader task feeds frames to the
//! bus in arrival order; a writer task drains the outbound queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use peerbus_core::{
    encode_frame, CloseCause, EndpointId, Frame, FrameDecodeError, FrameDecoder, FrameEncodeError, Message,
    NodeGuid, Status, UniqueName, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("framing error: {0}")]
    Framing(#[from] FrameDecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("handshake failed: {0}")]
    Handshake(&'static str),
    #[error("handshake timed out")]
    Timeout,
}

impl From<EndpointError> for Status {
    fn from(e: EndpointError) -> Status {
        match e {
            EndpointError::Framing(_) | EndpointError::Encode(_) | EndpointError::Handshake(_) => {
                Status::ProtocolFramingError
            }
            EndpointError::Io(_) | EndpointError::Timeout => Status::ConnectFailed,
        }
    }
}

/// Identity announced by the remote side of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHello {
    pub guid: NodeGuid,
    pub unique_name: UniqueName,
}

/// Exchange hello frames. Returns the peer's identity and any bytes read past its hello,
/// which belong to the first frames of the connection.
pub async fn handshake<S>(
    stream: &mut S,
    guid: NodeGuid,
    unique_name: &UniqueName,
    timeout: Duration,
) -> Result<(PeerHello, Vec<u8>), EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, exchange_hello(stream, guid, unique_name))
        .await
        .map_err(|_| EndpointError::Timeout)?
}

async fn exchange_hello<S>(
    stream: &mut S,
    guid: NodeGuid,
    unique_name: &UniqueName,
) -> Result<(PeerHello, Vec<u8>), EndpointError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        guid,
        unique_name: unique_name.clone(),
    };
    stream.write_all(&encode_frame(&Frame::control(0, &hello)?)).await?;
    stream.flush().await?;

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    let frame = loop {
        if let Some(frame) = decoder.next_frame()? {
            break frame;
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(EndpointError::Handshake("closed before hello"));
        }
        decoder.push(&buf[..n]);
    };
    match frame.message() {
        Ok(Message::Hello {
            protocol_version,
            guid,
            unique_name,
        }) => {
            if protocol_version != PROTOCOL_VERSION {
                return Err(EndpointError::Handshake("protocol version mismatch"));
            }
            Ok((PeerHello { guid, unique_name }, decoder.into_remaining()))
        }
        _ => Err(EndpointError::Handshake("first frame was not hello")),
    }
}

/// What the reader and writer tasks report to the bus.
#[derive(Debug)]
pub enum EndpointEvent {
    Frame(EndpointId, Frame),
    Closed(EndpointId, CloseCause),
}

enum Outgoing {
    Frame(Frame),
    Close,
}

struct Shared {
    alive: AtomicBool,
    tx: mpsc::UnboundedSender<Outgoing>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a running endpoint. Cloning shares the connection.
#[derive(Clone)]
pub struct Endpoint {
    id: EndpointId,
    peer: Arc<PeerHello>,
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Start the reader and writer tasks. `leftover` are bytes already read past the hello.
    pub fn spawn<S>(
        id: EndpointId,
        stream: S,
        peer: PeerHello,
        leftover: Vec<u8>,
        events: mpsc::UnboundedSender<EndpointEvent>,
    ) -> Endpoint
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            tx,
            shutdown,
        });
        tokio::spawn(read_loop(
            id,
            reader,
            FrameDecoder::with_bytes(leftover),
            shared.clone(),
            shutdown_rx,
            events.clone(),
        ));
        tokio::spawn(write_loop(id, writer, rx, shared.clone(), events));
        tracing::debug!(%id, peer = %peer.unique_name, "endpoint started");
        Endpoint {
            id,
            peer: Arc::new(peer),
            shared,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn peer(&self) -> &PeerHello {
        &self.peer
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Queue a frame. Fails once the endpoint is closed.
    pub fn send(&self, frame: Frame) -> Result<(), Status> {
        if !self.is_alive() {
            return Err(Status::EndpointClosed);
        }
        self.shared
            .tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| Status::EndpointClosed)
    }

    /// Close after already queued frames are written. Safe to call more than once; a local
    /// close produces no `Closed` event.
    pub fn close(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            tracing::debug!(id = %self.id, "endpoint closing");
            let _ = self.shared.tx.send(Outgoing::Close);
            let _ = self.shared.shutdown.send(true);
        }
    }
}

fn report_closed(shared: &Shared, id: EndpointId, cause: CloseCause, events: &mpsc::UnboundedSender<EndpointEvent>) {
    if shared.alive.swap(false, Ordering::AcqRel) {
        tracing::debug!(%id, ?cause, "endpoint lost");
        let _ = events.send(EndpointEvent::Closed(id, cause));
        let _ = shared.tx.send(Outgoing::Close);
    }
}

async fn read_loop<R>(
    id: EndpointId,
    mut reader: R,
    mut decoder: FrameDecoder,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<EndpointEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let cause = 'read: loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if events.send(EndpointEvent::Frame(id, frame)).is_err() {
                        break 'read CloseCause::Local;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(%id, error = %e, "framing error");
                    break 'read CloseCause::ProtocolError;
                }
            }
        }
        let read = tokio::select! {
            read = reader.read(&mut buf) => Some(read),
            _ = shutdown.changed() => None,
        };
        let Some(read) = read else {
            break CloseCause::Local;
        };
        match read {
            Ok(0) => break CloseCause::Disconnected,
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                tracing::debug!(%id, error = %e, "read failed");
                break CloseCause::Disconnected;
            }
        }
    };
    report_closed(&shared, id, cause, &events);
}

async fn write_loop<W>(
    id: EndpointId,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<EndpointEvent>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(out) = rx.recv().await {
        match out {
            Outgoing::Frame(frame) => {
                let bytes = encode_frame(&frame);
                let written = match writer.write_all(&bytes).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::debug!(%id, error = %e, "write failed");
                    report_closed(&shared, id, CloseCause::Disconnected, &events);
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}
