//! In-memory transport pair.
//!
//! [`pair`] returns the connection-facing [`MemoryTransport`] and a
//! [`MemoryPeer`] that plays the remote side: it injects frames and failures
//! and observes everything the write worker sends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use coms_core::Envelope;
use tokio::sync::mpsc;

use super::{Frame, FrameReader, FrameWriter, NORMAL_CLOSURE, Transport};
use crate::errors::TransportError;

/// Create a connected transport/peer pair with `capacity` frames of
/// buffering in each direction.
pub fn pair(capacity: usize) -> (MemoryTransport, MemoryPeer) {
    let capacity = capacity.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let fail_writes = Arc::new(AtomicBool::new(false));
    let force_closed = Arc::new(AtomicBool::new(false));

    let transport = MemoryTransport {
        reader: MemoryReader { inbound: inbound_rx },
        writer: MemoryWriter {
            outbound: Some(outbound_tx),
            fail_writes: Arc::clone(&fail_writes),
            force_closed: Arc::clone(&force_closed),
        },
    };
    let peer = MemoryPeer {
        inbound: Some(inbound_tx),
        outbound: outbound_rx,
        fail_writes,
        force_closed,
    };
    (transport, peer)
}

/// Connection-facing half of an in-memory pair.
pub struct MemoryTransport {
    reader: MemoryReader,
    writer: MemoryWriter,
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`MemoryTransport`].
pub struct MemoryReader {
    inbound: mpsc::Receiver<Result<Frame, TransportError>>,
}

#[async_trait]
impl FrameReader for MemoryReader {
    async fn read_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        self.inbound.recv().await
    }
}

/// Write half of a [`MemoryTransport`].
pub struct MemoryWriter {
    outbound: Option<mpsc::Sender<Frame>>,
    fail_writes: Arc<AtomicBool>,
    force_closed: Arc<AtomicBool>,
}

impl MemoryWriter {
    async fn push(&mut self, frame: Frame) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(TransportError::Write("injected write failure".into()));
        }
        let Some(outbound) = &self.outbound else {
            return Err(TransportError::Closed);
        };
        outbound
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write_text(&mut self, text: String) -> Result<(), TransportError> {
        self.push(Frame::Text(text)).await
    }

    async fn write_pong(&mut self, payload: Bytes) -> Result<(), TransportError> {
        self.push(Frame::Pong(payload)).await
    }

    async fn write_close(&mut self, code: u16, _reason: &str) -> Result<(), TransportError> {
        self.push(Frame::Close(Some(code))).await
    }

    async fn force_close(&mut self) {
        self.force_closed.store(true, Ordering::Release);
        self.outbound = None;
    }
}

/// Remote side of an in-memory pair.
pub struct MemoryPeer {
    inbound: Option<mpsc::Sender<Result<Frame, TransportError>>>,
    outbound: mpsc::Receiver<Frame>,
    fail_writes: Arc<AtomicBool>,
    force_closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    async fn push(&self, item: Result<Frame, TransportError>) {
        if let Some(inbound) = &self.inbound {
            // the reader may already be gone; the frame is lost like on a real socket
            let _ = inbound.send(item).await;
        }
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: impl Into<String>) {
        self.push(Ok(Frame::Text(text.into()))).await;
    }

    /// Encode and send an envelope.
    pub async fn send_envelope(&self, envelope: &Envelope) {
        match envelope.encode() {
            Ok(text) => self.send_text(text).await,
            Err(e) => tracing::error!(error = %e, "failed to encode envelope"),
        }
    }

    /// Send a ping frame.
    pub async fn send_ping(&self, payload: impl Into<Bytes>) {
        self.push(Ok(Frame::Ping(payload.into()))).await;
    }

    /// Send a normal close frame.
    pub async fn send_close(&self) {
        self.push(Ok(Frame::Close(Some(NORMAL_CLOSURE)))).await;
    }

    /// Make the next read fail.
    pub async fn inject_read_error(&self, message: impl Into<String>) {
        self.push(Err(TransportError::Read(message.into()))).await;
    }

    /// Drop the inbound side; the reader sees end of stream.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Next frame written by the connection, or `None` once the writer is gone.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next envelope written by the connection, skipping pongs.
    ///
    /// Returns `None` on a close frame or when the writer is gone.
    pub async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.next_frame().await? {
                Frame::Text(text) => return Envelope::decode(&text).ok().flatten(),
                Frame::Close(_) => return None,
                Frame::Binary(_) | Frame::Ping(_) | Frame::Pong(_) => {}
            }
        }
    }

    /// Make every subsequent write from the connection fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Whether the connection tore the transport down without a close frame.
    pub fn was_force_closed(&self) -> bool {
        self.force_closed.load(Ordering::Acquire)
    }
}
