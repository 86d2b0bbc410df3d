//! Frame transport capability set.
//!
//! A transport is anything that can be split into a [`FrameReader`] owned by
//! the read worker and a [`FrameWriter`] owned by the write worker. Only the
//! write worker ever holds the writer half.

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::TransportError;

pub mod mem;
pub mod ws;

pub use mem::{MemoryPeer, MemoryTransport};
pub use ws::{WsMessage, WsTransport};

/// Close code for a normal, graceful shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// One transport-level frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text payload.
    Text(String),
    /// Binary payload.
    Binary(Bytes),
    /// Liveness probe from the peer.
    Ping(Bytes),
    /// Liveness answer.
    Pong(Bytes),
    /// Close frame with its status code, if any.
    Close(Option<u16>),
}

/// Read half of a transport.
#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Block until the next frame arrives.
    ///
    /// Returns `None` once the peer has gone away.
    async fn read_frame(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Write half of a transport.
#[async_trait]
pub trait FrameWriter: Send + 'static {
    /// Write one text frame.
    async fn write_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Answer one ping with one pong frame.
    ///
    /// Transports that queue the pong themselves when the ping is read only
    /// flush it here.
    async fn write_pong(&mut self, payload: Bytes) -> Result<(), TransportError>;

    /// Write a close frame.
    async fn write_close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;

    /// Tear the transport down without the close handshake.
    async fn force_close(&mut self);
}

/// A duplex frame transport.
pub trait Transport: Send + 'static {
    /// Read half.
    type Reader: FrameReader;
    /// Write half.
    type Writer: FrameWriter;

    /// Split into independently owned halves.
    fn into_split(self) -> (Self::Reader, Self::Writer);
}
