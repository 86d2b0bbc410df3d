//! WebSocket adapters.
//!
//! [`WsTransport`] wraps any split-able WebSocket whose message type
//! implements [`WsMessage`]: the server-side `axum` socket and the
//! client-side `tokio-tungstenite` stream both qualify.

use std::fmt::Display;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::{Frame, FrameReader, FrameWriter, Transport};
use crate::errors::TransportError;

/// Upper bound on the flush performed by [`FrameWriter::force_close`].
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);

/// A WebSocket message type that maps onto [`Frame`].
pub trait WsMessage: Send + Sized + 'static {
    /// Convert into a frame. `None` for raw frames that carry nothing.
    fn into_frame(self) -> Option<Frame>;
    /// Build a text message.
    fn text(text: String) -> Self;
    /// Build a close message.
    fn close(code: u16, reason: &str) -> Self;
}

impl WsMessage for AxumMessage {
    fn into_frame(self) -> Option<Frame> {
        Some(match self {
            Self::Text(text) => Frame::Text(text.as_str().to_owned()),
            Self::Binary(data) => Frame::Binary(data),
            Self::Ping(data) => Frame::Ping(data),
            Self::Pong(data) => Frame::Pong(data),
            Self::Close(frame) => Frame::Close(frame.map(|f| f.code)),
        })
    }

    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn close(code: u16, reason: &str) -> Self {
        Self::Close(Some(AxumCloseFrame {
            code,
            reason: reason.to_owned().into(),
        }))
    }
}

impl WsMessage for TungsteniteMessage {
    fn into_frame(self) -> Option<Frame> {
        match self {
            Self::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Self::Binary(data) => Some(Frame::Binary(data)),
            Self::Ping(data) => Some(Frame::Ping(data)),
            Self::Pong(data) => Some(Frame::Pong(data)),
            Self::Close(frame) => Some(Frame::Close(frame.map(|f| u16::from(f.code)))),
            Self::Frame(_) => None,
        }
    }

    fn text(text: String) -> Self {
        Self::Text(text.into())
    }

    fn close(code: u16, reason: &str) -> Self {
        Self::Close(Some(TungsteniteCloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        }))
    }
}

/// A WebSocket as a [`Transport`].
pub struct WsTransport<S> {
    socket: S,
}

impl<S> WsTransport<S> {
    /// Wrap an upgraded or dialed socket.
    pub fn new(socket: S) -> Self {
        Self { socket }
    }
}

impl<S, M, E> Transport for WsTransport<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Send + Unpin + 'static,
    M: WsMessage,
    E: Display + Send + 'static,
{
    type Reader = WsReader<S>;
    type Writer = WsWriter<S, M>;

    fn into_split(self) -> (Self::Reader, Self::Writer) {
        let (sink, stream) = self.socket.split();
        (
            WsReader { stream },
            WsWriter {
                sink,
                _message: PhantomData,
            },
        )
    }
}

/// Read half of a [`WsTransport`].
pub struct WsReader<S> {
    stream: SplitStream<S>,
}

#[async_trait]
impl<S, M, E> FrameReader for WsReader<S>
where
    S: Stream<Item = Result<M, E>> + Send + Unpin + 'static,
    M: WsMessage,
    E: Display + Send + 'static,
{
    async fn read_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(message) => {
                    if let Some(frame) = message.into_frame() {
                        return Some(Ok(frame));
                    }
                }
                Err(e) => return Some(Err(TransportError::Read(e.to_string()))),
            }
        }
    }
}

/// Write half of a [`WsTransport`].
pub struct WsWriter<S, M> {
    sink: SplitSink<S, M>,
    _message: PhantomData<fn() -> M>,
}

impl<S, M, E> WsWriter<S, M>
where
    S: Sink<M, Error = E> + Send + Unpin + 'static,
    M: WsMessage,
    E: Display + Send + 'static,
{
    async fn send(&mut self, message: M) -> Result<(), TransportError> {
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }
}

#[async_trait]
impl<S, M, E> FrameWriter for WsWriter<S, M>
where
    S: Sink<M, Error = E> + Send + Unpin + 'static,
    M: WsMessage,
    E: Display + Send + 'static,
{
    async fn write_text(&mut self, text: String) -> Result<(), TransportError> {
        self.send(M::text(text)).await
    }

    /// The socket queues its own pong when the read half sees a ping, so this
    /// only flushes it. Sending a `Pong` message here would answer twice.
    async fn write_pong(&mut self, _payload: Bytes) -> Result<(), TransportError> {
        self.sink
            .flush()
            .await
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    async fn write_close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.send(M::close(code, reason)).await
    }

    async fn force_close(&mut self) {
        let _ = tokio::time::timeout(FORCE_CLOSE_WAIT, self.sink.close()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axum_close_keeps_code() {
        let msg = <AxumMessage as WsMessage>::close(1000, "bye");
        assert_eq!(msg.into_frame(), Some(Frame::Close(Some(1000))));
    }

    #[test]
    fn tungstenite_close_keeps_code() {
        let msg = <TungsteniteMessage as WsMessage>::close(1000, "bye");
        assert_eq!(msg.into_frame(), Some(Frame::Close(Some(1000))));
    }

    #[test]
    fn tungstenite_text_and_ping() {
        let text = <TungsteniteMessage as WsMessage>::text("{}".into());
        assert_eq!(text.into_frame(), Some(Frame::Text("{}".into())));

        let ping = TungsteniteMessage::Ping(Bytes::from_static(b"hb"));
        assert_eq!(ping.into_frame(), Some(Frame::Ping(Bytes::from_static(b"hb"))));
    }

    #[test]
    fn axum_pong_keeps_payload() {
        let pong = AxumMessage::Pong(Bytes::from_static(b"p"));
        assert_eq!(pong.into_frame(), Some(Frame::Pong(Bytes::from_static(b"p"))));
    }
}
