//! Read worker.

use std::sync::Arc;

use coms_core::Envelope;
use metrics::counter;
use tracing::{debug, error, info, instrument, warn};

use super::Connection;
use crate::correlation::Delivery;
use crate::transport::{Frame, FrameReader};

/// Read frames until the transport fails or the peer leaves. A frame that
/// cannot be decoded, a response that cannot be encoded and a stopped write
/// worker also end the loop. Always raises close on exit.
#[instrument(skip_all, fields(connection_id = %connection.id))]
pub(super) async fn run<R: FrameReader>(connection: Arc<Connection>, mut reader: R) {
    let stopped = connection.stopped.clone();

    loop {
        let frame = tokio::select! {
            frame = reader.read_frame() => frame,
            () = stopped.cancelled() => {
                debug!("write worker stopped");
                break;
            }
        };

        let decoded = match frame {
            None => {
                debug!("peer went away");
                break;
            }
            Some(Err(e)) => {
                warn!(error = %e, "read failed");
                break;
            }
            Some(Ok(Frame::Close(code))) => {
                info!(?code, "peer sent close");
                break;
            }
            Some(Ok(Frame::Ping(payload))) => {
                if !connection.heartbeat.on_ping(payload).await {
                    break;
                }
                continue;
            }
            Some(Ok(Frame::Pong(_))) => continue,
            Some(Ok(Frame::Text(text))) => Envelope::decode(&text),
            Some(Ok(Frame::Binary(data))) => Envelope::decode_bytes(&data),
        };
        counter!("coms_frames_in_total").increment(1);

        let envelope = match decoded {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "malformed frame");
                break;
            }
        };

        if envelope.is_response() {
            let id = envelope.id.clone();
            match connection.calls.deliver(envelope) {
                Delivery::Delivered => debug!(call_id = %id, "response delivered"),
                Delivery::Duplicate => debug!(call_id = %id, "duplicate response dropped"),
                Delivery::Unmatched => debug!(call_id = %id, "unmatched response dropped"),
            }
            continue;
        }

        debug!(request_id = %envelope.id, action = %envelope.action, "request received");
        let response = connection.handlers.dispatch(&connection, &envelope).await;
        let text = match response.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(request_id = %envelope.id, error = %e, "failed to encode response, closing");
                break;
            }
        };
        if connection.outbound.send(text).await.is_err() {
            debug!("outbound queue closed");
            break;
        }
    }

    connection.raise_close();
}
