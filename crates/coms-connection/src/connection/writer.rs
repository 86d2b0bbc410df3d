//! Write worker. The only code that touches the writer half.

use std::sync::Arc;

use bytes::Bytes;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::Connection;
use crate::heartbeat::WriteDeadline;
use crate::transport::{FrameWriter, NORMAL_CLOSURE};

/// Receiving ends the write worker selects over.
pub(super) struct Inputs {
    pub(super) outbound: mpsc::Receiver<String>,
    pub(super) pings: mpsc::Receiver<Bytes>,
    pub(super) close: mpsc::Receiver<()>,
    pub(super) deadline: WriteDeadline,
}

/// Write outbound frames and pongs until a close signal or a write failure.
/// Trips the connection's stop token on exit, panics included.
#[instrument(skip_all, fields(connection_id = %connection.id))]
pub(super) async fn run<W: FrameWriter>(connection: Arc<Connection>, mut writer: W, inputs: Inputs) {
    let _stopped = connection.stopped.clone().drop_guard();
    let Inputs {
        mut outbound,
        mut pings,
        mut close,
        deadline,
    } = inputs;

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(text) = message else {
                    close_transport(&mut writer, &deadline).await;
                    break;
                };
                if let Err(e) = deadline.run(writer.write_text(text)).await {
                    warn!(error = %e, "write failed");
                    fail(&connection, &mut writer).await;
                    break;
                }
                counter!("coms_frames_out_total").increment(1);
            }
            Some(payload) = pings.recv() => {
                if let Err(e) = deadline.run(writer.write_pong(payload)).await {
                    warn!(error = %e, "pong write failed");
                    fail(&connection, &mut writer).await;
                    break;
                }
            }
            _ = close.recv() => {
                close_transport(&mut writer, &deadline).await;
                break;
            }
        }
    }
}

async fn fail<W: FrameWriter>(connection: &Connection, writer: &mut W) {
    connection.raise_close();
    writer.force_close().await;
}

async fn close_transport<W: FrameWriter>(writer: &mut W, deadline: &WriteDeadline) {
    match deadline.run(writer.write_close(NORMAL_CLOSURE, "")).await {
        Ok(()) => debug!("close frame sent"),
        Err(e) => {
            debug!(error = %e, "close frame failed, forcing close");
            writer.force_close().await;
        }
    }
}
