//! Per-connection heartbeat.

use std::sync::Arc;
use std::time::Duration;

use regap_core::Message;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::MessageWriter;

/// Writes `{"MsgType":"ping"}` every `period` until `cancel` fires.
///
/// A failed write ends only this loop; the connection's read loop notices
/// the dead peer on its own.
pub async fn run_ping_loop(
    writer: Arc<dyn MessageWriter>,
    period: Duration,
    cancel: CancellationToken,
    conn_id: String,
) {
    let mut ticker = interval(period);
    ticker.tick().await; // the first tick completes immediately

    let ping = Message::ping();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(conn_id = %conn_id, "ping loop cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }
        if let Err(e) = writer.write_message(&ping).await {
            debug!(conn_id = %conn_id, error = %e, "ping write failed, stopping ping loop");
            return;
        }
    }
}
