//! UDP telemetry ingestion. The listener only decodes and hands frames over
//! a single-slot queue; the processor applies them one at a time so a slow
//! store never holds up socket reads for longer than one frame.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::DriverController;
use crate::models::telemetry::{decode_frame, TelemetryFrame, MAX_DATAGRAM_SIZE};
use crate::observability::metrics::Metrics;

/// Spawns the listener and processor tasks joined by a one-slot queue.
pub fn spawn(
    socket: UdpSocket,
    controller: Arc<DriverController>,
    metrics: Metrics,
    shutdown: watch::Receiver<bool>,
) -> (JoinHandle<()>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let listener = tokio::spawn(run_listener(socket, tx, metrics.clone(), shutdown));
    let processor = tokio::spawn(run_processor(rx, controller, metrics));
    (listener, processor)
}

pub async fn run_listener(
    socket: UdpSocket,
    tx: mpsc::Sender<TelemetryFrame>,
    metrics: Metrics,
    mut shutdown: watch::Receiver<bool>,
) {
    let addr = socket
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    info!(udp_addr = %addr, "telemetry listener started");

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buf) => received,
            _ = shutdown.wait_for(|stop| *stop) => break,
        };

        let (len, peer) = match received {
            Ok(received) => received,
            Err(err) => {
                warn!(error = %err, "telemetry receive failed");
                continue;
            }
        };

        let frame = match decode_frame(&buf[..len]) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %peer, len, error = %err, "dropping undecodable telemetry");
                record(&metrics, "decode_error");
                continue;
            }
        };
        debug!(peer = %peer, driver_id = frame.driver_id, "telemetry received");

        tokio::select! {
            sent = tx.send(frame) => {
                if sent.is_err() {
                    warn!("telemetry processor is gone");
                    break;
                }
            }
            _ = shutdown.wait_for(|stop| *stop) => break,
        }
    }

    info!(udp_addr = %addr, "telemetry listener stopped");
}

pub async fn run_processor(
    mut rx: mpsc::Receiver<TelemetryFrame>,
    controller: Arc<DriverController>,
    metrics: Metrics,
) {
    while let Some(frame) = rx.recv().await {
        let driver_id = frame.driver_id;
        match controller
            .update_driver_location(driver_id, frame.point())
            .await
        {
            Ok(_) => {
                debug!(driver_id, "driver location applied");
                record(&metrics, "applied");
            }
            Err(err) => {
                warn!(driver_id, error = %err, "telemetry rejected");
                record(&metrics, "rejected");
            }
        }
    }

    debug!("telemetry processor stopped");
}

fn record(metrics: &Metrics, outcome: &str) {
    metrics
        .telemetry_datagrams_total
        .with_label_values(&[outcome])
        .inc();
}
