//! Per-viewer websocket tasks. The writer is the only task sending on the
//! socket and the reader the only one receiving from it.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::hub::{Connection, HubHandle, Outbound};

pub const WRITE_WAIT: Duration = Duration::from_secs(10);
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Must stay below `PONG_WAIT` so a healthy peer always answers in time.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const MAX_MESSAGE_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
        }
    }
}

/// Registers the connection, runs the writer on its own task and the reader
/// on this one, then unregisters once either side stops.
pub async fn run_session(
    socket: WebSocket,
    hub: HubHandle,
    conn: Arc<Connection>,
    outbound: Outbound,
    timings: SessionTimings,
) {
    let (sink, stream) = socket.split();
    serve(sink, stream, hub, conn, outbound, timings).await;
}

async fn serve<Si, St, E>(
    sink: Si,
    stream: St,
    hub: HubHandle,
    conn: Arc<Connection>,
    outbound: Outbound,
    timings: SessionTimings,
) where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let driver_id = conn.driver_id();

    if hub.register(conn.clone()).await.is_err() {
        debug!(driver_id, "hub stopped; refusing viewer");
        return;
    }
    info!(driver_id, conn_id = conn.conn_id(), "viewer connected");

    let mut writer = tokio::spawn(write_loop(
        sink,
        outbound,
        timings.write_wait,
        timings.ping_period,
    ));
    // An evicted viewer gets one write deadline to answer the close frame.
    let writer_done = tokio::select! {
        _ = read_loop(stream, driver_id, timings.pong_wait) => false,
        _ = &mut writer => {
            debug!(driver_id, "viewer writer stopped");
            true
        }
        _ = async {
            conn.closed().await;
            time::sleep(timings.write_wait).await;
        } => {
            debug!(driver_id, "viewer did not acknowledge close");
            false
        }
    };

    conn.close();
    let _ = hub.unregister(&conn).await;
    if !writer_done {
        let _ = writer.await;
    }
    info!(driver_id, conn_id = conn.conn_id(), "viewer disconnected");
}

async fn read_loop<St, E>(mut stream: St, driver_id: i32, pong_wait: Duration)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut deadline = Instant::now() + pong_wait;

    loop {
        let message = match time::timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!(driver_id, "viewer read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(driver_id, error = %err, "viewer read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Pong(_) => deadline = Instant::now() + pong_wait,
            Message::Close(frame) => {
                debug!(driver_id, ?frame, "viewer sent close");
                break;
            }
            Message::Text(text) => debug!(driver_id, %text, "ignoring viewer text"),
            Message::Binary(data) => debug!(driver_id, len = data.len(), "ignoring viewer binary"),
            Message::Ping(_) => {}
        }
    }
}

async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: Outbound,
    write_wait: Duration,
    ping_period: Duration,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ping = time::interval_at(Instant::now() + ping_period, ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            text = outbound.text.recv() => match text {
                Some(text) => Message::Text(text),
                None => break,
            },
            frame = outbound.status.recv() => match frame {
                Some(frame) => Message::Binary(frame),
                None => break,
            },
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        match time::timeout(write_wait, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(error = %err, "viewer write failed");
                return;
            }
            Err(_) => {
                debug!("viewer write deadline expired");
                return;
            }
        }
    }

    let _ = time::timeout(write_wait, sink.send(Message::Close(None))).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use futures::channel::mpsc;
    use futures::StreamExt;
    use prost::Message as _;
    use tokio::sync::watch;
    use tokio::task::JoinHandle;

    use super::{serve, SessionTimings};
    use crate::error::AppError;
    use crate::hub::{Connection, Hub, HubConfig, HubHandle, StatusSource};
    use crate::models::driver::{DriverFields, GeoPoint};
    use crate::models::telemetry::TelemetryFrame;
    use crate::observability::metrics::Metrics;

    const FAST: Duration = Duration::from_millis(20);
    const IDLE: Duration = Duration::from_secs(60);

    struct Parked;

    #[async_trait]
    impl StatusSource for Parked {
        async fn status_frame(&self, driver_id: i32) -> Result<TelemetryFrame, AppError> {
            let fields = DriverFields {
                driver_id,
                ..DriverFields::default()
            };
            Ok(TelemetryFrame::status_frame(
                "fleet",
                &fields,
                GeoPoint::new(21.0, 105.8),
            ))
        }
    }

    /// The far end of a session: what it wrote, and the feed it reads from.
    struct Peer {
        conn: Arc<Connection>,
        written: mpsc::Receiver<Message>,
        feed: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        session: JoinHandle<()>,
    }

    fn hub(push_interval: Duration) -> HubHandle {
        let (handle, _task) = Hub::spawn(
            HubConfig {
                push_interval,
                queue_size: 8,
            },
            Arc::new(Parked),
            Metrics::new(),
            watch::channel(false).1,
        );
        handle
    }

    fn timings(write_wait: Duration, pong_wait: Duration) -> SessionTimings {
        SessionTimings {
            write_wait,
            pong_wait,
            ping_period: IDLE,
        }
    }

    async fn connect(hub: &HubHandle, driver_id: i32, timings: SessionTimings) -> Peer {
        let (sink, written) = mpsc::channel(16);
        let (feed, stream) = mpsc::unbounded();
        let (conn, outbound) = hub.connection(driver_id);
        let session = tokio::spawn(serve(
            sink,
            stream,
            hub.clone(),
            conn.clone(),
            outbound,
            timings,
        ));

        let mut count = hub.watch_count();
        tokio::time::timeout(Duration::from_secs(2), count.wait_for(|n| *n == 1))
            .await
            .expect("viewer not registered")
            .unwrap();

        Peer {
            conn,
            written,
            feed,
            session,
        }
    }

    async fn finished(session: JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .expect("session still running")
            .unwrap();
    }

    async fn unregistered(hub: &HubHandle) {
        let mut count = hub.watch_count();
        tokio::time::timeout(Duration::from_secs(2), count.wait_for(|n| *n == 0))
            .await
            .expect("viewer still registered")
            .unwrap();
    }

    async fn next_close(written: &mut mpsc::Receiver<Message>) -> bool {
        while let Some(message) = written.next().await {
            if matches!(message, Message::Close(None)) {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn silent_viewer_is_dropped_at_pong_deadline() {
        let hub = hub(IDLE);
        let Peer {
            conn,
            mut written,
            feed: _feed,
            session,
        } = connect(&hub, 7, timings(Duration::from_millis(100), Duration::from_millis(100))).await;

        finished(session).await;
        assert!(conn.is_closed());
        unregistered(&hub).await;
        assert!(next_close(&mut written).await);
    }

    #[tokio::test]
    async fn closed_queue_sends_close_frame_after_frames() {
        let hub = hub(FAST);
        let Peer {
            conn,
            mut written,
            feed: _feed,
            session,
        } = connect(&hub, 7, timings(Duration::from_millis(100), IDLE)).await;

        let first = tokio::time::timeout(Duration::from_secs(2), written.next())
            .await
            .unwrap()
            .unwrap();
        match first {
            Message::Binary(bytes) => {
                assert_eq!(TelemetryFrame::decode(bytes.as_slice()).unwrap().driver_id, 7)
            }
            other => panic!("expected a status frame, got {other:?}"),
        }

        hub.unregister(&conn).await.unwrap();
        assert!(next_close(&mut written).await);
        finished(session).await;
    }

    #[tokio::test]
    async fn failed_write_ends_session_before_pong_deadline() {
        let hub = hub(FAST);
        let Peer {
            conn,
            written,
            feed: _feed,
            session,
        } = connect(&hub, 7, timings(Duration::from_secs(1), IDLE)).await;

        drop(written);
        finished(session).await;
        assert!(conn.is_closed());
        unregistered(&hub).await;
    }

    #[tokio::test]
    async fn viewer_close_frame_ends_session() {
        let hub = hub(IDLE);
        let Peer {
            conn,
            written: _written,
            feed,
            session,
        } = connect(&hub, 7, timings(Duration::from_millis(100), IDLE)).await;

        feed.unbounded_send(Ok(Message::Close(None))).unwrap();
        finished(session).await;
        assert!(conn.is_closed());
        unregistered(&hub).await;
    }
}
