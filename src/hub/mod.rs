//! Realtime push hub: one registry task owns every viewer connection and is
//! reached only through `HubMessage`s. Each registered connection gets its
//! own status poller.

pub mod connection;
pub mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::telemetry::TelemetryFrame;
use crate::observability::metrics::Metrics;

pub use connection::{Connection, Outbound, PushError};

/// Read side used by pollers to build the frame pushed to a viewer.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn status_frame(&self, driver_id: i32) -> Result<TelemetryFrame, AppError>;
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub push_interval: Duration,
    pub queue_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_secs(5),
            queue_size: 256,
        }
    }
}

pub enum HubMessage {
    Register(Arc<Connection>),
    Unregister { driver_id: i32, conn_id: u64 },
    Broadcast(String),
}

#[derive(Debug, thiserror::Error)]
#[error("hub is not running")]
pub struct HubClosed;

/// Cheap handle to the registry task.
#[derive(Clone)]
pub struct HubHandle {
    id: Uuid,
    queue_size: usize,
    tx: mpsc::Sender<HubMessage>,
    count: watch::Receiver<usize>,
}

impl HubHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creates a connection sized for this hub; it is not registered yet.
    pub fn connection(&self, driver_id: i32) -> (Arc<Connection>, Outbound) {
        Connection::new(driver_id, self.queue_size)
    }

    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), HubClosed> {
        self.send(HubMessage::Register(conn)).await
    }

    pub async fn unregister(&self, conn: &Connection) -> Result<(), HubClosed> {
        self.send(HubMessage::Unregister {
            driver_id: conn.driver_id(),
            conn_id: conn.conn_id(),
        })
        .await
    }

    pub async fn broadcast(&self, text: String) -> Result<(), HubClosed> {
        self.send(HubMessage::Broadcast(text)).await
    }

    pub fn connection_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Follows the registered connection count.
    pub fn watch_count(&self) -> watch::Receiver<usize> {
        self.count.clone()
    }

    async fn send(&self, message: HubMessage) -> Result<(), HubClosed> {
        self.tx.send(message).await.map_err(|_| HubClosed)
    }
}

pub struct Hub {
    id: Uuid,
    config: HubConfig,
    connections: HashMap<i32, Arc<Connection>>,
    source: Arc<dyn StatusSource>,
    metrics: Metrics,
    count: watch::Sender<usize>,
    /// Given to pollers; the hub stops once every `HubHandle` is gone.
    inbox: mpsc::WeakSender<HubMessage>,
}

impl Hub {
    /// Starts the registry task. It stops once `shutdown` turns true, closing
    /// every registered connection, or once every `HubHandle` is dropped.
    pub fn spawn(
        config: HubConfig,
        source: Arc<dyn StatusSource>,
        metrics: Metrics,
        shutdown: watch::Receiver<bool>,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1024);
        let (count_tx, count_rx) = watch::channel(0);
        let id = Uuid::new_v4();

        let hub = Hub {
            id,
            connections: HashMap::new(),
            source,
            metrics,
            count: count_tx,
            inbox: tx.downgrade(),
            config: config.clone(),
        };
        let task = tokio::spawn(hub.run(rx, shutdown));

        (
            HubHandle {
                id,
                queue_size: config.queue_size,
                tx,
                count: count_rx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut rx: mpsc::Receiver<HubMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(hub_id = %self.id, "hub started");

        loop {
            // A dropped shutdown sender disables that branch only.
            let message = tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                Ok(_) = shutdown.wait_for(|stop| *stop) => break,
            };

            match message {
                HubMessage::Register(conn) => self.register(conn),
                HubMessage::Unregister { driver_id, conn_id } => self.unregister(driver_id, conn_id),
                HubMessage::Broadcast(text) => self.broadcast(text),
            }
            self.publish_count();
        }

        rx.close();
        for (_, conn) in self.connections.drain() {
            conn.close();
        }
        self.publish_count();
        info!(hub_id = %self.id, "hub stopped");
    }

    fn register(&mut self, conn: Arc<Connection>) {
        let driver_id = conn.driver_id();
        if let Some(previous) = self.connections.insert(driver_id, conn.clone()) {
            if previous.close() {
                self.evicted("replaced");
            }
            debug!(driver_id, conn_id = previous.conn_id(), "replaced viewer connection");
        }
        info!(driver_id, conn_id = conn.conn_id(), "viewer registered");

        tokio::spawn(poll_status(
            conn,
            self.source.clone(),
            self.config.push_interval,
            self.inbox.clone(),
            self.metrics.clone(),
        ));
    }

    fn unregister(&mut self, driver_id: i32, conn_id: u64) {
        let current = self
            .connections
            .get(&driver_id)
            .is_some_and(|conn| conn.conn_id() == conn_id);
        if !current {
            return;
        }
        if let Some(conn) = self.connections.remove(&driver_id) {
            conn.close();
            info!(driver_id, conn_id, "viewer unregistered");
        }
    }

    fn broadcast(&mut self, text: String) {
        let mut dropped = Vec::new();
        for (driver_id, conn) in &self.connections {
            if conn.try_push_text(text.clone()).is_err() {
                // A poller may have closed it first; count the eviction once.
                if conn.close() {
                    self.evicted("queue_full");
                    warn!(driver_id, "viewer evicted during broadcast");
                }
                dropped.push(*driver_id);
            }
        }
        for driver_id in dropped {
            self.connections.remove(&driver_id);
        }
    }

    fn evicted(&self, reason: &str) {
        self.metrics
            .hub_evictions_total
            .with_label_values(&[reason])
            .inc();
    }

    fn publish_count(&self) {
        let count = self.connections.len();
        self.count.send_replace(count);
        self.metrics.hub_connections.set(count as i64);
    }
}

/// Pushes the driver's status frame every `period` until the connection is
/// closed. Any push failure or status read failure evicts the connection.
async fn poll_status(
    conn: Arc<Connection>,
    source: Arc<dyn StatusSource>,
    period: Duration,
    hub: mpsc::WeakSender<HubMessage>,
    metrics: Metrics,
) {
    let driver_id = conn.driver_id();
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = conn.closed() => break,
        }

        let frame = match source.status_frame(driver_id).await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(driver_id, error = %err, "status read failed; dropping viewer");
                evict(&conn, &hub, &metrics, "status_error").await;
                break;
            }
        };

        match conn.try_push_status(frame.encode_to_vec()) {
            Ok(()) => {}
            Err(PushError::Full) => {
                warn!(driver_id, conn_id = conn.conn_id(), "viewer too slow; evicting");
                evict(&conn, &hub, &metrics, "queue_full").await;
                break;
            }
            Err(PushError::Closed) => {
                debug!(driver_id, conn_id = conn.conn_id(), "viewer writer gone; evicting");
                evict(&conn, &hub, &metrics, "closed").await;
                break;
            }
        }
    }

    debug!(driver_id, conn_id = conn.conn_id(), "status poller stopped");
}

async fn evict(
    conn: &Connection,
    hub: &mpsc::WeakSender<HubMessage>,
    metrics: &Metrics,
    reason: &str,
) {
    if conn.close() {
        metrics.hub_evictions_total.with_label_values(&[reason]).inc();
    }
    if let Some(tx) = hub.upgrade() {
        let _ = tx
            .send(HubMessage::Unregister {
                driver_id: conn.driver_id(),
                conn_id: conn.conn_id(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use prost::Message;
    use tokio::sync::watch;

    use super::{evict, Hub, HubConfig, HubHandle, StatusSource};
    use crate::error::AppError;
    use crate::models::driver::{DriverFields, GeoPoint};
    use crate::models::telemetry::TelemetryFrame;
    use crate::observability::metrics::Metrics;

    #[derive(Default)]
    struct FakeSource {
        missing: Mutex<HashSet<i32>>,
    }

    #[async_trait]
    impl StatusSource for FakeSource {
        async fn status_frame(&self, driver_id: i32) -> Result<TelemetryFrame, AppError> {
            if self.missing.lock().unwrap().contains(&driver_id) {
                return Err(AppError::NotFound("id not found".to_string()));
            }
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

    const FAST: Duration = Duration::from_millis(20);
    const IDLE: Duration = Duration::from_secs(60);

    fn hub(queue_size: usize, push_interval: Duration) -> (HubHandle, Arc<FakeSource>, Metrics) {
        let (handle, source, metrics, _) = hub_with_shutdown(queue_size, push_interval);
        (handle, source, metrics)
    }

    fn hub_with_shutdown(
        queue_size: usize,
        push_interval: Duration,
    ) -> (HubHandle, Arc<FakeSource>, Metrics, watch::Sender<bool>) {
        let source = Arc::new(FakeSource::default());
        let metrics = Metrics::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (handle, _task) = Hub::spawn(
            HubConfig {
                push_interval,
                queue_size,
            },
            source.clone(),
            metrics.clone(),
            stop_rx,
        );
        (handle, source, metrics, stop_tx)
    }

    async fn wait_for_count(count: &mut watch::Receiver<usize>, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), count.wait_for(|n| *n == expected))
            .await
            .expect("connection count not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn registered_viewer_receives_status_frames() {
        let (hub, _, _) = hub(8, FAST);
        let mut count = hub.watch_count();
        let (conn, mut outbound) = hub.connection(7);
        hub.register(conn).await.unwrap();
        wait_for_count(&mut count, 1).await;

        let bytes = tokio::time::timeout(Duration::from_secs(2), outbound.status.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = TelemetryFrame::decode(bytes.as_slice()).unwrap();
        assert_eq!(frame.driver_id, 7);
        assert_eq!(frame.fleet, "fleet");
    }

    #[tokio::test]
    async fn unregister_removes_and_closes_queues() {
        let (hub, _, _) = hub(8, IDLE);
        let mut count = hub.watch_count();
        let (conn, mut outbound) = hub.connection(7);
        hub.register(conn.clone()).await.unwrap();
        wait_for_count(&mut count, 1).await;

        hub.unregister(&conn).await.unwrap();
        hub.unregister(&conn).await.unwrap();
        wait_for_count(&mut count, 0).await;

        assert!(conn.is_closed());
        while outbound.status.recv().await.is_some() {}
        assert_eq!(outbound.text.recv().await, None);
    }

    #[tokio::test]
    async fn duplicate_driver_replaces_and_stale_unregister_is_ignored() {
        let (hub, _, metrics) = hub(8, IDLE);
        let mut count = hub.watch_count();
        let (first, _first_out) = hub.connection(7);
        let (second, _second_out) = hub.connection(7);

        hub.register(first.clone()).await.unwrap();
        hub.register(second.clone()).await.unwrap();
        hub.unregister(&first).await.unwrap();
        hub.broadcast("sync".to_string()).await.unwrap();
        wait_for_count(&mut count, 1).await;

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(hub.connection_count(), 1);
        assert_eq!(
            metrics
                .hub_evictions_total
                .with_label_values(&["replaced"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn saturated_viewer_is_evicted_without_affecting_others() {
        let (hub, _, metrics) = hub(1, FAST);
        let mut count = hub.watch_count();
        let (slow, _slow_out) = hub.connection(1);
        let (fast, mut fast_out) = hub.connection(2);
        hub.register(slow.clone()).await.unwrap();
        hub.register(fast.clone()).await.unwrap();

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), fast_out.status.recv())
                .await
                .unwrap()
                .unwrap();
        }
        wait_for_count(&mut count, 1).await;

        assert!(slow.is_closed());
        assert!(!fast.is_closed());
        assert_eq!(
            metrics
                .hub_evictions_total
                .with_label_values(&["queue_full"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn broadcast_evicts_full_queues_inline() {
        let (hub, _, _) = hub(1, IDLE);
        let mut count = hub.watch_count();
        let (slow, _slow_out) = hub.connection(1);
        let (fast, mut fast_out) = hub.connection(2);
        hub.register(slow.clone()).await.unwrap();
        hub.register(fast).await.unwrap();

        hub.broadcast("one".to_string()).await.unwrap();
        assert_eq!(fast_out.text.recv().await.as_deref(), Some("one"));
        hub.broadcast("two".to_string()).await.unwrap();
        assert_eq!(fast_out.text.recv().await.as_deref(), Some("two"));

        wait_for_count(&mut count, 1).await;
        assert!(slow.is_closed());
    }

    #[tokio::test]
    async fn failed_status_read_unregisters_viewer() {
        let (hub, source, _) = hub(8, FAST);
        source.missing.lock().unwrap().insert(9);
        let mut count = hub.watch_count();
        let (conn, _out) = hub.connection(9);

        hub.register(conn.clone()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), conn.closed())
            .await
            .unwrap();
        wait_for_count(&mut count, 0).await;
        assert_eq!(hub.connection_count(), 0);
    }

    fn evictions(metrics: &Metrics) -> u64 {
        ["queue_full", "closed", "replaced", "status_error"]
            .iter()
            .map(|reason| metrics.hub_evictions_total.with_label_values(&[reason]).get())
            .sum()
    }

    #[tokio::test]
    async fn dropped_writer_is_evicted_as_closed() {
        let (hub, _, metrics) = hub(8, FAST);
        let mut count = hub.watch_count();
        let (conn, outbound) = hub.connection(5);
        hub.register(conn.clone()).await.unwrap();
        wait_for_count(&mut count, 1).await;

        drop(outbound);
        wait_for_count(&mut count, 0).await;
        assert!(conn.is_closed());
        assert_eq!(
            metrics
                .hub_evictions_total
                .with_label_values(&["closed"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn poller_and_broadcast_evicting_together_count_once() {
        let (hub, _, metrics) = hub(1, IDLE);
        let mut count = hub.watch_count();
        let (conn, _out) = hub.connection(5);
        hub.register(conn.clone()).await.unwrap();
        wait_for_count(&mut count, 1).await;

        conn.try_push_text("queued".to_string()).unwrap();
        conn.try_push_status(vec![1]).unwrap();
        let inbox = hub.tx.downgrade();
        let (_, sent) = tokio::join!(
            evict(&conn, &inbox, &metrics, "queue_full"),
            hub.broadcast("overflow".to_string()),
        );
        sent.unwrap();
        wait_for_count(&mut count, 0).await;
        assert_eq!(evictions(&metrics), 1);

        // The stale unregister must not touch a successor for the same driver.
        let (next, _next_out) = hub.connection(5);
        hub.register(next.clone()).await.unwrap();
        hub.unregister(&conn).await.unwrap();
        hub.broadcast("sync".to_string()).await.unwrap();
        wait_for_count(&mut count, 1).await;
        assert!(!next.is_closed());
        assert_eq!(evictions(&metrics), 1);
    }

    #[tokio::test]
    async fn shutdown_closes_viewers_and_rejects_new_ones() {
        let (hub, _, _, stop) = hub_with_shutdown(8, IDLE);
        let mut count = hub.watch_count();
        let (conn, mut outbound) = hub.connection(3);
        hub.register(conn.clone()).await.unwrap();
        wait_for_count(&mut count, 1).await;

        stop.send(true).unwrap();
        wait_for_count(&mut count, 0).await;
        assert!(conn.is_closed());
        assert_eq!(outbound.text.recv().await, None);

        let (late, _late_out) = hub.connection(4);
        assert!(hub.register(late).await.is_err());
    }
}
