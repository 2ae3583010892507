use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, Notify};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The viewer is not draining its queue.
    Full,
    Closed,
}

struct Queues {
    text: mpsc::Sender<String>,
    status: mpsc::Sender<Vec<u8>>,
}

/// Receiving ends of a connection's queues, drained by the writer task.
/// Both yield `None` once the connection is closed and drained.
pub struct Outbound {
    pub text: mpsc::Receiver<String>,
    pub status: mpsc::Receiver<Vec<u8>>,
}

/// One viewer session: a driver id plus two bounded outbound queues.
///
/// Closing drops the queue senders exactly once; later closes and pushes are
/// no-ops, so the hub, the poller and the reader may all evict the same
/// connection without coordinating.
pub struct Connection {
    driver_id: i32,
    conn_id: u64,
    queues: Mutex<Option<Queues>>,
    closed: Notify,
}

impl Connection {
    pub fn new(driver_id: i32, capacity: usize) -> (Arc<Self>, Outbound) {
        let capacity = capacity.max(1);
        let (text_tx, text_rx) = mpsc::channel(capacity);
        let (status_tx, status_rx) = mpsc::channel(capacity);

        let connection = Arc::new(Self {
            driver_id,
            conn_id: NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed),
            queues: Mutex::new(Some(Queues {
                text: text_tx,
                status: status_tx,
            })),
            closed: Notify::new(),
        });

        (
            connection,
            Outbound {
                text: text_rx,
                status: status_rx,
            },
        )
    }

    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn try_push_status(&self, frame: Vec<u8>) -> Result<(), PushError> {
        let queues = self.lock();
        let queues = queues.as_ref().ok_or(PushError::Closed)?;
        queues.status.try_send(frame).map_err(push_error)
    }

    pub fn try_push_text(&self, text: String) -> Result<(), PushError> {
        let queues = self.lock();
        let queues = queues.as_ref().ok_or(PushError::Closed)?;
        queues.text.try_send(text).map_err(push_error)
    }

    /// Returns `true` only for the call that actually closed the queues.
    pub fn close(&self) -> bool {
        let closed = self.lock().take().is_some();
        if closed {
            self.closed.notify_waiters();
        }
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let notified = self.closed.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    fn lock(&self) -> MutexGuard<'_, Option<Queues>> {
        self.queues.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn push_error<T>(err: mpsc::error::TrySendError<T>) -> PushError {
    match err {
        mpsc::error::TrySendError::Full(_) => PushError::Full,
        mpsc::error::TrySendError::Closed(_) => PushError::Closed,
    }
}
