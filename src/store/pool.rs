//! Bounded idle pool of RESP connections to the geospatial index.
//!
//! Connections are dialed on demand, authenticated and switched to JSON
//! output once, then reused. A borrowed idle connection is probed with PING
//! before use; one that fails at transport level is dropped, never returned.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tracing::debug;

use crate::store::command::{self, Command};
use crate::store::resp::{self, Reply};
use crate::store::{StoreError, StoreTransport};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub addr: String,
    pub password: Option<String>,
    pub max_idle: usize,
    /// Idle connections older than this are closed on the next checkout.
    /// Zero disables expiry.
    pub idle_timeout: Duration,
    /// Applies to dialing and to each command round trip.
    pub timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:9851".to_string(),
            password: None,
            max_idle: 3,
            idle_timeout: Duration::from_secs(240),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct StoreConnection {
    stream: BufStream<TcpStream>,
    timeout: Duration,
}

impl StoreConnection {
    pub async fn dial(config: &PoolConfig) -> Result<Self, StoreError> {
        let stream = tokio::time::timeout(config.timeout, TcpStream::connect(&config.addr))
            .await
            .map_err(|_| timed_out("connect"))??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream: BufStream::new(stream),
            timeout: config.timeout,
        };

        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            conn.round_trip(&command::auth(password)).await?.into_body()?;
        }
        conn.round_trip(&command::output_json()).await?.into_body()?;

        debug!(addr = %config.addr, "store connection established");
        Ok(conn)
    }

    pub async fn round_trip(&mut self, command: &Command) -> Result<Reply, StoreError> {
        let stream = &mut self.stream;
        let exchange = async move {
            stream.write_all(&resp::encode(command)).await?;
            stream.flush().await?;
            resp::read_reply(stream).await
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| timed_out("command"))?
    }

    async fn is_alive(&mut self) -> bool {
        match self.round_trip(&command::ping()).await.and_then(Reply::into_body) {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "discarding stale store connection");
                false
            }
        }
    }
}

fn timed_out(stage: &str) -> StoreError {
    StoreError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("store {stage} timed out"),
    ))
}

struct IdleConnection {
    conn: StoreConnection,
    returned_at: Instant,
}

pub struct StorePool {
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConnection>>,
}

impl StorePool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            idle: Mutex::new(VecDeque::with_capacity(config.max_idle)),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Hands out the most recently returned live connection, or dials a new one.
    pub async fn checkout(&self) -> Result<StoreConnection, StoreError> {
        while let Some(mut conn) = self.pop_idle() {
            if conn.is_alive().await {
                return Ok(conn);
            }
        }
        StoreConnection::dial(&self.config).await
    }

    /// Returns a healthy connection; it is closed instead when the pool is full.
    pub fn checkin(&self, conn: StoreConnection) {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        if idle.len() < self.config.max_idle {
            idle.push_back(IdleConnection {
                conn,
                returned_at: Instant::now(),
            });
        }
    }

    fn pop_idle(&self) -> Option<StoreConnection> {
        let mut idle = self.idle.lock().unwrap_or_else(|p| p.into_inner());
        let idle_timeout = self.config.idle_timeout;
        if !idle_timeout.is_zero() {
            idle.retain(|entry| entry.returned_at.elapsed() < idle_timeout);
        }
        idle.pop_back().map(|entry| entry.conn)
    }
}

#[async_trait]
impl StoreTransport for StorePool {
    async fn execute(&self, command: &Command) -> Result<Vec<u8>, StoreError> {
        let mut conn = self.checkout().await?;
        let reply = conn.round_trip(command).await?;
        // An error reply is still a complete exchange; the connection stays usable.
        self.checkin(conn);
        reply.into_body()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::io::{AsyncWriteExt, BufStream};
    use tokio::net::TcpListener;

    use super::{PoolConfig, StorePool};
    use crate::store::command::{self, Command};
    use crate::store::resp::{read_reply, Reply};
    use crate::store::{StoreError, StoreTransport};

    struct FakeStore {
        addr: String,
        accepted: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<String>>>,
    }

    async fn fake_store() -> FakeStore {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let (accepted_in, log_in) = (accepted.clone(), log.clone());
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted_in.fetch_add(1, Ordering::SeqCst);
                let log = log_in.clone();
                tokio::spawn(async move {
                    let mut stream = BufStream::new(socket);
                    while let Ok(Reply::Array(Some(items))) = read_reply(&mut stream).await {
                        let words: Vec<String> = items
                            .into_iter()
                            .filter_map(|item| match item {
                                Reply::Bulk(Some(bytes)) => String::from_utf8(bytes).ok(),
                                _ => None,
                            })
                            .collect();
                        let reply: &[u8] = match words.first().map(String::as_str) {
                            Some("PING" | "AUTH" | "OUTPUT") => b"+OK\r\n",
                            Some("GET") => b"$11\r\n{\"ok\":true}\r\n",
                            _ => b"-ERR unknown command\r\n",
                        };
                        log.lock().unwrap().push(words.join(" "));
                        if stream.write_all(reply).await.is_err() || stream.flush().await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        FakeStore { addr, accepted, log }
    }

    fn pool_for(store: &FakeStore) -> StorePool {
        StorePool::new(PoolConfig {
            addr: store.addr.clone(),
            ..PoolConfig::default()
        })
    }

    #[tokio::test]
    async fn dial_switches_output_to_json() {
        let store = fake_store().await;
        let pool = pool_for(&store);

        let body = pool.execute(&command::get("fleet", 1)).await.unwrap();
        assert_eq!(body, b"{\"ok\":true}".to_vec());

        let log = store.log.lock().unwrap().clone();
        assert_eq!(log, vec!["OUTPUT json", "GET fleet 1 WITHFIELDS"]);
    }

    #[tokio::test]
    async fn password_is_sent_before_anything_else() {
        let store = fake_store().await;
        let pool = StorePool::new(PoolConfig {
            addr: store.addr.clone(),
            password: Some("secret".to_string()),
            ..PoolConfig::default()
        });

        pool.execute(&command::ping()).await.unwrap();
        assert_eq!(store.log.lock().unwrap()[0], "AUTH secret");
    }

    #[tokio::test]
    async fn idle_connection_is_reused_after_ping() {
        let store = fake_store().await;
        let pool = pool_for(&store);

        pool.execute(&command::get("fleet", 1)).await.unwrap();
        pool.execute(&command::get("fleet", 2)).await.unwrap();

        assert_eq!(store.accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 1);
        assert!(store.log.lock().unwrap().contains(&"PING".to_string()));
    }

    #[tokio::test]
    async fn never_keeps_more_than_max_idle() {
        let store = fake_store().await;
        let pool = StorePool::new(PoolConfig {
            addr: store.addr.clone(),
            max_idle: 1,
            ..PoolConfig::default()
        });

        let first = pool.checkout().await.unwrap();
        let second = pool.checkout().await.unwrap();
        pool.checkin(first);
        pool.checkin(second);

        assert_eq!(store.accepted.load(Ordering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn expired_idle_connection_is_replaced() {
        let store = fake_store().await;
        let pool = StorePool::new(PoolConfig {
            addr: store.addr.clone(),
            idle_timeout: Duration::from_millis(20),
            ..PoolConfig::default()
        });

        pool.execute(&command::ping()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        pool.execute(&command::ping()).await.unwrap();

        assert_eq!(store.accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_reply_keeps_connection() {
        let store = fake_store().await;
        let pool = pool_for(&store);

        let err = pool.execute(&Command::new("BOGUS")).await.unwrap_err();
        assert!(matches!(err, StoreError::Server(msg) if msg.contains("unknown command")));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let pool = StorePool::new(PoolConfig {
            addr,
            ..PoolConfig::default()
        });
        let err = pool.execute(&command::ping()).await.unwrap_err();
        assert!(matches!(err, StoreError::Io(_)));
        assert_eq!(pool.idle_count(), 0);
    }
}
