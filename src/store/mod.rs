//! Geospatial index access: command builders, RESP transport, connection
//! pool, typed replies and the in-process store used for development.

pub mod command;
pub mod memory;
pub mod pool;
pub mod reply;
pub mod resp;
pub mod service;

use async_trait::async_trait;
use thiserror::Error;

pub use command::{Command, FieldMap, HookSpec, QueryFilters, WhereCondition, WhereInCondition};
pub use memory::MemoryStore;
pub use pool::{PoolConfig, StorePool};
pub use reply::{DriverRecord, LocationObject, NearbyObject, NearbyReply, StatusReply};
pub use service::GeoCommandService;

/// Collection holding every driver record.
pub const FLEET_COLLECTION: &str = "fleet";
pub const HOOK_PREFIX: &str = "HKDRIVER";
pub const SEARCH_NEARBY: &str = "nearby";
pub const DETECT_INSIDE: &str = "inside";
pub const DETECT_ENTER: &str = "enter";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0}")]
    Validation(String),

    #[error("store io: {0}")]
    Io(#[from] std::io::Error),

    #[error("store protocol: {0}")]
    Protocol(String),

    #[error("store replied with error: {0}")]
    Server(String),

    #[error("store reply decode: {0}")]
    Decode(String),
}

/// Executes one command and returns the raw reply body.
#[async_trait]
pub trait StoreTransport: Send + Sync {
    async fn execute(&self, command: &Command) -> Result<Vec<u8>, StoreError>;
}
