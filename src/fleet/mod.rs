//! Fleet metadata: which provider and active service a driver belongs to.

pub mod http;

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpFleetDirectory;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("{0}")]
    Validation(String),

    #[error("fleet request failed: {0}")]
    Request(String),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetInfo {
    #[serde(rename = "driverid", default)]
    pub driver_id: i32,
    #[serde(rename = "providerid", default)]
    pub provider_id: i32,
    #[serde(rename = "activeserviceid", default)]
    pub active_service_id: i32,
    #[serde(rename = "activeservicetypeid", default)]
    pub active_service_type_id: i32,
    #[serde(default)]
    pub priority: i32,
}

impl FleetInfo {
    /// Rejects assignments a driver cannot be tracked under.
    pub fn validate(self, driver_id: i32) -> Result<Self, FleetError> {
        if self.driver_id == 0 || self.provider_id == 0 {
            return Err(FleetError::Invalid(format!(
                "Driver Fleet info invalid or not found for id: {driver_id}"
            )));
        }
        if self.active_service_type_id == 0 || self.active_service_id == 0 {
            return Err(FleetError::Invalid(format!(
                "No active service configured for id: {driver_id}"
            )));
        }
        Ok(self)
    }
}

#[async_trait]
pub trait FleetDirectory: Send + Sync {
    async fn driver_fleet_info(&self, driver_id: i32) -> Result<FleetInfo, FleetError>;
}

/// Fixed assignments, used for local runs (`FLEET_BASE_URL=static`) and tests.
/// Drivers without an explicit entry fall back to the default assignment
/// when one is set.
#[derive(Debug, Clone, Default)]
pub struct StaticFleetDirectory {
    drivers: HashMap<i32, FleetInfo>,
    fallback: Option<FleetInfo>,
}

impl StaticFleetDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(mut self, info: FleetInfo) -> Self {
        self.drivers.insert(info.driver_id, info);
        self
    }

    pub fn with_fallback(mut self, provider_id: i32, service_id: i32, service_type_id: i32) -> Self {
        self.fallback = Some(FleetInfo {
            driver_id: 0,
            provider_id,
            active_service_id: service_id,
            active_service_type_id: service_type_id,
            priority: 0,
        });
        self
    }
}

#[async_trait]
impl FleetDirectory for StaticFleetDirectory {
    async fn driver_fleet_info(&self, driver_id: i32) -> Result<FleetInfo, FleetError> {
        if driver_id == 0 {
            return Err(FleetError::Validation("Driver ID is zero.".to_string()));
        }

        let info = match (self.drivers.get(&driver_id), &self.fallback) {
            (Some(info), _) => info.clone(),
            (None, Some(fallback)) => FleetInfo {
                driver_id,
                ..fallback.clone()
            },
            (None, None) => FleetInfo::default(),
        };
        info.validate(driver_id)
    }
}
