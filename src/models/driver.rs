use std::fmt;

use serde::{Deserialize, Serialize};

/// Store field names of a driver record.
pub mod field {
    pub const DRIVER_ID: &str = "driverid";
    pub const PROVIDER_ID: &str = "providerid";
    pub const STATUS: &str = "driverstatus";
    pub const JOB_ID: &str = "jobid";
    pub const ACTIVE_SERVICE_ID: &str = "activeserviceid";
    pub const ACTIVE_SERVICE_TYPE_ID: &str = "activeservicetypeid";
    pub const PRIORITY: &str = "priority";
    pub const LAST_UPDATED: &str = "lastupdatedtime";
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(into = "i32")]
pub enum DriverStatus {
    #[default]
    NotAvailable = 0,
    Available = 1,
    Busy = 2,
}

impl DriverStatus {
    pub fn can_accept_job(self) -> bool {
        self == DriverStatus::Available
    }

    /// Parses the `avail` strings used by the REST API.
    pub fn from_avail(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" => Some(DriverStatus::NotAvailable),
            "1" => Some(DriverStatus::Available),
            "2" => Some(DriverStatus::Busy),
            _ => None,
        }
    }
}

impl From<DriverStatus> for i32 {
    fn from(status: DriverStatus) -> Self {
        status as i32
    }
}

impl TryFrom<i64> for DriverStatus {
    type Error = String;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(DriverStatus::NotAvailable),
            1 => Ok(DriverStatus::Available),
            2 => Ok(DriverStatus::Busy),
            other => Err(format!("unknown driver status {other}")),
        }
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DriverStatus::NotAvailable => "Not Available",
            DriverStatus::Available => "Available",
            DriverStatus::Busy => "Busy",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriverFields {
    #[serde(rename = "driverid")]
    pub driver_id: i32,
    #[serde(rename = "providerid")]
    pub provider_id: i32,
    #[serde(rename = "driverstatus")]
    pub status: DriverStatus,
    #[serde(rename = "jobid")]
    pub job_id: i64,
    #[serde(rename = "activeserviceid")]
    pub active_service_id: i32,
    #[serde(rename = "activeservicetypeid")]
    pub active_service_type_id: i32,
    pub priority: i32,
    #[serde(rename = "lastupdatedtime")]
    pub last_updated: i64,
}

/// Geofence event families; each maps to its own hook name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    Arriving,
    Arrived,
}

impl HookType {
    pub fn title(self) -> &'static str {
        match self {
            HookType::Arriving => "Arriving",
            HookType::Arrived => "Arrived",
        }
    }
}
