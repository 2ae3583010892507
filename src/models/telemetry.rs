//! Binary telemetry record shared by the UDP ingestion path and the
//! websocket status push. Encoded as protobuf so field devices and viewers
//! can use any protobuf runtime.

use prost::Message;
use thiserror::Error;

use crate::models::driver::{DriverFields, DriverStatus, GeoPoint};

/// Largest datagram the ingestion listener accepts.
pub const MAX_DATAGRAM_SIZE: usize = 64;

#[derive(Clone, PartialEq, Message)]
pub struct TelemetryFrame {
    #[prost(string, tag = "1")]
    pub fleet: String,
    #[prost(int32, tag = "2")]
    pub driver_id: i32,
    #[prost(int32, tag = "3")]
    pub provider_id: i32,
    #[prost(float, tag = "4")]
    pub lat: f32,
    #[prost(float, tag = "5")]
    pub lng: f32,
    #[prost(enumeration = "FrameStatus", tag = "6")]
    pub status: i32,
    #[prost(int64, tag = "7")]
    pub timestamp: i64,
    #[prost(int64, tag = "8")]
    pub job_id: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FrameStatus {
    NotAvailable = 0,
    Available = 1,
    Busy = 2,
}

impl From<DriverStatus> for FrameStatus {
    fn from(status: DriverStatus) -> Self {
        match status {
            DriverStatus::NotAvailable => FrameStatus::NotAvailable,
            DriverStatus::Available => FrameStatus::Available,
            DriverStatus::Busy => FrameStatus::Busy,
        }
    }
}

impl From<FrameStatus> for DriverStatus {
    fn from(status: FrameStatus) -> Self {
        match status {
            FrameStatus::NotAvailable => DriverStatus::NotAvailable,
            FrameStatus::Available => DriverStatus::Available,
            FrameStatus::Busy => DriverStatus::Busy,
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] prost::DecodeError),

    #[error("frame has no driver id")]
    MissingDriverId,
}

impl TelemetryFrame {
    /// Builds the status frame pushed to viewers from a stored record.
    pub fn status_frame(fleet: &str, fields: &DriverFields, point: GeoPoint) -> Self {
        let mut frame = TelemetryFrame {
            fleet: fleet.to_string(),
            driver_id: fields.driver_id,
            provider_id: fields.provider_id,
            lat: point.lat as f32,
            lng: point.lng as f32,
            status: 0,
            timestamp: fields.last_updated,
            job_id: fields.job_id,
        };
        frame.set_status(fields.status.into());
        frame
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(f64::from(self.lat), f64::from(self.lng))
    }

    pub fn driver_status(&self) -> DriverStatus {
        self.status().into()
    }
}

/// Decodes one datagram. Driver id 0 is reserved as "unset" and rejected.
pub fn decode_frame(bytes: &[u8]) -> Result<TelemetryFrame, FrameError> {
    let frame = TelemetryFrame::decode(bytes)?;
    if frame.driver_id == 0 {
        return Err(FrameError::MissingDriverId);
    }
    Ok(frame)
}
