use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::error::AppError;
use crate::fleet::{FleetDirectory, FleetInfo};
use crate::hub::StatusSource;
use crate::models::driver::{field, DriverStatus, GeoPoint};
use crate::models::telemetry::TelemetryFrame;
use crate::store::{DriverRecord, FieldMap, GeoCommandService, StatusReply, FLEET_COLLECTION};

const NOT_FOUND: &str = "failed to retrieve object";
const BUSY_ON_JOB: &str = "cannot change driver availability because driver is busy on job";
const BUSY_NOT_ALLOWED: &str =
    "Set Driver busy not allowed, driver currently on job or currently not available";
const NOT_ON_JOB: &str = "Set Driver job complete or cancel not allowed, driver currently not on job";
const OTHER_JOB: &str = "Set Driver job complete or cancel not allowed, driver is on another job";
const NOT_AVAILABLE: &str = "cannot update driver location when driver is not available";

/// Owns the driver status rules. Holds no state of its own; every decision
/// is taken against the record just read from the store.
#[derive(Clone)]
pub struct DriverController {
    pub(crate) store: GeoCommandService,
    fleet: Arc<dyn FleetDirectory>,
}

impl DriverController {
    pub fn new(store: GeoCommandService, fleet: Arc<dyn FleetDirectory>) -> Self {
        Self { store, fleet }
    }

    pub async fn get_driver_status(&self, driver_id: i32) -> Result<DriverRecord, AppError> {
        let record = self.store.get_object(FLEET_COLLECTION, driver_id).await?;
        if !record.ok {
            return Err(AppError::NotFound(store_message(record.error, NOT_FOUND)));
        }
        Ok(record)
    }

    /// Switches a driver between Available and NotAvailable, creating the
    /// record on first use.
    pub async fn set_availability(
        &self,
        driver_id: i32,
        point: GeoPoint,
        status: DriverStatus,
    ) -> Result<StatusReply, AppError> {
        if status == DriverStatus::Busy {
            return Err(AppError::BadRequest(
                "Availability must be 0 or 1".to_string(),
            ));
        }

        let existing = self.store.get_object(FLEET_COLLECTION, driver_id).await?;
        if existing.exists() && existing.fields.status == DriverStatus::Busy {
            return Err(AppError::Conflict(BUSY_ON_JOB.to_string()));
        }

        let fleet = self.fleet.driver_fleet_info(driver_id).await?;
        let fields = upsert_fields(&existing, driver_id, &fleet, status, 0);
        let reply = self
            .store
            .set_object(FLEET_COLLECTION, driver_id, point, &fields)
            .await?;
        let reply = accepted(reply)?;

        info!(driver_id, status = %status, "driver availability updated");
        Ok(reply)
    }

    /// Upserts status and job. Every status other than Busy clears the job.
    pub async fn update_driver_status(
        &self,
        driver_id: i32,
        point: GeoPoint,
        status: DriverStatus,
        job_id: i64,
    ) -> Result<StatusReply, AppError> {
        let job_id = match status {
            DriverStatus::Busy if job_id == 0 => {
                return Err(AppError::BadRequest(
                    "Job ID is missing, but required when driver is busy".to_string(),
                ));
            }
            DriverStatus::Busy => job_id,
            _ => 0,
        };

        let existing = self.store.get_object(FLEET_COLLECTION, driver_id).await?;
        let fleet = self.fleet.driver_fleet_info(driver_id).await?;
        let fields = upsert_fields(&existing, driver_id, &fleet, status, job_id);
        let reply = self
            .store
            .set_object(FLEET_COLLECTION, driver_id, point, &fields)
            .await?;
        let reply = accepted(reply)?;

        info!(driver_id, status = %status, job_id, "driver status updated");
        Ok(reply)
    }

    pub async fn set_availability_busy(
        &self,
        driver_id: i32,
        job_id: i64,
    ) -> Result<StatusReply, AppError> {
        if job_id == 0 {
            return Err(AppError::BadRequest(
                "Job ID is missing, but required".to_string(),
            ));
        }

        let existing = self.store.get_object(FLEET_COLLECTION, driver_id).await?;
        if !existing.ok {
            return Err(AppError::NotFound(NOT_FOUND.to_string()));
        }
        if !existing.fields.status.can_accept_job() {
            return Err(AppError::Conflict(BUSY_NOT_ALLOWED.to_string()));
        }

        let fields = FieldMap::new()
            .with(field::STATUS, i32::from(DriverStatus::Busy))
            .with(field::JOB_ID, job_id)
            .with(field::LAST_UPDATED, now());
        let reply = self
            .store
            .set_field(FLEET_COLLECTION, driver_id, &fields)
            .await?;
        let reply = accepted(reply)?;

        info!(driver_id, job_id, "driver assigned to job");
        Ok(reply)
    }

    pub async fn set_driver_job_complete_or_cancel(
        &self,
        driver_id: i32,
        job_id: i64,
    ) -> Result<StatusReply, AppError> {
        let existing = self.store.get_object(FLEET_COLLECTION, driver_id).await?;
        if !existing.ok {
            return Err(AppError::NotFound(NOT_FOUND.to_string()));
        }
        if existing.fields.status != DriverStatus::Busy {
            return Err(AppError::Conflict(NOT_ON_JOB.to_string()));
        }
        if existing.fields.job_id != job_id {
            return Err(AppError::Conflict(OTHER_JOB.to_string()));
        }

        let fields = FieldMap::new()
            .with(field::STATUS, i32::from(DriverStatus::Available))
            .with(field::JOB_ID, 0)
            .with(field::LAST_UPDATED, now());
        let reply = self
            .store
            .set_field(FLEET_COLLECTION, driver_id, &fields)
            .await?;
        let reply = accepted(reply)?;

        info!(driver_id, job_id, "driver released from job");
        Ok(reply)
    }

    /// Moves a known driver's point. Status, job and fleet fields are untouched.
    pub async fn update_driver_location(
        &self,
        driver_id: i32,
        point: GeoPoint,
    ) -> Result<StatusReply, AppError> {
        let existing = self.store.get_object(FLEET_COLLECTION, driver_id).await?;
        if !existing.ok {
            return Err(AppError::NotFound(store_message(existing.error, NOT_FOUND)));
        }
        if existing.fields.status == DriverStatus::NotAvailable {
            return Err(AppError::Conflict(NOT_AVAILABLE.to_string()));
        }

        let fields = FieldMap::new().with(field::LAST_UPDATED, now());
        let reply = self
            .store
            .set_object(FLEET_COLLECTION, driver_id, point, &fields)
            .await?;
        accepted(reply)
    }
}

#[async_trait]
impl StatusSource for DriverController {
    async fn status_frame(&self, driver_id: i32) -> Result<TelemetryFrame, AppError> {
        let record = self.get_driver_status(driver_id).await?;
        let point = record
            .point()
            .ok_or_else(|| AppError::Store(format!("driver {driver_id} has no location")))?;
        Ok(TelemetryFrame::status_frame(
            FLEET_COLLECTION,
            &record.fields,
            point,
        ))
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

fn store_message(error: Option<String>, fallback: &str) -> String {
    error
        .filter(|msg| !msg.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

fn accepted(reply: StatusReply) -> Result<StatusReply, AppError> {
    if reply.ok {
        Ok(reply)
    } else {
        Err(AppError::Store(store_message(
            reply.error,
            "store rejected the command",
        )))
    }
}

fn upsert_fields(
    existing: &DriverRecord,
    driver_id: i32,
    fleet: &FleetInfo,
    status: DriverStatus,
    job_id: i64,
) -> FieldMap {
    let mut fields = FieldMap::new();
    if !existing.exists() {
        fields.set(field::DRIVER_ID, driver_id);
    }
    fields
        .with(field::PROVIDER_ID, fleet.provider_id)
        .with(field::STATUS, i32::from(status))
        .with(field::JOB_ID, job_id)
        .with(field::ACTIVE_SERVICE_ID, fleet.active_service_id)
        .with(field::ACTIVE_SERVICE_TYPE_ID, fleet.active_service_type_id)
        .with(field::PRIORITY, fleet.priority)
        .with(field::LAST_UPDATED, now())
}
