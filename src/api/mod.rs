pub mod rest;
pub mod socket;

use crate::error::AppError;

/// Parses the `:id` path segment. Driver id 0 is reserved for "unset".
pub fn driver_id(raw: &str) -> Result<i32, AppError> {
    match raw.trim().parse::<i32>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(AppError::BadRequest(
            "Driver ID is missing, but required".to_string(),
        )),
    }
}
