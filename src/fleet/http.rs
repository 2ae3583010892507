use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::fleet::{FleetDirectory, FleetError, FleetInfo};

const DRIVER_FLEET_PATH: &str = "/api/driver/fleet";

#[derive(Deserialize)]
struct FleetResponse {
    #[serde(default)]
    data: FleetInfo,
}

/// Fleet directory backed by the fleet management service.
pub struct HttpFleetDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFleetDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FleetError::Request(format!("failed to create http client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn driver_url(&self, driver_id: i32) -> String {
        format!("{}{DRIVER_FLEET_PATH}/{driver_id}", self.base_url)
    }
}

#[async_trait]
impl FleetDirectory for HttpFleetDirectory {
    async fn driver_fleet_info(&self, driver_id: i32) -> Result<FleetInfo, FleetError> {
        if driver_id == 0 {
            return Err(FleetError::Validation("Driver ID is zero.".to_string()));
        }

        let url = self.driver_url(driver_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FleetError::Request(format!("error sending request {url}: {err}")))?;

        if !response.status().is_success() {
            return Err(FleetError::Request(format!(
                "HTTP {} from {url}",
                response.status()
            )));
        }

        let body: FleetResponse = response
            .json()
            .await
            .map_err(|err| FleetError::Request(format!("invalid fleet response from {url}: {err}")))?;

        debug!(driver_id, info = ?body.data, "driver fleet info");
        body.data.validate(driver_id)
    }
}
