use std::sync::Arc;

use crate::config::Config;
use crate::engine::DriverController;
use crate::hub::HubHandle;
use crate::observability::metrics::Metrics;

pub struct AppState {
    pub controller: Arc<DriverController>,
    pub hub: HubHandle,
    pub config: Config,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(
        controller: Arc<DriverController>,
        hub: HubHandle,
        config: Config,
        metrics: Metrics,
    ) -> Self {
        Self {
            controller,
            hub,
            config,
            metrics,
        }
    }
}
