use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::models::driver::GeoPoint;
use crate::observability::metrics::Metrics;
use crate::store::command::{self, Command, FieldMap, HookSpec, QueryFilters};
use crate::store::reply::{DriverRecord, NearbyReply, StatusReply};
use crate::store::{StoreError, StoreTransport};

/// Typed operations over the geospatial index. Inputs are validated before
/// any round trip; each operation issues exactly one command.
#[derive(Clone)]
pub struct GeoCommandService {
    transport: Arc<dyn StoreTransport>,
    metrics: Metrics,
}

impl GeoCommandService {
    pub fn new(transport: Arc<dyn StoreTransport>, metrics: Metrics) -> Self {
        Self { transport, metrics }
    }

    pub async fn get_object(&self, key: &str, id: i32) -> Result<DriverRecord, StoreError> {
        validate_target(key, id)?;
        let body = self.dispatch(command::get(key, id)).await?;
        DriverRecord::decode(&body)
    }

    pub async fn set_object(
        &self,
        key: &str,
        id: i32,
        point: GeoPoint,
        fields: &FieldMap,
    ) -> Result<StatusReply, StoreError> {
        validate_target(key, id)?;
        let body = self.dispatch(command::set(key, id, point, fields)).await?;
        StatusReply::decode(&body)
    }

    pub async fn set_field(
        &self,
        key: &str,
        id: i32,
        fields: &FieldMap,
    ) -> Result<StatusReply, StoreError> {
        validate_target(key, id)?;
        if fields.is_empty() {
            return Err(invalid("Fields are not set"));
        }
        let body = self.dispatch(command::fset(key, id, fields)).await?;
        StatusReply::decode(&body)
    }

    pub async fn nearby_object(
        &self,
        key: &str,
        point: GeoPoint,
        radius: u32,
        limit: u32,
        filters: &QueryFilters,
    ) -> Result<NearbyReply, StoreError> {
        if key.is_empty() {
            return Err(invalid("Key is not set"));
        }
        if radius == 0 {
            return Err(invalid("Radius must be greater than zero"));
        }
        if limit == 0 {
            return Err(invalid("Limit must be greater than zero"));
        }
        let body = self
            .dispatch(command::nearby(key, point, radius, limit, filters))
            .await?;
        NearbyReply::decode(&body)
    }

    pub async fn set_hook(&self, spec: &HookSpec) -> Result<StatusReply, StoreError> {
        validate_hook(&spec.topic, &spec.search_type, &spec.key, spec.id)?;
        if spec.endpoints.iter().all(|endpoint| endpoint.trim().is_empty()) {
            return Err(invalid("Hook endpoints are not set"));
        }
        if spec.radius == 0 {
            return Err(invalid("Radius must be greater than zero"));
        }
        let body = self.dispatch(command::set_hook(spec)).await?;
        StatusReply::decode(&body)
    }

    pub async fn del_hook(
        &self,
        topic: &str,
        search_type: &str,
        key: &str,
        id: i32,
    ) -> Result<StatusReply, StoreError> {
        validate_hook(topic, search_type, key, id)?;
        let name = command::hook_name(topic, key, &command::object_id(id));
        let body = self.dispatch(command::del_hook(&name)).await?;
        StatusReply::decode(&body)
    }

    async fn dispatch(&self, command: Command) -> Result<Vec<u8>, StoreError> {
        let name = command.name();
        let started = Instant::now();
        debug!(command = %command, "store command");

        let result = self.transport.execute(&command).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(StoreError::Server(_)) => "server_error",
            Err(_) => "transport_error",
        };
        self.metrics
            .store_commands_total
            .with_label_values(&[name, outcome])
            .inc();
        self.metrics
            .store_command_latency_seconds
            .with_label_values(&[name])
            .observe(started.elapsed().as_secs_f64());

        if let Err(err) = &result {
            debug!(command = name, error = %err, "store command failed");
        }
        result
    }
}

fn invalid(message: &str) -> StoreError {
    StoreError::Validation(message.to_string())
}

fn validate_target(key: &str, id: i32) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(invalid("Key is not set"));
    }
    if id == 0 {
        return Err(invalid("Id is not set"));
    }
    Ok(())
}

fn validate_hook(topic: &str, search_type: &str, key: &str, id: i32) -> Result<(), StoreError> {
    if topic.is_empty() {
        return Err(invalid("Hook topic is not set"));
    }
    if search_type.is_empty() {
        return Err(invalid("Search type is not set"));
    }
    validate_target(key, id)
}
