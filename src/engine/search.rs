//! Tiered proximity search and geofence arming on top of the controller.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::AppError;
use crate::engine::controller::DriverController;
use crate::geo::distance_m;
use crate::models::driver::{field, DriverFields, DriverStatus, GeoPoint, HookType};
use crate::store::command::hook_topic;
use crate::store::{
    HookSpec, LocationObject, NearbyReply, QueryFilters, StatusReply, WhereInCondition,
    DETECT_ENTER, DETECT_INSIDE, FLEET_COLLECTION, SEARCH_NEARBY,
};

pub const SEARCH_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AvailabilityFilter {
    #[default]
    Any,
    Available,
    /// Matches both NotAvailable and Busy drivers.
    NotAvailable,
}

impl AvailabilityFilter {
    /// `"1"` and `"0"` select; anything else (including `"all"`) matches every driver.
    pub fn from_param(raw: &str) -> Self {
        match raw.trim() {
            "1" => AvailabilityFilter::Available,
            "0" => AvailabilityFilter::NotAvailable,
            _ => AvailabilityFilter::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PriorityFilter {
    #[default]
    Any,
    Priority,
    Regular,
}

impl PriorityFilter {
    pub fn from_param(raw: &str) -> Self {
        match raw.trim() {
            "1" => PriorityFilter::Priority,
            "0" => PriorityFilter::Regular,
            _ => PriorityFilter::Any,
        }
    }
}

/// Optional search constraints; zero ids mean "any".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub provider_id: i32,
    pub availability: AvailabilityFilter,
    pub service_type_id: i32,
    pub service_id: i32,
    pub priority: PriorityFilter,
}

impl SearchFilters {
    pub fn to_query(&self) -> QueryFilters {
        let mut where_in = Vec::new();
        let mut push = |name: &'static str, values: Vec<i64>| {
            where_in.push(WhereInCondition {
                field: name,
                values,
            });
        };

        if self.provider_id != 0 {
            push(field::PROVIDER_ID, vec![self.provider_id.into()]);
        }
        match self.availability {
            AvailabilityFilter::Available => push(field::STATUS, vec![status(DriverStatus::Available)]),
            AvailabilityFilter::NotAvailable => push(
                field::STATUS,
                vec![status(DriverStatus::NotAvailable), status(DriverStatus::Busy)],
            ),
            AvailabilityFilter::Any => {}
        }
        if self.service_type_id != 0 {
            push(field::ACTIVE_SERVICE_TYPE_ID, vec![self.service_type_id.into()]);
        }
        if self.service_id != 0 {
            push(field::ACTIVE_SERVICE_ID, vec![self.service_id.into()]);
        }
        match self.priority {
            PriorityFilter::Priority => push(field::PRIORITY, vec![1]),
            PriorityFilter::Regular => push(field::PRIORITY, vec![0]),
            PriorityFilter::Any => {}
        }

        QueryFilters {
            where_list: Vec::new(),
            where_in,
        }
    }
}

fn status(status: DriverStatus) -> i64 {
    i32::from(status).into()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyDriver {
    pub id: String,
    pub object: LocationObject,
    pub fields: DriverFields,
    /// Meters from the query point.
    pub distance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyDrivers {
    pub ok: bool,
    pub collection: &'static str,
    pub objects: Vec<NearbyDriver>,
    pub count: usize,
    pub cursor: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
}

impl NearbyDrivers {
    fn from_reply(reply: NearbyReply, origin: GeoPoint, excluded: &HashSet<String>) -> Self {
        let objects: Vec<NearbyDriver> = reply
            .objects
            .into_iter()
            .filter(|object| !excluded.contains(&object.id))
            .map(|object| NearbyDriver {
                distance: distance_m(&origin, &object.object.point()),
                id: object.id,
                object: object.object,
                fields: object.fields,
            })
            .collect();

        Self {
            ok: reply.ok,
            collection: FLEET_COLLECTION,
            count: objects.len(),
            objects,
            cursor: reply.cursor,
            elapsed: reply.elapsed,
        }
    }
}

impl DriverController {
    pub async fn search_nearby_driver(
        &self,
        limit: u32,
        point: GeoPoint,
        search_radius: u32,
        filters: &SearchFilters,
    ) -> Result<NearbyDrivers, AppError> {
        self.search_nearby_driver_by_provider_id(limit, point, search_radius, 0, filters)
            .await
    }

    /// Searches the ring between `filter_radius` and `search_radius`: every
    /// driver found within `filter_radius` is left out of the result.
    pub async fn search_nearby_driver_by_provider_id(
        &self,
        limit: u32,
        point: GeoPoint,
        search_radius: u32,
        filter_radius: u32,
        filters: &SearchFilters,
    ) -> Result<NearbyDrivers, AppError> {
        let query = filters.to_query();

        let mut excluded = HashSet::new();
        if filter_radius > 0 {
            let inner = self
                .store
                .nearby_object(FLEET_COLLECTION, point, filter_radius, limit, &query)
                .await?;
            excluded.extend(ok_nearby(inner)?.objects.into_iter().map(|object| object.id));
        }

        let outer = self
            .store
            .nearby_object(FLEET_COLLECTION, point, search_radius, limit, &query)
            .await?;
        let result = NearbyDrivers::from_reply(ok_nearby(outer)?, point, &excluded);

        debug!(
            search_radius,
            filter_radius,
            excluded = excluded.len(),
            found = result.count,
            "nearby drivers searched"
        );
        Ok(result)
    }

    /// Arms a `nearby` geofence around `point` that fires when a matching
    /// driver is inside or enters it.
    pub async fn detect_nearby_driver(
        &self,
        id: i32,
        point: GeoPoint,
        hook_type: HookType,
        endpoints: &[String],
        radius: u32,
        filters: &SearchFilters,
    ) -> Result<StatusReply, AppError> {
        let spec = HookSpec {
            endpoints: endpoints.to_vec(),
            topic: hook_topic(hook_type),
            search_type: SEARCH_NEARBY.to_string(),
            key: FLEET_COLLECTION.to_string(),
            id,
            point,
            radius,
            detect: vec![DETECT_INSIDE.to_string(), DETECT_ENTER.to_string()],
            commands: Vec::new(),
            filters: filters.to_query(),
        };

        let reply = self.store.set_hook(&spec).await?;
        if !reply.ok {
            return Err(store_rejected(reply.error));
        }

        info!(hook = %spec.name(), radius, "geofence armed");
        Ok(reply)
    }

    pub async fn stop_detect_nearby_driver(
        &self,
        id: i32,
        hook_type: HookType,
    ) -> Result<StatusReply, AppError> {
        let topic = hook_topic(hook_type);
        let reply = self
            .store
            .del_hook(&topic, SEARCH_NEARBY, FLEET_COLLECTION, id)
            .await?;
        if !reply.ok {
            return Err(store_rejected(reply.error));
        }

        info!(topic = %topic, id, "geofence disarmed");
        Ok(reply)
    }
}

fn ok_nearby(reply: NearbyReply) -> Result<NearbyReply, AppError> {
    if reply.ok {
        Ok(reply)
    } else {
        Err(store_rejected(reply.error))
    }
}

fn store_rejected(error: Option<String>) -> AppError {
    AppError::Store(error.unwrap_or_else(|| "store rejected the command".to_string()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::{AvailabilityFilter, PriorityFilter, SearchFilters, SEARCH_LIMIT};
    use crate::engine::controller::DriverController;
    use crate::fleet::StaticFleetDirectory;
    use crate::models::driver::{DriverStatus, GeoPoint, HookType};
    use crate::observability::metrics::Metrics;
    use crate::store::command::nearby;
    use crate::store::{GeoCommandService, MemoryStore};

    fn controller() -> (DriverController, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let controller = DriverController::new(
            GeoCommandService::new(store.clone(), Metrics::new()),
            Arc::new(StaticFleetDirectory::new().with_fallback(999, 3, 4)),
        );
        (controller, store)
    }

    fn origin() -> GeoPoint {
        GeoPoint::new(21.0, 105.8)
    }

    /// Places drivers roughly `meters` north of the origin.
    async fn place(controller: &DriverController, id: i32, meters: f64) {
        let point = GeoPoint::new(21.0 + meters / 111_195.0, 105.8);
        controller
            .set_availability(id, point, DriverStatus::Available)
            .await
            .unwrap();
    }

    #[test]
    fn filters_build_clauses_in_fixed_order() {
        let filters = SearchFilters {
            provider_id: 999,
            availability: AvailabilityFilter::NotAvailable,
            service_type_id: 4,
            service_id: 3,
            priority: PriorityFilter::Regular,
        };
        let command = nearby("fleet", origin(), 100, 20, &filters.to_query());
        assert_eq!(
            command.to_string(),
            "NEARBY fleet LIMIT 20 WHEREIN providerid 1 999 WHEREIN driverstatus 2 0 2 \
             WHEREIN activeservicetypeid 1 4 WHEREIN activeserviceid 1 3 WHEREIN priority 1 0 \
             POINT 21 105.8 100"
        );
        assert!(SearchFilters::default().to_query().is_empty());
    }

    #[test]
    fn filter_params_default_to_any() {
        assert_eq!(AvailabilityFilter::from_param("1"), AvailabilityFilter::Available);
        assert_eq!(AvailabilityFilter::from_param("all"), AvailabilityFilter::Any);
        assert_eq!(PriorityFilter::from_param("0"), PriorityFilter::Regular);
        assert_eq!(PriorityFilter::from_param(""), PriorityFilter::Any);
    }

    #[tokio::test]
    async fn tiers_do_not_overlap() {
        let (controller, _) = controller();
        place(&controller, 1, 100.0).await;
        place(&controller, 2, 3_000.0).await;
        place(&controller, 3, 7_000.0).await;
        place(&controller, 4, 12_000.0).await;

        let filters = SearchFilters::default();
        let tier1 = controller
            .search_nearby_driver_by_provider_id(SEARCH_LIMIT, origin(), 5_000, 0, &filters)
            .await
            .unwrap();
        let tier2 = controller
            .search_nearby_driver_by_provider_id(SEARCH_LIMIT, origin(), 10_000, 5_000, &filters)
            .await
            .unwrap();

        let ids = |result: &super::NearbyDrivers| -> HashSet<String> {
            result.objects.iter().map(|d| d.id.clone()).collect()
        };
        assert_eq!(ids(&tier1), HashSet::from(["1".to_string(), "2".to_string()]));
        assert_eq!(ids(&tier2), HashSet::from(["3".to_string()]));
        assert!(ids(&tier1).is_disjoint(&ids(&tier2)));
        assert_eq!(tier2.count, 1);

        let nearest = &tier1.objects[0];
        assert_eq!(nearest.id, "1");
        assert!((nearest.distance - 100.0).abs() < 5.0);
    }

    #[tokio::test]
    async fn availability_filter_limits_results() {
        let (controller, _) = controller();
        place(&controller, 1, 100.0).await;
        place(&controller, 2, 200.0).await;
        controller.set_availability_busy(2, 77).await.unwrap();

        let filters = SearchFilters {
            availability: AvailabilityFilter::NotAvailable,
            ..SearchFilters::default()
        };
        let result = controller
            .search_nearby_driver(SEARCH_LIMIT, origin(), 1_000, &filters)
            .await
            .unwrap();
        assert_eq!(result.count, 1);
        assert_eq!(result.objects[0].fields.job_id, 77);
    }

    #[tokio::test]
    async fn zero_radius_fails_before_store() {
        let (controller, store) = controller();
        let err = controller
            .search_nearby_driver(SEARCH_LIMIT, origin(), 0, &SearchFilters::default())
            .await;
        assert!(err.is_err());
        assert!(store.commands().is_empty());
    }

    #[tokio::test]
    async fn arm_and_disarm_use_the_same_hook_name() {
        let (controller, store) = controller();
        let endpoints = vec!["http://localhost:8000/ep1".to_string()];
        let filters = SearchFilters {
            availability: AvailabilityFilter::Available,
            ..SearchFilters::default()
        };

        controller
            .detect_nearby_driver(7, origin(), HookType::Arriving, &endpoints, 500, &filters)
            .await
            .unwrap();
        let armed = store.hook("HKDRIVERArriving_fleet_7").unwrap();
        assert!(armed.contains("DETECT inside,enter POINT 21 105.8 500"));
        assert!(armed.contains("http://localhost:8000/ep1/HKDRIVERArriving"));

        controller
            .stop_detect_nearby_driver(7, HookType::Arriving)
            .await
            .unwrap();
        assert!(store.hooks().is_empty());
        let commands = store.commands();
        assert_eq!(commands.last().unwrap(), "DELHOOK HKDRIVERArriving_fleet_7");
    }
}
