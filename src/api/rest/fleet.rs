use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

use crate::api::driver_id;
use crate::api::rest::{body, respond, Envelope};
use crate::config::Config;
use crate::engine::{AvailabilityFilter, NearbyDrivers, PriorityFilter, SearchFilters, SEARCH_LIMIT};
use crate::error::AppError;
use crate::models::driver::{DriverStatus, GeoPoint, HookType};
use crate::state::AppState;
use crate::store::{DriverRecord, StatusReply};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/driver/:id/availability", post(set_availability))
        .route("/driver/:id/status", get(get_status).post(set_status))
        .route("/driver/:id/job", post(start_job).delete(finish_job))
        .route("/driver/nearby", get(nearby))
        .route("/driver/startdetectarriving", post(start_detect_arriving))
        .route("/driver/stopdetectarriving", delete(stop_detect_arriving))
        .route("/driver/startdetectarrived", post(start_detect_arrived))
        .route("/driver/stopdetectarrived", delete(stop_detect_arrived))
}

#[derive(Deserialize)]
pub struct AvailabilityRequest {
    #[serde(default, deserialize_with = "flag")]
    pub avail: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    #[serde(default, deserialize_with = "flag")]
    pub avail: String,
    #[serde(default)]
    pub lat: f64,
    #[serde(default)]
    pub lng: f64,
    #[serde(default)]
    pub jobid: i64,
}

#[derive(Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub jobid: i64,
}

#[derive(Deserialize)]
pub struct StartDetectRequest {
    #[serde(default)]
    pub e_lat: f64,
    #[serde(default)]
    pub e_lng: f64,
    #[serde(default)]
    pub id: i32,
    #[serde(default, deserialize_with = "flag")]
    pub avail: String,
    #[serde(default)]
    pub srv: i32,
    #[serde(default)]
    pub srvtype: i32,
    #[serde(default, deserialize_with = "flag")]
    pub priority: String,
}

#[derive(Deserialize)]
pub struct StopDetectRequest {
    #[serde(default)]
    pub id: i32,
}

#[derive(Serialize)]
pub struct DriverStatusResult {
    pub driverstatus: DriverRecord,
}

#[derive(Serialize)]
pub struct NearbyResult<T> {
    pub nearbydrivers: T,
}

/// Accepts `"1"` as well as `1` for the flag-like fields.
fn flag<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Text(text)) => text,
        Some(Raw::Number(number)) => number.to_string(),
        None => String::new(),
    })
}

fn required_point(lat: f64, lng: f64, prefix: &str) -> Result<GeoPoint, AppError> {
    if lat == 0.0 {
        return Err(AppError::BadRequest(format!(
            "{prefix} (Latitude) is missing, but required"
        )));
    }
    if lng == 0.0 {
        return Err(AppError::BadRequest(format!(
            "{prefix} (Longitude) is missing, but required"
        )));
    }
    Ok(GeoPoint::new(lat, lng))
}

fn availability_missing() -> AppError {
    AppError::BadRequest("Driver Availability is missing, but required".to_string())
}

async fn set_availability(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    payload: Result<Json<AvailabilityRequest>, JsonRejection>,
) -> Result<Json<Envelope<Value>>, AppError> {
    let driver_id = driver_id(&raw_id)?;
    let payload = body(payload)?;
    let point = required_point(payload.lat, payload.lng, "Driver Location")?;

    let status = match DriverStatus::from_avail(&payload.avail) {
        Some(status) if status != DriverStatus::Busy => status,
        _ => return Err(availability_missing()),
    };

    state
        .controller
        .set_availability(driver_id, point, status)
        .await?;
    Ok(respond(json!({})))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
) -> Result<Json<Envelope<DriverStatusResult>>, AppError> {
    let driver_id = driver_id(&raw_id)?;
    let record = state.controller.get_driver_status(driver_id).await?;
    Ok(respond(DriverStatusResult {
        driverstatus: record,
    }))
}

async fn set_status(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    payload: Result<Json<StatusRequest>, JsonRejection>,
) -> Result<Json<Envelope<Value>>, AppError> {
    let driver_id = driver_id(&raw_id)?;
    let payload = body(payload)?;
    let point = required_point(payload.lat, payload.lng, "Location")?;
    let status = DriverStatus::from_avail(&payload.avail).ok_or_else(availability_missing)?;

    state
        .controller
        .update_driver_status(driver_id, point, status, payload.jobid)
        .await?;
    Ok(respond(json!({})))
}

async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<Json<Envelope<Value>>, AppError> {
    let driver_id = driver_id(&raw_id)?;
    let payload = body(payload)?;

    state
        .controller
        .set_availability_busy(driver_id, payload.jobid)
        .await?;
    Ok(respond(json!({})))
}

async fn finish_job(
    State(state): State<Arc<AppState>>,
    Path(raw_id): Path<String>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<Json<Envelope<Value>>, AppError> {
    let driver_id = driver_id(&raw_id)?;
    let payload = body(payload)?;
    if payload.jobid == 0 {
        return Err(AppError::BadRequest("Job ID is missing, but required".to_string()));
    }

    state
        .controller
        .set_driver_job_complete_or_cancel(driver_id, payload.jobid)
        .await?;
    Ok(respond(json!({})))
}

/// Maps a scan tier to `(search_radius, filter_radius)`. Each tier excludes
/// the area already covered by the tier below it.
fn tier_radii(config: &Config, tier: Option<&str>) -> Result<(u32, u32), AppError> {
    let (search, filter) = match tier.map(str::trim) {
        None | Some("") => {
            return Err(AppError::BadRequest(
                "Scan Tier is missing, but required".to_string(),
            ));
        }
        Some("1") => (config.search_tier1_meter, 0),
        Some("2") => (config.search_tier2_meter, config.search_tier1_meter),
        Some("3") => (config.search_tier3_meter, config.search_tier2_meter),
        Some(_) => {
            return Err(AppError::BadRequest(
                "Scan Tier is missing or invalid".to_string(),
            ));
        }
    };

    if search == 0 {
        return Err(AppError::BadRequest(
            "Scan Tier is set but no range is defined".to_string(),
        ));
    }
    Ok((search, filter))
}

fn query_coordinate(params: &HashMap<String, String>, key: &str, label: &str) -> Result<f64, AppError> {
    let raw = params
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("{label} is missing, but required")))?;
    raw.parse::<f64>()
        .map_err(|err| AppError::BadRequest(format!("invalid {key}: {err}")))
}

fn query_id(params: &HashMap<String, String>, key: &str) -> Result<i32, AppError> {
    match params.get(key).map(|value| value.trim()) {
        None | Some("") => Ok(0),
        Some(raw) => raw
            .parse::<i32>()
            .map_err(|err| AppError::BadRequest(format!("invalid {key}: {err}"))),
    }
}

fn query_flag<'a>(params: &'a HashMap<String, String>, key: &str) -> &'a str {
    params.get(key).map(String::as_str).unwrap_or_default()
}

async fn nearby(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Envelope<NearbyResult<NearbyDrivers>>>, AppError> {
    let (search_radius, filter_radius) =
        tier_radii(&state.config, params.get("tier").map(String::as_str))?;
    let lat = query_coordinate(&params, "e_lat", "Latitude")?;
    let lng = query_coordinate(&params, "e_lng", "Longitude")?;

    let filters = SearchFilters {
        provider_id: query_id(&params, "provider")?,
        availability: AvailabilityFilter::from_param(query_flag(&params, "avail")),
        service_type_id: query_id(&params, "srvtype")?,
        service_id: query_id(&params, "srv")?,
        priority: PriorityFilter::from_param(query_flag(&params, "priority")),
    };

    let drivers = state
        .controller
        .search_nearby_driver_by_provider_id(
            SEARCH_LIMIT,
            GeoPoint::new(lat, lng),
            search_radius,
            filter_radius,
            &filters,
        )
        .await?;
    Ok(respond(NearbyResult {
        nearbydrivers: drivers,
    }))
}

async fn start_detect(
    state: &AppState,
    payload: StartDetectRequest,
    hook_type: HookType,
    radius: u32,
) -> Result<Json<Envelope<NearbyResult<StatusReply>>>, AppError> {
    let point = required_point(payload.e_lat, payload.e_lng, "Location")?;
    let filters = SearchFilters {
        provider_id: 0,
        availability: AvailabilityFilter::from_param(&payload.avail),
        service_type_id: payload.srvtype,
        service_id: payload.srv,
        priority: PriorityFilter::from_param(&payload.priority),
    };

    let reply = state
        .controller
        .detect_nearby_driver(
            payload.id,
            point,
            hook_type,
            &state.config.hook_endpoints,
            radius,
            &filters,
        )
        .await?;
    Ok(respond(NearbyResult {
        nearbydrivers: reply,
    }))
}

async fn stop_detect(
    state: &AppState,
    payload: StopDetectRequest,
    hook_type: HookType,
) -> Result<Json<Envelope<NearbyResult<StatusReply>>>, AppError> {
    let reply = state
        .controller
        .stop_detect_nearby_driver(payload.id, hook_type)
        .await?;
    Ok(respond(NearbyResult {
        nearbydrivers: reply,
    }))
}

async fn start_detect_arriving(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StartDetectRequest>, JsonRejection>,
) -> Result<Json<Envelope<NearbyResult<StatusReply>>>, AppError> {
    let radius = state.config.detect_arriving_meter;
    start_detect(&state, body(payload)?, HookType::Arriving, radius).await
}

async fn stop_detect_arriving(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StopDetectRequest>, JsonRejection>,
) -> Result<Json<Envelope<NearbyResult<StatusReply>>>, AppError> {
    stop_detect(&state, body(payload)?, HookType::Arriving).await
}

async fn start_detect_arrived(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StartDetectRequest>, JsonRejection>,
) -> Result<Json<Envelope<NearbyResult<StatusReply>>>, AppError> {
    let radius = state.config.detect_arrived_meter;
    start_detect(&state, body(payload)?, HookType::Arrived, radius).await
}

async fn stop_detect_arrived(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StopDetectRequest>, JsonRejection>,
) -> Result<Json<Envelope<NearbyResult<StatusReply>>>, AppError> {
    stop_detect(&state, body(payload)?, HookType::Arrived).await
}
