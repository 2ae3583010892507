//! Typed views of the store's JSON replies.
//!
//! Field values are decoded against the known driver schema: every name must
//! map to a member and every value must be an integral number, otherwise the
//! reply is rejected with `StoreError::Decode`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::driver::{field, DriverFields, DriverStatus, GeoPoint};
use crate::store::StoreError;

/// GeoJSON point as returned by the store; coordinates are `[lng, lat]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: [f64; 2],
}

impl LocationObject {
    pub fn from_point(point: GeoPoint) -> Self {
        Self {
            kind: "Point".to_string(),
            coordinates: [point.lng, point.lat],
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.coordinates[1], self.coordinates[0])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReply {
    pub ok: bool,
    #[serde(rename = "err", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
}

impl StatusReply {
    pub fn decode(body: &[u8]) -> Result<Self, StoreError> {
        parse(body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverRecord {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<LocationObject>,
    pub fields: DriverFields,
    #[serde(rename = "err", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
}

#[derive(Deserialize)]
struct RawRecord {
    ok: bool,
    #[serde(default)]
    object: Option<LocationObject>,
    #[serde(default)]
    fields: Option<Map<String, Value>>,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    elapsed: Option<String>,
}

impl DriverRecord {
    pub fn decode(body: &[u8]) -> Result<Self, StoreError> {
        let raw: RawRecord = parse(body)?;
        let fields = match &raw.fields {
            Some(map) => decode_fields(map.iter().map(|(name, value)| (name.as_str(), value)))?,
            None => DriverFields::default(),
        };

        Ok(Self {
            ok: raw.ok,
            object: raw.object,
            fields,
            error: raw.err,
            elapsed: raw.elapsed,
        })
    }

    /// A record only counts as present when it carries a driver id.
    pub fn exists(&self) -> bool {
        self.ok && self.fields.driver_id != 0
    }

    pub fn point(&self) -> Option<GeoPoint> {
        self.object.as_ref().map(LocationObject::point)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyObject {
    pub id: String,
    pub object: LocationObject,
    pub fields: DriverFields,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyReply {
    pub ok: bool,
    pub objects: Vec<NearbyObject>,
    pub count: u64,
    pub cursor: u64,
    #[serde(rename = "err", skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<String>,
}

#[derive(Deserialize)]
struct RawNearby {
    ok: bool,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    objects: Vec<RawNearbyObject>,
    #[serde(default)]
    count: u64,
    #[serde(default)]
    cursor: u64,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    elapsed: Option<String>,
}

#[derive(Deserialize)]
struct RawNearbyObject {
    id: String,
    object: LocationObject,
    #[serde(default)]
    fields: Vec<Value>,
}

impl NearbyReply {
    /// NEARBY lists field names once and each object's values positionally.
    pub fn decode(body: &[u8]) -> Result<Self, StoreError> {
        let raw: RawNearby = parse(body)?;
        let mut objects = Vec::with_capacity(raw.objects.len());

        for object in raw.objects {
            let fields = if object.fields.is_empty() {
                DriverFields::default()
            } else {
                if object.fields.len() != raw.fields.len() {
                    return Err(StoreError::Decode(format!(
                        "object {} has {} field values for {} field names",
                        object.id,
                        object.fields.len(),
                        raw.fields.len()
                    )));
                }
                decode_fields(raw.fields.iter().map(String::as_str).zip(object.fields.iter()))?
            };

            objects.push(NearbyObject {
                id: object.id,
                object: object.object,
                fields,
            });
        }

        Ok(Self {
            ok: raw.ok,
            objects,
            count: raw.count,
            cursor: raw.cursor,
            error: raw.err,
            elapsed: raw.elapsed,
        })
    }
}

fn parse<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(body).map_err(|err| StoreError::Decode(err.to_string()))
}

pub fn decode_fields<'a>(
    pairs: impl IntoIterator<Item = (&'a str, &'a Value)>,
) -> Result<DriverFields, StoreError> {
    let mut fields = DriverFields::default();

    for (name, value) in pairs {
        let number = integral(name, value)?;
        match name {
            field::DRIVER_ID => fields.driver_id = narrow(name, number)?,
            field::PROVIDER_ID => fields.provider_id = narrow(name, number)?,
            field::STATUS => {
                fields.status = DriverStatus::try_from(number).map_err(StoreError::Decode)?
            }
            field::JOB_ID => fields.job_id = number,
            field::ACTIVE_SERVICE_ID => fields.active_service_id = narrow(name, number)?,
            field::ACTIVE_SERVICE_TYPE_ID => fields.active_service_type_id = narrow(name, number)?,
            field::PRIORITY => fields.priority = narrow(name, number)?,
            field::LAST_UPDATED => fields.last_updated = number,
            unknown => {
                return Err(StoreError::Decode(format!("unknown field {unknown:?}")));
            }
        }
    }

    Ok(fields)
}

fn integral(name: &str, value: &Value) -> Result<i64, StoreError> {
    if let Some(number) = value.as_i64() {
        return Ok(number);
    }
    match value.as_f64() {
        Some(number) if number.fract() == 0.0 && number.abs() < i64::MAX as f64 => Ok(number as i64),
        _ => Err(StoreError::Decode(format!(
            "field {name} is not an integer: {value}"
        ))),
    }
}

fn narrow(name: &str, value: i64) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Decode(format!("field {name} out of range: {value}")))
}
