//! Command construction for the geospatial index. Every builder here is
//! pure; the service validates inputs before calling them.

use std::fmt;

use crate::models::driver::{GeoPoint, HookType};
use crate::store::HOOK_PREFIX;

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: &'static str,
    args: Vec<String>,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl ToString) -> Self {
        self.args.push(value.to_string());
        self
    }

    pub fn push(&mut self, value: impl ToString) {
        self.args.push(value.to_string());
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Numeric fields written with SET/FSET, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap(Vec<(&'static str, i64)>);

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<i64>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<i64>) {
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.0
            .iter()
            .find(|(existing, _)| *existing == name)
            .map(|(_, value)| *value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, i64)> + '_ {
        self.0.iter().copied()
    }
}

/// `WHERE field min max` range clause.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereCondition {
    pub field: &'static str,
    pub min: f64,
    pub max: f64,
}

/// `WHEREIN field count v1..vn` membership clause.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereInCondition {
    pub field: &'static str,
    pub values: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilters {
    pub where_list: Vec<WhereCondition>,
    pub where_in: Vec<WhereInCondition>,
}

impl QueryFilters {
    pub fn is_empty(&self) -> bool {
        self.where_list.is_empty() && self.where_in.is_empty()
    }

    fn append_to(&self, command: &mut Command) {
        for condition in &self.where_list {
            command.push("WHERE");
            command.push(condition.field);
            command.push(format_bound(condition.min));
            command.push(format_bound(condition.max));
        }

        for condition in self.where_in.iter().filter(|c| !c.values.is_empty()) {
            command.push("WHEREIN");
            command.push(condition.field);
            command.push(condition.values.len());
            for value in &condition.values {
                command.push(value);
            }
        }
    }
}

fn format_bound(value: f64) -> String {
    if value == f64::INFINITY {
        "+inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        value.to_string()
    }
}

/// Object id as sent to the store; 0 renders as the match-all wildcard.
pub fn object_id(id: i32) -> String {
    if id == 0 {
        "*".to_string()
    } else {
        id.to_string()
    }
}

/// Topic shared by every hook of one event family, e.g. `HKDRIVERArriving`.
pub fn hook_topic(hook_type: HookType) -> String {
    format!("{HOOK_PREFIX}{}", hook_type.title())
}

/// Hook handle; arm and disarm must derive the same value.
pub fn hook_name(topic: &str, key: &str, object_id: &str) -> String {
    format!("{topic}_{key}_{object_id}")
}

/// Every endpoint receives notifications under its own `/{topic}` path.
pub fn hook_endpoints(endpoints: &[String], topic: &str) -> String {
    endpoints
        .iter()
        .map(|endpoint| format!("{}/{topic}", endpoint.trim_end_matches('/')))
        .collect::<Vec<_>>()
        .join(",")
}

pub fn ping() -> Command {
    Command::new("PING")
}

pub fn auth(password: &str) -> Command {
    Command::new("AUTH").arg(password)
}

pub fn output_json() -> Command {
    Command::new("OUTPUT").arg("json")
}

pub fn get(key: &str, id: i32) -> Command {
    Command::new("GET")
        .arg(key)
        .arg(object_id(id))
        .arg("WITHFIELDS")
}

pub fn set(key: &str, id: i32, point: GeoPoint, fields: &FieldMap) -> Command {
    let mut command = Command::new("SET").arg(key).arg(object_id(id));
    for (name, value) in fields.iter() {
        command.push("FIELD");
        command.push(name);
        command.push(value);
    }
    command.arg("POINT").arg(point.lat).arg(point.lng)
}

pub fn fset(key: &str, id: i32, fields: &FieldMap) -> Command {
    let mut command = Command::new("FSET").arg(key).arg(object_id(id));
    for (name, value) in fields.iter() {
        command.push(name);
        command.push(value);
    }
    command
}

pub fn nearby(key: &str, point: GeoPoint, radius: u32, limit: u32, filters: &QueryFilters) -> Command {
    let mut command = Command::new("NEARBY").arg(key);
    if limit > 0 {
        command.push("LIMIT");
        command.push(limit);
    }
    filters.append_to(&mut command);
    command
        .arg("POINT")
        .arg(point.lat)
        .arg(point.lng)
        .arg(radius)
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookSpec {
    pub endpoints: Vec<String>,
    pub topic: String,
    pub search_type: String,
    pub key: String,
    pub id: i32,
    pub point: GeoPoint,
    pub radius: u32,
    pub detect: Vec<String>,
    pub commands: Vec<String>,
    pub filters: QueryFilters,
}

impl HookSpec {
    pub fn name(&self) -> String {
        hook_name(&self.topic, &self.key, &object_id(self.id))
    }
}

pub fn set_hook(spec: &HookSpec) -> Command {
    let mut command = Command::new("SETHOOK")
        .arg(spec.name())
        .arg(hook_endpoints(&spec.endpoints, &spec.topic))
        .arg(&spec.search_type)
        .arg(&spec.key)
        .arg("MATCH")
        .arg(object_id(spec.id));

    spec.filters.append_to(&mut command);
    command.push("FENCE");

    if !spec.detect.is_empty() {
        command.push("DETECT");
        command.push(spec.detect.join(","));
    }
    if !spec.commands.is_empty() {
        command.push("COMMANDS");
        command.push(spec.commands.join(","));
    }

    command
        .arg("POINT")
        .arg(spec.point.lat)
        .arg(spec.point.lng)
        .arg(spec.radius)
}

pub fn del_hook(name: &str) -> Command {
    Command::new("DELHOOK").arg(name)
}
