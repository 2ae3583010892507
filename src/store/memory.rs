//! In-process store that interprets the same command set as the remote
//! index. Selected with `STORE_ADDR=memory` and used as the collaborator in
//! tests, so every command issued is also recorded for inspection.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::iter::Peekable;
use std::slice::Iter;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::geo::distance_m;
use crate::models::driver::GeoPoint;
use crate::store::command::Command;
use crate::store::reply::LocationObject;
use crate::store::{StoreError, StoreTransport};

#[derive(Debug, Clone)]
struct Entry {
    point: GeoPoint,
    fields: BTreeMap<String, i64>,
}

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Entry>>,
    hooks: BTreeMap<String, String>,
    log: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command executed so far, rendered as one line each.
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().log.clear();
    }

    pub fn hooks(&self) -> Vec<String> {
        self.lock().hooks.keys().cloned().collect()
    }

    /// The SETHOOK line that armed `name`, if it is still armed.
    pub fn hook(&self, name: &str) -> Option<String> {
        self.lock().hooks.get(name).cloned()
    }

    pub fn field(&self, key: &str, id: i32, name: &str) -> Option<i64> {
        let state = self.lock();
        let entry = state.collections.get(key)?.get(&id.to_string())?;
        entry.fields.get(name).copied()
    }

    pub fn point(&self, key: &str, id: i32) -> Option<GeoPoint> {
        let state = self.lock();
        state
            .collections
            .get(key)?
            .get(&id.to_string())
            .map(|entry| entry.point)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl StoreTransport for MemoryStore {
    async fn execute(&self, command: &Command) -> Result<Vec<u8>, StoreError> {
        let mut state = self.lock();
        state.log.push(command.to_string());

        let mut args = Args::new(command);
        let reply = match command.name() {
            "PING" => json!({"ok": true, "ping": "pong"}),
            "AUTH" | "OUTPUT" => ok(),
            "GET" => state.get(&mut args)?,
            "SET" => state.set(&mut args)?,
            "FSET" => state.fset(&mut args)?,
            "NEARBY" => state.nearby(&mut args)?,
            "SETHOOK" => {
                let name = args.word()?.to_string();
                state.hooks.insert(name, command.to_string());
                ok()
            }
            "DELHOOK" => {
                let name = args.word()?;
                state.hooks.remove(name);
                ok()
            }
            other => {
                return Err(StoreError::Server(format!("unknown command '{other}'")));
            }
        };

        serde_json::to_vec(&reply).map_err(|err| StoreError::Decode(err.to_string()))
    }
}

fn ok() -> Value {
    json!({"ok": true})
}

fn not_ok(message: &str) -> Value {
    json!({"ok": false, "err": message})
}

impl State {
    fn get(&self, args: &mut Args<'_>) -> Result<Value, StoreError> {
        let key = args.word()?;
        let id = args.word()?;

        let Some(collection) = self.collections.get(key) else {
            return Ok(not_ok("key not found"));
        };
        let Some(entry) = collection.get(id) else {
            return Ok(not_ok("id not found"));
        };

        let mut reply = json!({
            "ok": true,
            "object": LocationObject::from_point(entry.point),
        });
        if args.next_is("WITHFIELDS") && !entry.fields.is_empty() {
            let fields: Map<String, Value> = entry
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), Value::from(*value)))
                .collect();
            reply["fields"] = Value::Object(fields);
        }
        Ok(reply)
    }

    fn set(&mut self, args: &mut Args<'_>) -> Result<Value, StoreError> {
        let key = args.word()?.to_string();
        let id = args.word()?.to_string();

        let mut fields = Vec::new();
        while args.next_is("FIELD") {
            let name = args.word()?.to_string();
            fields.push((name, args.number::<i64>()?));
        }
        args.expect("POINT")?;
        let point = GeoPoint::new(args.number()?, args.number()?);

        let entry = self
            .collections
            .entry(key)
            .or_default()
            .entry(id)
            .or_insert_with(|| Entry {
                point,
                fields: BTreeMap::new(),
            });
        entry.point = point;
        entry.fields.extend(fields);

        Ok(ok())
    }

    fn fset(&mut self, args: &mut Args<'_>) -> Result<Value, StoreError> {
        let key = args.word()?;
        let id = args.word()?;

        let mut updates = Vec::new();
        while args.has_more() {
            let name = args.word()?.to_string();
            updates.push((name, args.number::<i64>()?));
        }

        let Some(collection) = self.collections.get_mut(key) else {
            return Ok(not_ok("key not found"));
        };
        let Some(entry) = collection.get_mut(id) else {
            return Ok(not_ok("id not found"));
        };
        entry.fields.extend(updates);

        Ok(ok())
    }

    fn nearby(&self, args: &mut Args<'_>) -> Result<Value, StoreError> {
        let key = args.word()?;

        let mut limit = usize::MAX;
        let mut ranges: Vec<(String, f64, f64)> = Vec::new();
        let mut members: Vec<(String, Vec<i64>)> = Vec::new();
        loop {
            if args.next_is("LIMIT") {
                limit = args.number()?;
            } else if args.next_is("WHERE") {
                let name = args.word()?.to_string();
                ranges.push((name, args.number()?, args.number()?));
            } else if args.next_is("WHEREIN") {
                let name = args.word()?.to_string();
                let count: usize = args.number()?;
                let values = (0..count)
                    .map(|_| args.number::<i64>())
                    .collect::<Result<Vec<_>, _>>()?;
                members.push((name, values));
            } else {
                break;
            }
        }
        args.expect("POINT")?;
        let center = GeoPoint::new(args.number()?, args.number()?);
        let radius: f64 = args.number()?;

        let mut hits: Vec<(f64, &String, &Entry)> = self
            .collections
            .get(key)
            .into_iter()
            .flat_map(|collection| collection.iter())
            .filter(|(_, entry)| {
                let value = |name: &str| entry.fields.get(name).copied().unwrap_or(0);
                ranges.iter().all(|(name, min, max)| {
                    let v = value(name.as_str()) as f64;
                    v >= *min && v <= *max
                }) && members
                    .iter()
                    .all(|(name, values)| values.contains(&value(name.as_str())))
            })
            .map(|(id, entry)| (distance_m(&center, &entry.point), id, entry))
            .filter(|(distance, _, _)| *distance <= radius)
            .collect();
        hits.sort_by(|a, b| a.0.total_cmp(&b.0));
        hits.truncate(limit);

        let names: BTreeSet<&String> = hits
            .iter()
            .flat_map(|(_, _, entry)| entry.fields.keys())
            .collect();
        let objects: Vec<Value> = hits
            .iter()
            .map(|(_, id, entry)| {
                let mut object = json!({
                    "id": id,
                    "object": LocationObject::from_point(entry.point),
                });
                if !names.is_empty() {
                    let values: Vec<i64> = names
                        .iter()
                        .map(|name| entry.fields.get(*name).copied().unwrap_or(0))
                        .collect();
                    object["fields"] = json!(values);
                }
                object
            })
            .collect();

        let mut reply = json!({
            "ok": true,
            "objects": objects,
            "count": hits.len(),
            "cursor": 0,
        });
        if !names.is_empty() {
            reply["fields"] = json!(names);
        }
        Ok(reply)
    }
}

struct Args<'a> {
    command: &'static str,
    iter: Peekable<Iter<'a, String>>,
}

impl<'a> Args<'a> {
    fn new(command: &'a Command) -> Self {
        Self {
            command: command.name(),
            iter: command.args().iter().peekable(),
        }
    }

    fn word(&mut self) -> Result<&'a str, StoreError> {
        self.iter.next().map(String::as_str).ok_or_else(|| {
            StoreError::Server(format!(
                "wrong number of arguments for '{}' command",
                self.command.to_lowercase()
            ))
        })
    }

    fn number<T: FromStr>(&mut self) -> Result<T, StoreError> {
        let raw = self.word()?;
        raw.parse()
            .map_err(|_| StoreError::Server(format!("invalid argument '{raw}'")))
    }

    fn has_more(&mut self) -> bool {
        self.iter.peek().is_some()
    }

    /// Consumes the next argument when it equals `keyword`.
    fn next_is(&mut self, keyword: &str) -> bool {
        let matched = self
            .iter
            .peek()
            .is_some_and(|arg| arg.eq_ignore_ascii_case(keyword));
        if matched {
            self.iter.next();
        }
        matched
    }

    fn expect(&mut self, keyword: &str) -> Result<(), StoreError> {
        if self.next_is(keyword) {
            Ok(())
        } else {
            Err(StoreError::Server(format!("expected {keyword}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::models::driver::GeoPoint;
    use crate::store::command::{self, Command, FieldMap, QueryFilters, WhereInCondition};
    use crate::store::reply::{DriverRecord, NearbyReply, StatusReply};
    use crate::store::{StoreError, StoreTransport};

    async fn run(store: &MemoryStore, command: Command) -> Vec<u8> {
        store.execute(&command).await.unwrap()
    }

    async fn seed(store: &MemoryStore, id: i32, point: GeoPoint, status: i64) {
        let fields = FieldMap::new().with("driverid", id).with("driverstatus", status);
        run(store, command::set("fleet", id, point, &fields)).await;
    }

    #[tokio::test]
    async fn get_reports_missing_key_and_id() {
        let store = MemoryStore::new();
        let record = DriverRecord::decode(&run(&store, command::get("fleet", 1)).await).unwrap();
        assert_eq!(record.error.as_deref(), Some("key not found"));

        seed(&store, 2, GeoPoint::new(21.0, 105.8), 1).await;
        let record = DriverRecord::decode(&run(&store, command::get("fleet", 1)).await).unwrap();
        assert_eq!(record.error.as_deref(), Some("id not found"));
    }

    #[tokio::test]
    async fn set_merges_fields_and_fset_updates_them() {
        let store = MemoryStore::new();
        seed(&store, 7, GeoPoint::new(21.0, 105.8), 1).await;
        run(
            &store,
            command::set("fleet", 7, GeoPoint::new(21.1, 105.9), &FieldMap::new()),
        )
        .await;
        assert_eq!(store.field("fleet", 7, "driverstatus"), Some(1));
        assert_eq!(store.point("fleet", 7), Some(GeoPoint::new(21.1, 105.9)));

        let fields = FieldMap::new().with("driverstatus", 2).with("jobid", 55);
        let reply = StatusReply::decode(&run(&store, command::fset("fleet", 7, &fields)).await);
        assert!(reply.unwrap().ok);
        assert_eq!(store.field("fleet", 7, "jobid"), Some(55));
    }

    #[tokio::test]
    async fn fset_on_missing_id_is_not_ok() {
        let store = MemoryStore::new();
        seed(&store, 7, GeoPoint::new(21.0, 105.8), 1).await;
        let fields = FieldMap::new().with("jobid", 1);
        let reply = StatusReply::decode(&run(&store, command::fset("fleet", 8, &fields)).await);
        assert_eq!(reply.unwrap().error.as_deref(), Some("id not found"));
    }

    #[tokio::test]
    async fn nearby_filters_sorts_and_limits() {
        let store = MemoryStore::new();
        let center = GeoPoint::new(21.0, 105.8);
        seed(&store, 1, GeoPoint::new(21.002, 105.8), 1).await;
        seed(&store, 2, GeoPoint::new(21.001, 105.8), 1).await;
        seed(&store, 3, GeoPoint::new(21.0005, 105.8), 2).await;
        seed(&store, 4, GeoPoint::new(21.5, 105.8), 1).await;

        let filters = QueryFilters {
            where_list: vec![],
            where_in: vec![WhereInCondition {
                field: "driverstatus",
                values: vec![1],
            }],
        };
        let body = run(&store, command::nearby("fleet", center, 1000, 20, &filters)).await;
        let reply = NearbyReply::decode(&body).unwrap();
        let ids: Vec<&str> = reply.objects.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["2", "1"]);

        let body = run(&store, command::nearby("fleet", center, 1000, 1, &QueryFilters::default())).await;
        let reply = NearbyReply::decode(&body).unwrap();
        assert_eq!(reply.objects.len(), 1);
        assert_eq!(reply.objects[0].fields.driver_id, 3);
    }

    #[tokio::test]
    async fn hooks_are_kept_by_name() {
        let store = MemoryStore::new();
        run(&store, Command::new("SETHOOK").arg("h1").arg("http://x")).await;
        assert_eq!(store.hooks(), vec!["h1".to_string()]);
        run(&store, command::del_hook("h1")).await;
        assert!(store.hooks().is_empty());
        assert_eq!(store.commands().len(), 2);
    }

    #[tokio::test]
    async fn unknown_command_is_server_error() {
        let store = MemoryStore::new();
        let err = store.execute(&Command::new("FLUSHALL")).await.unwrap_err();
        assert!(matches!(err, StoreError::Server(_)));
    }
}
