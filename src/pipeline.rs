//! The request pipeline: the single entry point every HTTP route goes
//! through. Handles connection/transaction acquisition, upsert detection,
//! the before/after trigger walk along a feather's inheritance chain, and
//! commit-then-notify. Grounded in the teacher's `Guard`/`Rescue`
//! middleware pair (`examples/chat/src/main.rs`) for the shape of
//! "wrap the handler, normalize the failure," generalized here into an
//! explicit state machine because triggers must share one transaction.

use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use crate::catalog::Catalog;
use crate::crud::{self, CrudContext, DeleteRequest, Recursion, SelectRequest, UpdateRequest};
use crate::db::Connection;
use crate::error::Result;
use crate::events::EventBus;
use crate::model::{CurrentUser, inheritance_chain};
use crate::tools::Filter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
    Put,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerPosition {
    Before,
    After,
}

pub struct TriggerPayload {
    pub old_rec: Value,
    pub new_rec: Value,
}

pub type TriggerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
pub type Trigger = Arc<dyn Fn(&mut TriggerPayload) -> TriggerFuture + Send + Sync>;

#[derive(Clone, PartialEq, Eq, Hash)]
struct TriggerKey {
    feather: String,
    method: MethodKey,
    position: PositionKey,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum MethodKey {
    Get,
    Post,
    Patch,
    Delete,
    Put,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
enum PositionKey {
    Before,
    After,
}

/// Registered functions, named `(method, feather)` with an optional
/// trigger position. At most one trigger per `(feather, method, position)`.
#[derive(Default)]
pub struct TriggerRegistry {
    triggers: RwLock<HashMap<TriggerKey, Trigger>>,
}

impl TriggerRegistry {
    pub fn register(&self, feather: &str, method: Method, position: TriggerPosition, trigger: Trigger) {
        let key = TriggerKey {
            feather: feather.to_owned(),
            method: method_key(method),
            position: position_key(position),
        };
        self.triggers.write().expect("trigger registry poisoned").insert(key, trigger);
    }

    fn get(&self, feather: &str, method: Method, position: TriggerPosition) -> Option<Trigger> {
        let key = TriggerKey {
            feather: feather.to_owned(),
            method: method_key(method),
            position: position_key(position),
        };
        self.triggers.read().expect("trigger registry poisoned").get(&key).cloned()
    }
}

fn method_key(method: Method) -> MethodKey {
    match method {
        Method::Get => MethodKey::Get,
        Method::Post => MethodKey::Post,
        Method::Patch => MethodKey::Patch,
        Method::Delete => MethodKey::Delete,
        Method::Put => MethodKey::Put,
    }
}

fn position_key(position: TriggerPosition) -> PositionKey {
    match position {
        TriggerPosition::Before => PositionKey::Before,
        TriggerPosition::After => PositionKey::After,
    }
}

pub struct Payload {
    pub method: Method,
    pub name: String,
    pub id: Option<String>,
    pub data: Option<Value>,
    pub filter: Filter,
    pub subscription: Option<(String, String, String)>,
    pub event_key: Option<String>,
    pub show_deleted: bool,
    pub is_hard_delete: bool,
}

/// Shared state the pipeline needs beyond the payload itself.
pub struct Pipeline {
    pub catalog: Arc<Catalog>,
    pub events: Arc<EventBus>,
    pub triggers: Arc<TriggerRegistry>,
    pub node_id: String,
}

impl Pipeline {
    /// The single entry point every HTTP route funnels through.
    pub async fn request(&self, pool_conn: &mut Connection<'_>, payload: Payload, user: CurrentUser) -> Result<Value> {
        match payload.method {
            Method::Get => self.run_read(pool_conn, payload, user).await,
            _ => {
                let catalog = self.catalog.clone();
                let events = self.events.clone();
                let triggers = self.triggers.clone();
                let node_id = self.node_id.clone();

                pool_conn
                    .transaction(|tx_conn| {
                        async move {
                            run_write(tx_conn, payload, user, &catalog, &events, &triggers, &node_id).await
                        }
                        .scope_boxed()
                    })
                    .await
            }
        }
    }

    async fn run_read(&self, conn: &mut Connection<'_>, payload: Payload, user: CurrentUser) -> Result<Value> {
        let ctx = CrudContext {
            catalog: &self.catalog,
            events: &self.events,
            user: &user,
            node_id: &self.node_id,
        };

        crud::do_select(
            conn,
            &ctx,
            SelectRequest {
                feather_name: payload.name,
                id: payload.id,
                filter: payload.filter,
                show_deleted: payload.show_deleted,
                subscription: payload.subscription,
            },
            &Recursion::top_level(),
        )
        .await
    }
}

async fn run_write(
    conn: &mut Connection<'_>,
    mut payload: Payload,
    user: CurrentUser,
    catalog: &Catalog,
    events: &EventBus,
    triggers: &TriggerRegistry,
    node_id: &str,
) -> Result<Value> {
    let ctx = CrudContext {
        catalog,
        events,
        user: &user,
        node_id,
    };

    // Upsert detection: a POST whose id already exists downgrades to PATCH.
    if payload.method == Method::Post {
        if let (Some(id), Some(Value::Object(data))) = (payload.id.clone(), payload.data.clone()) {
            let existing = crud::do_select(
                conn,
                &ctx,
                SelectRequest {
                    feather_name: payload.name.clone(),
                    id: Some(id.clone()),
                    filter: Filter::default(),
                    show_deleted: true,
                    subscription: None,
                },
                &Recursion::top_level(),
            )
            .await;

            if let Ok(old_value) = existing {
                let patch = crate::patch::diff(&overlay_nulls(&old_value, &data), &Value::Object(data));
                payload.method = Method::Patch;
                payload.data = Some(serde_json::to_value(&patch.0).unwrap_or(Value::Array(Vec::new())));
            }
        }
    }

    let feather = catalog.get_feather(&payload.name, true)?;
    let chain = inheritance_chain(&catalog_snapshot(catalog), &payload.name);

    run_before_triggers(conn, triggers, &chain, payload.method, &mut payload).await?;

    let result = match payload.method {
        Method::Post => {
            let Some(Value::Object(data)) = payload.data.clone() else {
                return Err(crate::err!(400, message = "insert requires a data object"));
            };
            match crud::do_insert(conn, &ctx, &feather.name, data, None, Recursion::top_level()).await? {
                crud::InsertOutcome::Inserted { diff, .. } => diff,
                crud::InsertOutcome::Upsert { .. } => {
                    return Err(crate::err!(500, message = "upsert downgrade did not resolve to a patch"));
                }
            }
        }
        Method::Patch => {
            let Some(id) = payload.id.clone() else {
                return Err(crate::err!(400, message = "patch requires an id"));
            };
            let patch_value = payload.data.clone().unwrap_or(Value::Array(Vec::new()));
            let patch: json_patch::Patch = serde_json::from_value(patch_value)
                .map_err(|error| crate::err!(400, message = format!("invalid JSON patch: {error}")))?;

            crud::do_update(
                conn,
                &ctx,
                UpdateRequest {
                    feather_name: feather.name.clone(),
                    id,
                    patch,
                    event_key: payload.event_key.clone(),
                },
                &Recursion::top_level(),
            )
            .await?
        }
        Method::Delete => {
            let Some(id) = payload.id.clone() else {
                return Err(crate::err!(400, message = "delete requires an id"));
            };
            crud::do_delete(
                conn,
                &ctx,
                DeleteRequest {
                    feather_name: feather.name.clone(),
                    id,
                    event_key: payload.event_key.clone(),
                    is_hard: payload.is_hard_delete,
                },
                &Recursion::top_level(),
            )
            .await?;
            Value::Null
        }
        Method::Put | Method::Get => {
            return Err(crate::err!(400, message = "unsupported method for a write pipeline"));
        }
    };

    run_after_triggers(conn, triggers, &chain, payload.method, &result).await?;

    Ok(result)
}

async fn run_before_triggers(
    conn: &mut Connection<'_>,
    triggers: &TriggerRegistry,
    chain: &[String],
    method: Method,
    payload: &mut Payload,
) -> Result<()> {
    for ancestor in chain {
        let Some(trigger) = triggers.get(ancestor, method, TriggerPosition::Before) else {
            continue;
        };

        let old_rec = match &payload.id {
            Some(_) => payload.data.clone().unwrap_or(Value::Null),
            None => Value::Null,
        };
        let mut trigger_payload = TriggerPayload {
            old_rec,
            new_rec: payload.data.clone().unwrap_or(Value::Null),
        };

        trigger(&mut trigger_payload).await?;
        payload.data = Some(trigger_payload.new_rec);
    }
    let _ = conn;
    Ok(())
}

async fn run_after_triggers(_conn: &mut Connection<'_>, triggers: &TriggerRegistry, chain: &[String], method: Method, result: &Value) -> Result<()> {
    for ancestor in chain.iter().rev() {
        let Some(trigger) = triggers.get(ancestor, method, TriggerPosition::After) else {
            continue;
        };

        let mut trigger_payload = TriggerPayload {
            old_rec: Value::Null,
            new_rec: result.clone(),
        };
        trigger(&mut trigger_payload).await?;
    }
    Ok(())
}

fn overlay_nulls(existing: &Value, incoming: &serde_json::Map<String, Value>) -> Value {
    let Value::Object(existing_map) = existing else {
        return Value::Object(serde_json::Map::new());
    };

    let mut overlaid = existing_map.clone();
    for (key, value) in existing_map.iter() {
        if !incoming.contains_key(key) && !value.is_array() {
            overlaid.insert(key.clone(), Value::Null);
        }
    }

    Value::Object(overlaid)
}

fn catalog_snapshot(catalog: &Catalog) -> HashMap<String, crate::model::Feather> {
    catalog.snapshot_for_inheritance()
}
