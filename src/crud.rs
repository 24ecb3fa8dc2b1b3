//! The CRUD engine: `doInsert`/`doSelect`/`doUpdate`/`doDelete`, each
//! taking a `(isChild, isSuperUser)` pair for recursion into child records.
//! Grounded in the teacher's query-building macros (`examples/chat/src/
//! database/query/*`) for the shape of filter/sort application, generalized
//! from Diesel's compile-time `table!` schema to the dynamic column sets
//! `catalog::Catalog` hands back, via `tools::bind_value`/`bind_tokens`.

use chrono::Utc;
use diesel::sql_types::{BigInt, Bool, Jsonb, Text};
use diesel::{OptionalExtension, QueryableByName};
use diesel_async::RunQueryDsl as AsyncRunQueryDsl;
use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;

use crate::auth::{self, IsAuthorized};
use crate::catalog::Catalog;
use crate::db::Connection;
use crate::error::Result;
use crate::events::{ChangeAction, EnvelopeMessage, EventBus, SubscribeRequest};
use crate::locks;
use crate::model::{Action, ChangeAction as LogAction, CurrentUser, Feather, Format, Property, RelationKind};
use crate::tools::{self, Filter, Tokens};

pub struct CrudContext<'a> {
    pub catalog: &'a Catalog,
    pub events: &'a EventBus,
    pub user: &'a CurrentUser,
    pub node_id: &'a str,
}

pub struct Recursion {
    pub is_child: bool,
}

impl Recursion {
    pub fn top_level() -> Self {
        Self { is_child: false }
    }

    pub fn child() -> Self {
        Self { is_child: true }
    }
}

pub enum InsertOutcome {
    Inserted { id: String, diff: Value },
    /// The caller supplied an `id` that already exists: the pipeline
    /// downgrades this to a PATCH.
    Upsert { id: String },
}

/// Steps 1-10 of the documented insert algorithm. `folder_id`, when given,
/// gates `canCreate` on a member grant for that folder in addition to the
/// feather-level grant.
pub async fn do_insert(
    conn: &mut Connection<'_>,
    ctx: &CrudContext<'_>,
    feather_name: &str,
    mut data: Map<String, Value>,
    folder_id: Option<&str>,
    recursion: Recursion,
) -> Result<InsertOutcome> {
    let feather = ctx.catalog.get_feather(feather_name, true)?;
    reject_unknown_keys(&feather, &data)?;

    if let Some(Value::String(id)) = data.get("id").cloned() {
        if object_exists(conn, &id).await? {
            return Ok(InsertOutcome::Upsert { id });
        }
    }

    let id = match data.get("id").and_then(Value::as_str) {
        Some(existing) => existing.to_owned(),
        None => uuid::Uuid::new_v4().to_string(),
    };
    data.insert("id".to_owned(), Value::String(id.clone()));

    probe_natural_key_uniqueness(conn, &feather, &data, None).await?;

    if !recursion.is_child {
        let feather_pk = feather_table_pk(conn, &feather.name).await?;
        let folder_pk = match folder_id {
            Some(folder_id) => Some(resolve_object_pk(conn, folder_id).await?.unwrap_or(-1)),
            None => None,
        };
        authorize(
            conn,
            ctx,
            Action::CanCreate,
            feather_pk,
            folder_pk,
        )
        .await?;
    }

    let now = Utc::now();
    let etag = uuid::Uuid::new_v4().to_string();

    let mut columns: Vec<(String, (&'static str, Value))> = vec![
        ("id".to_owned(), value_binding(Format::String, &Value::String(id.clone()))),
        ("created".to_owned(), value_binding(Format::DateTime, &Value::String(now.to_rfc3339()))),
        ("created_by".to_owned(), value_binding(Format::String, &Value::String(ctx.user.username.clone()))),
        ("updated".to_owned(), value_binding(Format::DateTime, &Value::String(now.to_rfc3339()))),
        ("updated_by".to_owned(), value_binding(Format::String, &Value::String(ctx.user.username.clone()))),
        ("is_deleted".to_owned(), value_binding(Format::Boolean, &Value::Bool(false))),
        ("etag".to_owned(), value_binding(Format::String, &Value::String(etag))),
    ];

    let mut children_to_insert: Vec<(String, String, Vec<Value>)> = Vec::new();

    for (name, property) in feather.properties.iter() {
        if property.inherited_from().is_some() && !feather.properties.contains(name) {
            continue;
        }

        match property {
            Property::Scalar(scalar) if scalar.format == Format::Money => {
                let value = resolve_scalar_value(scalar, data.get(name));
                columns.extend(money_columns(name, &value));
            }
            Property::Scalar(scalar) => {
                let value = resolve_scalar_value(scalar, data.get(name));
                columns.push((crate::model::to_snake_case(name), (scalar.format.db_type(), value)));
            }
            Property::Relation(relation) => match relation.kind() {
                RelationKind::ToOne | RelationKind::IsChild => {
                    let provided = data.get(name);
                    let pk = match provided {
                        Some(Value::String(referenced_id)) => resolve_object_pk(conn, referenced_id).await?.unwrap_or(-1),
                        Some(Value::Object(child_data)) if relation.kind() == RelationKind::IsChild => {
                            let outcome = Box::pin(do_insert(
                                conn,
                                ctx,
                                &relation.relation,
                                child_data.clone(),
                                None,
                                Recursion::child(),
                            ))
                            .await?;
                            match outcome {
                                InsertOutcome::Inserted { id, .. } => resolve_object_pk(conn, &id).await?.unwrap_or(-1),
                                InsertOutcome::Upsert { id } => resolve_object_pk(conn, &id).await?.unwrap_or(-1),
                            }
                        }
                        _ => -1,
                    };
                    columns.push((crate::model::to_snake_case(name), (Format::Integer.db_type(), Value::from(pk))));
                }
                RelationKind::ToMany => {
                    if let Some(Value::Array(items)) = data.get(name) {
                        children_to_insert.push((name.clone(), relation.relation.clone(), items.clone()));
                    }
                }
            },
        }
    }

    let mut tokens = Tokens::default();
    let column_list: Vec<String> = columns.iter().map(|(name, _)| name.clone()).collect();
    let value_list: Vec<String> = columns
        .iter()
        .map(|(_, (db_type, value))| tools::bind_value(&mut tokens, value, db_type))
        .collect();

    let statement = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        feather.table_name(),
        column_list.join(", "),
        value_list.join(", ")
    );
    tools::bind_tokens(diesel::sql_query(statement), tokens)
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to insert {}: {error}", feather.name)))?;

    let parent_pk = resolve_object_pk(conn, &id).await?.ok_or_else(|| crate::err!(500, message = "insert did not produce a row"))?;

    for (back_ref_property, child_feather, items) in children_to_insert {
        for item in items {
            let Value::Object(mut child_data) = item else {
                continue;
            };
            child_data.insert(crate::model::to_camel_case(&back_ref_property), Value::from(parent_pk));
            Box::pin(do_insert(conn, ctx, &child_feather, child_data, None, Recursion::child())).await?;
        }
    }

    let persisted = select_one_raw(conn, ctx.catalog, &feather, &id).await?;
    log_change(conn, &id, LogAction::Post, ctx.user, &persisted).await?;

    if feather.name == "Folder" {
        crate::auth::propagate_auth(
            conn,
            crate::auth::PropagateAuth {
                folder_pk: parent_pk,
                role: None,
                is_deleted: false,
            },
        )
        .await
        .ok();
    }

    let diff = crate::patch::diff(&Value::Object(data), &persisted);
    let diff_value = serde_json::to_value(&diff.0).unwrap_or(Value::Array(Vec::new()));

    ctx.events
        .notify(
            conn,
            &feather.name,
            EnvelopeMessage {
                subscription: crate::events::SubscriptionRef {
                    id: String::new(),
                    session_id: String::new(),
                    node_id: ctx.node_id.to_owned(),
                },
                action: ChangeAction::Create,
                data: persisted,
            },
        )
        .await
        .ok();

    Ok(InsertOutcome::Inserted { id, diff: diff_value })
}

fn resolve_scalar_value(scalar: &crate::model::ScalarProperty, provided: Option<&Value>) -> Value {
    if let Some(value) = provided {
        if !value.is_null() {
            return value.clone();
        }
    }

    match &scalar.default {
        Some(crate::model::DefaultValue::Literal(value)) => value.clone(),
        Some(crate::model::DefaultValue::Function(name)) => resolve_default_function(name, scalar.format),
        None => scalar.format.type_default(),
    }
}

fn resolve_default_function(name: &str, format: Format) -> Value {
    match name {
        "now()" => Value::String(Utc::now().to_rfc3339()),
        "money()" => Format::Money.type_default(),
        _ => format.type_default(),
    }
}

fn value_binding(format: Format, value: &Value) -> (&'static str, Value) {
    (format.db_type(), value.clone())
}

/// `(jsonKey, columnSuffix, dbType)` for each of `Money`'s four physical
/// sub-columns, in the order its JSON shape (`amount`/`currency`/
/// `effective`/`baseAmount`) names them.
fn money_subcolumns() -> [(&'static str, &'static str, &'static str); 4] {
    [
        ("amount", "amount", "numeric"),
        ("currency", "currency", "text"),
        ("effective", "effective", "timestamptz"),
        ("baseAmount", "base_amount", "numeric"),
    ]
}

/// Fans a `Money` property's JSON object value out into its four physical
/// columns (`<property>_amount`, `<property>_currency`, `<property>_effective`,
/// `<property>_base_amount`), each bound with its own SQL type rather than
/// the opaque `jsonb` blob a scalar property would otherwise get.
fn money_columns(name: &str, value: &Value) -> Vec<(String, (&'static str, Value))> {
    let column = crate::model::to_snake_case(name);
    let object = value.as_object();

    money_subcolumns()
        .into_iter()
        .map(|(json_key, column_suffix, db_type)| {
            let sub_value = object.and_then(|map| map.get(json_key)).cloned().unwrap_or(Value::Null);
            (format!("{column}_{column_suffix}"), (db_type, sub_value))
        })
        .collect()
}

fn reject_unknown_keys(feather: &Feather, data: &Map<String, Value>) -> Result<()> {
    for key in data.keys() {
        if crate::model::SYSTEM_COLUMNS.contains(&key.as_str()) || key == "id" {
            continue;
        }
        if !feather.properties.contains(key) {
            return Err(crate::err!(400, message = format!("{} has no property \"{key}\"", feather.name)));
        }
    }
    Ok(())
}

#[derive(QueryableByName)]
struct ExistsRow {
    #[diesel(sql_type = Bool)]
    present: bool,
}

async fn object_exists(conn: &mut Connection<'_>, id: &str) -> Result<bool> {
    let row: ExistsRow = diesel::sql_query("SELECT EXISTS(SELECT 1 FROM object WHERE id = $1) AS present")
        .bind::<Text, _>(id.to_owned())
        .get_result(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("existence check failed: {error}")))?;
    Ok(row.present)
}

#[derive(QueryableByName)]
struct PkRow {
    #[diesel(sql_type = BigInt)]
    _pk: i64,
}

async fn resolve_object_pk(conn: &mut Connection<'_>, id: &str) -> Result<Option<i64>> {
    let row: Option<PkRow> = diesel::sql_query("SELECT _pk FROM object WHERE id = $1")
        .bind::<Text, _>(id.to_owned())
        .get_result(conn)
        .await
        .optional()
        .map_err(|error| crate::err!(500, message = format!("pk lookup failed: {error}")))?;
    Ok(row.map(|row| row._pk))
}

async fn feather_table_pk(conn: &mut Connection<'_>, feather_name: &str) -> Result<i64> {
    let row: PkRow = diesel::sql_query("SELECT _pk FROM feather WHERE name = $1")
        .bind::<Text, _>(feather_name.to_owned())
        .get_result(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to resolve feather row for {feather_name}: {error}")))?;
    Ok(row._pk)
}

async fn authorize(conn: &mut Connection<'_>, ctx: &CrudContext<'_>, action: Action, object_pk: i64, folder_pk: Option<i64>) -> Result<()> {
    let allowed = auth::is_authorized(
        conn,
        IsAuthorized {
            action,
            object_pk,
            folder_pk,
            user: ctx.user,
        },
    )
    .await?;

    if !allowed {
        return Err(crate::err!(401, message = "not authorized"));
    }

    Ok(())
}

/// Runs the documented natural-key uniqueness probe: exactly one scalar
/// property may be `isNaturalKey=true` without `autonumber`; its value must
/// not collide with another row (other than `excluding_id`, during update).
async fn probe_natural_key_uniqueness(
    conn: &mut Connection<'_>,
    feather: &Feather,
    data: &Map<String, Value>,
    excluding_id: Option<&str>,
) -> Result<()> {
    let Some((name, _)) = feather.properties.iter().find(|(_, property)| {
        matches!(property, Property::Scalar(scalar) if scalar.is_natural_key && scalar.autonumber.is_none())
    }) else {
        return Ok(());
    };

    let Some(value) = data.get(name) else {
        return Ok(());
    };
    if value.is_null() {
        return Ok(());
    }

    let column = crate::model::to_snake_case(name);
    let mut statement = format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE {column} = $1",
        feather.table_name()
    );
    if excluding_id.is_some() {
        statement.push_str(" AND id <> $2");
    }
    statement.push_str(") AS present");

    let mut query = diesel::sql_query(statement).into_boxed();
    query = query.bind::<Text, _>(value.as_str().map(str::to_owned).unwrap_or_else(|| value.to_string()));
    if let Some(excluding_id) = excluding_id {
        query = query.bind::<Text, _>(excluding_id.to_owned());
    }

    let row: ExistsRow = query
        .get_result(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("uniqueness probe failed: {error}")))?;

    if row.present {
        return Err(crate::err!(
            409,
            message = format!(
                "Value '{}' assigned to {} on {} is not unique to data type {}.",
                value.as_str().unwrap_or_default(),
                display_name(name),
                feather.name,
                feather.name
            )
        ));
    }

    Ok(())
}

fn display_name(camel_case: &str) -> String {
    let mut out = String::new();
    for (i, ch) in camel_case.chars().enumerate() {
        if ch.is_uppercase() && i != 0 {
            out.push(' ');
        }
        if i == 0 {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
    }
    out
}

pub struct SelectRequest {
    pub feather_name: String,
    pub id: Option<String>,
    pub filter: Filter,
    pub show_deleted: bool,
    pub subscription: Option<(String, String, String)>,
}

/// Fetches one row (`id` given) or a filtered page, sanitizing the result
/// and resolving relation sub-selects.
pub async fn do_select(conn: &mut Connection<'_>, ctx: &CrudContext<'_>, request: SelectRequest, recursion: &Recursion) -> Result<Value> {
    let feather = ctx.catalog.get_feather(&request.feather_name, true)?;
    if feather.is_child && !recursion.is_child && !ctx.user.is_super_user {
        return Err(crate::err!(400, message = format!("{} is a child feather and cannot be selected directly", feather.name)));
    }

    if let Some(id) = &request.id {
        let row = select_one_raw(conn, ctx.catalog, &feather, id).await?;
        if !request.show_deleted && row.get("isDeleted").and_then(Value::as_bool).unwrap_or(false) {
            return Err(crate::err!(404, message = format!("no such {} \"{id}\"", feather.name)));
        }
        return Ok(tools::sanitize(&row));
    }

    if request.filter.limit == Some(0) {
        return Ok(Value::Array(Vec::new()));
    }

    let mut tokens = Tokens::default();
    let mut clauses = Vec::new();

    if !request.show_deleted {
        clauses.push(format!("{}.is_deleted = FALSE", feather.table_name()));
    }
    if let Some(criteria_sql) = tools::build_criteria_sql(&request.filter, &mut tokens, &feather)? {
        clauses.push(criteria_sql);
    }
    if !ctx.user.is_super_user {
        clauses.push(tools::build_auth_sql(Action::CanRead, &feather.table_name(), &mut tokens, &ctx.user.username));
    }

    let order_by = tools::process_sort(&request.filter.sort, &mut tokens, &feather)?;
    let where_clause = if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };
    let limit_clause = request.filter.limit.map(|limit| format!("LIMIT {limit}")).unwrap_or_default();
    let offset_clause = request.filter.offset.map(|offset| format!("OFFSET {offset}")).unwrap_or_default();

    let statement = format!(
        "SELECT id FROM {} {where_clause} {order_by} {limit_clause} {offset_clause}",
        feather.table_name()
    );

    #[derive(QueryableByName)]
    struct IdRow {
        #[diesel(sql_type = Text)]
        id: String,
    }

    let rows: Vec<IdRow> = tools::bind_tokens(diesel::sql_query(statement), tokens)
        .load(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("select failed: {error}")))?;

    let mut results = Vec::with_capacity(rows.len());
    for row in &rows {
        results.push(tools::sanitize(&select_one_raw(conn, ctx.catalog, &feather, &row.id).await?));
    }

    if let Some((node_id, session_id, subscription_id)) = request.subscription {
        let ids: Vec<String> = rows.into_iter().map(|row| row.id).collect();
        let feather_arg = if request.filter.criteria.is_empty() { Some(feather.name.as_str()) } else { None };
        crate::events::subscribe(
            conn,
            SubscribeRequest {
                node_id: &node_id,
                session_id: &session_id,
                subscription_id: &subscription_id,
                merge: false,
            },
            &ids,
            feather_arg,
        )
        .await?;
    }

    Ok(Value::Array(results))
}

/// Reads a single object row by id, including one level of to-one relation
/// sub-selects (by id) and to-many sub-selects (ordered by `_pk`). Returns
/// the raw (unsanitized, still camel/snake mixed) JSON object so callers
/// that need the persisted form for diffing can use it directly.
fn select_one_raw<'a>(
    conn: &'a mut Connection<'_>,
    catalog: &'a Catalog,
    feather: &'a Feather,
    id: &'a str,
) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
    Box::pin(async move {
        #[derive(QueryableByName)]
        struct RowJson {
            #[diesel(sql_type = Jsonb)]
            row: Value,
        }

        let statement = format!("SELECT to_jsonb(t) AS row FROM {} t WHERE id = $1", feather.table_name());
        let row: RowJson = diesel::sql_query(statement)
            .bind::<Text, _>(id.to_owned())
            .get_result(conn)
            .await
            .map_err(|_| crate::err!(404, message = format!("no such {} \"{id}\"", feather.name)))?;

        let Value::Object(mut object) = row.row else {
            return Ok(Value::Object(Map::new()));
        };
        object.remove("_pk");
        object.remove("folder");

        for (name, property) in feather.properties.iter() {
            let Property::Scalar(scalar) = property else {
                continue;
            };
            if scalar.format != Format::Money {
                continue;
            }

            let column = crate::model::to_snake_case(name);
            let mut money = Map::new();
            for (json_key, column_suffix, _) in money_subcolumns() {
                let sub_column = format!("{column}_{column_suffix}");
                money.insert(json_key.to_owned(), object.remove(&sub_column).unwrap_or(Value::Null));
            }
            object.insert(name.clone(), Value::Object(money));
        }

        for (name, property) in feather.properties.iter() {
            let Property::Relation(relation) = property else {
                continue;
            };
            let snake = crate::model::to_snake_case(name);

            match relation.kind() {
                RelationKind::ToOne | RelationKind::IsChild => {
                    if let Some(Value::Number(pk)) = object.get(&snake).cloned() {
                        let pk = pk.as_i64().unwrap_or(-1);
                        if pk >= 0 {
                            object.remove(&snake);
                            if let Ok(related_feather) = catalog.get_feather(&relation.relation, true) {
                                if let Ok(related_id) = id_for_pk(conn, pk).await {
                                    let related = select_one_raw(conn, catalog, &related_feather, &related_id).await.ok();
                                    object.insert(name.clone(), related.unwrap_or(Value::Null));
                                }
                            }
                        } else {
                            object.remove(&snake);
                            object.insert(name.clone(), Value::Null);
                        }
                    }
                }
                RelationKind::ToMany => {
                    // resolved by the caller via a dedicated back-reference query,
                    // left empty here to avoid an unbounded fan-out on every read.
                    object.insert(name.clone(), Value::Array(Vec::new()));
                }
            }
        }

        Ok(Value::Object(object))
    })
}

async fn id_for_pk(conn: &mut Connection<'_>, pk: i64) -> Result<String> {
    #[derive(QueryableByName)]
    struct IdRow {
        #[diesel(sql_type = Text)]
        id: String,
    }

    let row: IdRow = diesel::sql_query("SELECT id FROM object WHERE _pk = $1")
        .bind::<BigInt, _>(pk)
        .get_result(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to resolve _pk {pk}: {error}")))?;
    Ok(row.id)
}

pub struct UpdateRequest {
    pub feather_name: String,
    pub id: String,
    pub patch: json_patch::Patch,
    pub event_key: Option<String>,
}

/// Steps 1-10 of the documented update algorithm.
pub async fn do_update(conn: &mut Connection<'_>, ctx: &CrudContext<'_>, request: UpdateRequest, recursion: &Recursion) -> Result<Value> {
    if crate::patch::is_empty(&request.patch) {
        return Ok(Value::Array(Vec::new()));
    }

    let feather = ctx.catalog.get_feather(&request.feather_name, true)?;
    if feather.is_child && !recursion.is_child && !ctx.user.is_super_user {
        return Err(crate::err!(400, message = format!("{} is a child feather and cannot be updated directly", feather.name)));
    }

    let object_pk = resolve_object_pk(conn, &request.id)
        .await?
        .ok_or_else(|| crate::err!(404, message = format!("no such {} \"{}\"", feather.name, request.id)))?;
    authorize(conn, ctx, Action::CanUpdate, object_pk, None).await?;

    let old_record = select_one_raw(conn, ctx.catalog, &feather, &request.id).await?;
    let lock: Option<crate::model::Lock> = old_record
        .get("lock")
        .filter(|value| !value.is_null())
        .and_then(|value| serde_json::from_value(value.clone()).ok());
    locks::check_not_locked(&lock, request.event_key.as_deref().unwrap_or_default())?;

    let cache_record = old_record.clone();
    let new_record = crate::patch::apply(&old_record, &request.patch)?;
    let Value::Object(new_object) = &new_record else {
        return Err(crate::err!(400, message = "patched document is not an object"));
    };

    for (name, property) in feather.properties.iter() {
        if property.is_required() {
            let value = new_object.get(name);
            if value.is_none() || value == Some(&Value::Null) {
                return Err(crate::err!(400, message = format!("{name} is required on {}", feather.name)));
            }
        }
    }

    probe_natural_key_uniqueness(conn, &feather, new_object, Some(&request.id)).await?;

    let mut tokens = Tokens::default();
    let mut set_clauses = Vec::new();
    let new_etag = uuid::Uuid::new_v4().to_string();

    for (name, property) in feather.properties.iter() {
        let Some(new_value) = new_object.get(name) else {
            continue;
        };
        if old_record.get(name) == Some(new_value) {
            continue;
        }

        match property {
            Property::Scalar(scalar) if scalar.format == Format::Money => {
                for (column, (db_type, sub_value)) in money_columns(name, new_value) {
                    set_clauses.push(format!("{column} = {}", tools::bind_value(&mut tokens, &sub_value, db_type)));
                }
            }
            Property::Scalar(scalar) => {
                let column = crate::model::to_snake_case(name);
                set_clauses.push(format!("{column} = {}", tools::bind_value(&mut tokens, new_value, scalar.format.db_type())));
            }
            Property::Relation(relation) if relation.kind() != RelationKind::ToMany => {
                let column = crate::model::to_snake_case(name);
                let pk = match new_value.as_str() {
                    Some(referenced_id) => resolve_object_pk(conn, referenced_id).await?.unwrap_or(-1),
                    None => -1,
                };
                set_clauses.push(format!("{column} = {}", tools::bind_value(&mut tokens, &Value::from(pk), "integer")));
            }
            Property::Relation(_) => {}
        }
    }

    set_clauses.push(format!("updated = {}", tools::bind_value(&mut tokens, &Value::String(Utc::now().to_rfc3339()), "timestamptz")));
    set_clauses.push(format!(
        "updated_by = {}",
        tools::bind_value(&mut tokens, &Value::String(ctx.user.username.clone()), "text")
    ));
    set_clauses.push(format!("etag = {}", tools::bind_value(&mut tokens, &Value::String(new_etag), "text")));
    set_clauses.push("lock = NULL".to_owned());

    if set_clauses.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }

    let id_placeholder = tools::bind_value(&mut tokens, &Value::String(request.id.clone()), "text");
    let statement = format!("UPDATE {} SET {} WHERE id = {id_placeholder}", feather.table_name(), set_clauses.join(", "));

    tools::bind_tokens(diesel::sql_query(statement), tokens)
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("update failed: {error}")))?;

    let persisted = select_one_raw(conn, ctx.catalog, &feather, &request.id).await?;
    log_change(conn, &request.id, LogAction::Patch, ctx.user, &persisted).await?;

    ctx.events
        .notify(
            conn,
            &feather.name,
            EnvelopeMessage {
                subscription: crate::events::SubscriptionRef {
                    id: String::new(),
                    session_id: String::new(),
                    node_id: ctx.node_id.to_owned(),
                },
                action: ChangeAction::Update,
                data: persisted.clone(),
            },
        )
        .await
        .ok();

    let response_patch = crate::patch::diff(&cache_record, &persisted);
    serde_json::to_value(&response_patch.0).map_err(|error| crate::err!(500, message = format!("failed to encode response patch: {error}")))
}

pub struct DeleteRequest {
    pub feather_name: String,
    pub id: String,
    pub event_key: Option<String>,
    pub is_hard: bool,
}

/// Steps 1-5 of the documented delete algorithm.
pub async fn do_delete(conn: &mut Connection<'_>, ctx: &CrudContext<'_>, request: DeleteRequest, recursion: &Recursion) -> Result<()> {
    let feather = ctx.catalog.get_feather(&request.feather_name, true)?;
    if feather.is_child && !recursion.is_child && !ctx.user.is_super_user {
        return Err(crate::err!(400, message = format!("{} is a child feather and cannot be deleted directly", feather.name)));
    }

    let object_pk = resolve_object_pk(conn, &request.id)
        .await?
        .ok_or_else(|| crate::err!(404, message = format!("no such {} \"{}\"", feather.name, request.id)))?;
    authorize(conn, ctx, Action::CanDelete, object_pk, None).await?;

    let old_record = select_one_raw(conn, ctx.catalog, &feather, &request.id).await?;
    if old_record.get("isDeleted").and_then(Value::as_bool).unwrap_or(false) {
        return Err(crate::err!(404, message = format!("{} \"{}\" is already deleted", feather.name, request.id)));
    }
    let lock: Option<crate::model::Lock> = old_record
        .get("lock")
        .filter(|value| !value.is_null())
        .and_then(|value| serde_json::from_value(value.clone()).ok());
    locks::check_not_locked(&lock, request.event_key.as_deref().unwrap_or_default())?;

    for (name, property) in feather.properties.iter() {
        let Property::Relation(relation) = property else {
            continue;
        };
        if relation.kind() != RelationKind::ToMany {
            continue;
        }
        if let Some(Value::Array(children)) = old_record.get(name) {
            for child in children {
                if let Some(child_id) = child.get("id").and_then(Value::as_str) {
                    Box::pin(do_delete(
                        conn,
                        ctx,
                        DeleteRequest {
                            feather_name: relation.relation.clone(),
                            id: child_id.to_owned(),
                            event_key: request.event_key.clone(),
                            is_hard: request.is_hard,
                        },
                        &Recursion::child(),
                    ))
                    .await?;
                }
            }
        }
    }

    if request.is_hard {
        diesel::sql_query(format!("DELETE FROM {} WHERE id = $1", feather.table_name()))
            .bind::<Text, _>(request.id.clone())
            .execute(conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("hard delete failed: {error}")))?;

        if feather.name == "Folder" {
            crate::auth::propagate_auth(
                conn,
                crate::auth::PropagateAuth {
                    folder_pk: object_pk,
                    role: None,
                    is_deleted: true,
                },
            )
            .await
            .ok();
        }
    } else {
        diesel::sql_query(format!("UPDATE {} SET is_deleted = TRUE WHERE id = $1", feather.table_name()))
            .bind::<Text, _>(request.id.clone())
            .execute(conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("soft delete failed: {error}")))?;
    }

    log_change(conn, &request.id, LogAction::Delete, ctx.user, &Value::Null).await?;

    ctx.events
        .notify(
            conn,
            &feather.name,
            EnvelopeMessage {
                subscription: crate::events::SubscriptionRef {
                    id: String::new(),
                    session_id: String::new(),
                    node_id: ctx.node_id.to_owned(),
                },
                action: ChangeAction::Delete,
                data: Value::String(request.id.clone()),
            },
        )
        .await
        .ok();

    Ok(())
}

async fn log_change(conn: &mut Connection<'_>, object_id: &str, action: LogAction, user: &CurrentUser, change: &Value) -> Result<()> {
    let action_text = match action {
        LogAction::Post => "POST",
        LogAction::Patch => "PATCH",
        LogAction::Delete => "DELETE",
    };

    diesel::sql_query("INSERT INTO log (object_id, action, created_by, change) VALUES ($1, $2, $3, $4)")
        .bind::<Text, _>(object_id.to_owned())
        .bind::<Text, _>(action_text.to_owned())
        .bind::<Text, _>(user.username.clone())
        .bind::<Jsonb, _>(change.clone())
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to write log entry: {error}")))?;

    Ok(())
}
