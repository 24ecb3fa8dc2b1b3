//! Pessimistic record locks, stored inline on the object row (`lock` is a
//! system column per `model::SYSTEM_COLUMNS`). Grounded in the teacher's
//! optimistic `etag`-style row stamping in `examples/chat`'s update paths,
//! adapted here to a pessimistic model because the spec requires an
//! explicit acquire/release pair rather than a compare-and-swap.

use chrono::Utc;
use diesel::sql_types::{Jsonb, Nullable, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl as AsyncRunQueryDsl;
use serde_json::Value;

use crate::db::Connection;
use crate::error::Result;
use crate::model::Lock;
use crate::tools::{self, Tokens};

#[derive(QueryableByName)]
struct LockRow {
    #[diesel(sql_type = Nullable<Jsonb>)]
    lock: Option<serde_json::Value>,
}

/// Acquires the lock iff the object is currently unlocked. Returns `true`
/// on success, `false` if someone else already holds it.
pub async fn lock(conn: &mut Connection<'_>, node_id: &str, id: &str, username: &str, event_key: &str) -> Result<bool> {
    let current: LockRow = diesel::sql_query("SELECT lock FROM object WHERE id = $1 FOR UPDATE")
        .bind::<Text, _>(id.to_owned())
        .get_result(conn)
        .await
        .map_err(|_| crate::err!(404, message = format!("no such object \"{id}\"")))?;

    if current.lock.is_some() {
        return Ok(false);
    }

    let new_lock = Lock {
        username: username.to_owned(),
        acquired_at: Utc::now(),
        node_id: node_id.to_owned(),
        event_key: event_key.to_owned(),
    };
    let body = serde_json::to_value(&new_lock).expect("lock serializes");

    diesel::sql_query("UPDATE object SET lock = $1 WHERE id = $2")
        .bind::<Jsonb, _>(body)
        .bind::<Text, _>(id.to_owned())
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to acquire lock: {error}")))?;

    Ok(true)
}

#[derive(Default)]
pub struct UnlockCriteria<'a> {
    pub id: Option<&'a str>,
    pub username: Option<&'a str>,
    pub event_key: Option<&'a str>,
    pub node_id: Option<&'a str>,
}

/// Clears locks matching any non-empty subset of `{id, username, eventKey,
/// nodeId}`. At least one field must be present.
pub async fn unlock(conn: &mut Connection<'_>, criteria: UnlockCriteria<'_>) -> Result<()> {
    if criteria.id.is_none() && criteria.username.is_none() && criteria.event_key.is_none() && criteria.node_id.is_none() {
        return Err(crate::err!(400, message = "unlock requires at least one criterion"));
    }

    let mut tokens = Tokens::default();
    let mut clauses = Vec::new();
    if let Some(id) = criteria.id {
        clauses.push(format!("id = {}", tokens.bind(Value::String(id.to_owned()))));
    }
    if let Some(username) = criteria.username {
        clauses.push(format!("lock ->> 'username' = {}", tokens.bind(Value::String(username.to_owned()))));
    }
    if let Some(event_key) = criteria.event_key {
        clauses.push(format!("lock ->> 'eventKey' = {}", tokens.bind(Value::String(event_key.to_owned()))));
    }
    if let Some(node_id) = criteria.node_id {
        clauses.push(format!("lock ->> 'nodeId' = {}", tokens.bind(Value::String(node_id.to_owned()))));
    }

    let statement = format!("UPDATE object SET lock = NULL WHERE {}", clauses.join(" AND "));
    tools::bind_tokens(diesel::sql_query(statement), tokens)
        .execute(conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to release lock: {error}")))?;

    Ok(())
}

/// Returns `Record is locked by <user>` unless the caller's event key
/// matches the holder's, in which case the caller is the lock owner and may
/// proceed.
pub fn check_not_locked(lock: &Option<Lock>, event_key: &str) -> Result<()> {
    match lock {
        Some(existing) if existing.event_key != event_key => {
            Err(crate::err!(409, message = format!("Record is locked by {}", existing.username)))
        }
        _ => Ok(()),
    }
}
