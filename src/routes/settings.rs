//! `/settings/:name` and `/settings-definition`: named, etag-stamped JSON
//! blobs. Unlike feathers, settings carry no physical schema, so reads and
//! writes go straight to the `settings` table rather than through an
//! in-memory cache (see `DESIGN.md` for why the redesign hint's cache layer
//! was judged unnecessary here).

use diesel::sql_types::{Jsonb, Text};
use diesel::QueryableByName;
use diesel_async::RunQueryDsl as AsyncRunQueryDsl;
use http::Method;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::http::{Next, Request, Response};
use crate::state::AppState;

use super::auth::current_user;

#[derive(QueryableByName)]
struct SettingsRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Jsonb)]
    body: Value,
    #[diesel(sql_type = Text)]
    etag: String,
}

#[derive(Serialize)]
struct SettingsEnvelope<'a> {
    name: &'a str,
    body: &'a Value,
    etag: &'a str,
}

pub async fn by_name(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    let mut request = request;
    let method = request.method().clone();
    if !matches!(method, Method::GET | Method::PUT) {
        return next.call(request).await;
    }

    let name = request.param("name")?.to_owned();
    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    match method {
        Method::GET => {
            let row: SettingsRow = diesel::sql_query("SELECT name, body, etag FROM settings WHERE name = $1")
                .bind::<Text, _>(name.clone())
                .get_result(&mut conn)
                .await
                .map_err(|_| crate::err!(404, message = format!("no settings blob named \"{name}\"")))?;

            Response::builder().json(&SettingsEnvelope { name: &row.name, body: &row.body, etag: &row.etag })
        }
        Method::PUT => {
            let _user = current_user(&request)?;
            let body: Value = request.json().await?;
            let etag = uuid::Uuid::new_v4().to_string();

            diesel::sql_query(
                "INSERT INTO settings (name, body, etag) VALUES ($1, $2, $3)
                 ON CONFLICT (name) DO UPDATE SET body = EXCLUDED.body, etag = EXCLUDED.etag",
            )
            .bind::<Text, _>(name.clone())
            .bind::<Jsonb, _>(body.clone())
            .bind::<Text, _>(etag.clone())
            .execute(&mut conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to save settings \"{name}\": {error}")))?;

            Response::builder().json(&SettingsEnvelope { name: &name, body: &body, etag: &etag })
        }
        _ => unreachable!("method was matched above"),
    }
}

/// `GET /settings-definition`: a directory of every settings blob currently
/// persisted, named and etag-stamped but without the (potentially large)
/// body, so clients can decide what they still need to fetch.
pub async fn definition(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::GET {
        return next.call(request).await;
    }

    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    #[derive(QueryableByName, Serialize)]
    struct DefinitionRow {
        #[diesel(sql_type = Text)]
        name: String,
        #[diesel(sql_type = Text)]
        etag: String,
    }

    let rows: Vec<DefinitionRow> = diesel::sql_query("SELECT name, etag FROM settings ORDER BY name")
        .load(&mut conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to list settings: {error}")))?;

    Response::builder().json(&rows)
}
