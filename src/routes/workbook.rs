//! `/workbook`, `/workbooks`: named JSON documents with no etag and no
//! physical schema, backed directly by the `workbook` table.

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

#[derive(QueryableByName, Serialize)]
struct WorkbookRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Jsonb)]
    body: Value,
}

/// `GET /workbooks`: every workbook, name and body both.
pub async fn list(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::GET {
        return next.call(request).await;
    }

    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    let rows: Vec<WorkbookRow> = diesel::sql_query("SELECT name, body FROM workbook ORDER BY name")
        .load(&mut conn)
        .await
        .map_err(|error| crate::err!(500, message = format!("failed to list workbooks: {error}")))?;

    Response::builder().json(&rows)
}

pub async fn by_name(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    let mut request = request;
    let method = request.method().clone();
    if !matches!(method, Method::GET | Method::PUT | Method::DELETE) {
        return next.call(request).await;
    }

    let name = request.param("name")?.to_owned();
    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    match method {
        Method::GET => {
            let row: WorkbookRow = diesel::sql_query("SELECT name, body FROM workbook WHERE name = $1")
                .bind::<Text, _>(name.clone())
                .get_result(&mut conn)
                .await
                .map_err(|_| crate::err!(404, message = format!("no workbook named \"{name}\"")))?;

            Response::builder().json(&row)
        }
        Method::PUT => {
            let _user = current_user(&request)?;
            let body: Value = request.json().await?;

            diesel::sql_query(
                "INSERT INTO workbook (name, body) VALUES ($1, $2)
                 ON CONFLICT (name) DO UPDATE SET body = EXCLUDED.body",
            )
            .bind::<Text, _>(name.clone())
            .bind::<Jsonb, _>(body.clone())
            .execute(&mut conn)
            .await
            .map_err(|error| crate::err!(500, message = format!("failed to save workbook \"{name}\": {error}")))?;

            Response::builder().json(&WorkbookRow { name, body })
        }
        Method::DELETE => {
            let _user = current_user(&request)?;
            diesel::sql_query("DELETE FROM workbook WHERE name = $1")
                .bind::<Text, _>(name.clone())
                .execute(&mut conn)
                .await
                .map_err(|error| crate::err!(500, message = format!("failed to delete workbook \"{name}\": {error}")))?;

            Response::builder().finish()
        }
        _ => unreachable!("method was matched above"),
    }
}
