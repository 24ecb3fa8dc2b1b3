//! `/data`: the CRUD surface. A single dynamic pattern disambiguates the two
//! POST shapes at runtime via `Catalog::resolve_spinal` - a plural spinal
//! token is a filtered query, a singular one is an insert - mirroring the
//! teacher's `posts.respond(via::get(..).and(via::post(..)))` chaining, but
//! expressed as an explicit method match since this crate's `Next` stack
//! has no combinator for "try these handlers in order."

use http::Method;
use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::http::{Next, Request, Response};
use crate::pipeline::{Method as PipelineMethod, Payload};
use crate::state::AppState;
use crate::tools::Filter;

use super::auth::current_user;

/// The body of a filtered-query POST: the filter fields plus an optional
/// subscription request, per the documented `{criteria, sort, ..,
/// subscription: {id, sessionId, nodeId}}` shape.
#[derive(Deserialize)]
struct QueryBody {
    #[serde(flatten)]
    filter: Filter,
    #[serde(default)]
    subscription: Option<SubscriptionSpec>,
}

#[derive(Deserialize)]
struct SubscriptionSpec {
    id: String,
    #[serde(rename = "sessionId")]
    session_id: String,
    #[serde(rename = "nodeId")]
    node_id: String,
}

/// `POST /data/:name` - a filtered query when `:name` is a feather's plural
/// spinal form, an insert (or upsert, if the body carries a known `id`)
/// when it is the singular form.
pub async fn collection(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::POST {
        return next.call(request).await;
    }

    let mut request = request;
    let token = request.param("name")?.to_owned();
    let user = current_user(&request)?;
    let state = request.shared_state();

    let Some((feather, is_plural)) = state.catalog.resolve_spinal(&token) else {
        return Err(crate::err!(404, message = format!("no feather matches \"{token}\"")));
    };

    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    if is_plural {
        let body: QueryBody = request.json().await?;
        let subscription = body
            .subscription
            .map(|spec| (spec.node_id, spec.session_id, spec.id));

        let payload = Payload {
            method: PipelineMethod::Get,
            name: feather.name,
            id: None,
            data: None,
            filter: body.filter,
            subscription,
            event_key: None,
            show_deleted: false,
            is_hard_delete: false,
        };

        let result = state.pipeline.request(&mut conn, payload, user).await?;
        return Response::builder().json(&result);
    }

    let body: Value = request.json().await?;
    let Value::Object(_) = &body else {
        return Err(crate::err!(400, message = "insert requires a data object"));
    };
    let id = body.get("id").and_then(Value::as_str).map(str::to_owned);

    let payload = Payload {
        method: PipelineMethod::Post,
        name: feather.name,
        id,
        data: Some(body),
        filter: Filter::default(),
        subscription: None,
        event_key: None,
        show_deleted: false,
        is_hard_delete: false,
    };

    let result = state.pipeline.request(&mut conn, payload, user).await?;
    Response::builder().json(&result)
}

/// `GET|PATCH|DELETE /data/:name/:id`.
pub async fn member(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    let mut request = request;
    let method = match *request.method() {
        Method::GET => PipelineMethod::Get,
        Method::PATCH => PipelineMethod::Patch,
        Method::DELETE => PipelineMethod::Delete,
        _ => return next.call(request).await,
    };

    let name = request.param("name")?.to_owned();
    let id = request.param("id")?.to_owned();
    let user = current_user(&request)?;
    let show_deleted = request.query("showDeleted").as_deref() == Some("true");
    let event_key = request.query("eventKey");
    let is_hard_delete = request.query("hard").as_deref() == Some("true");

    let state = request.shared_state();
    let Some((feather, _)) = state.catalog.resolve_spinal(&name) else {
        return Err(crate::err!(404, message = format!("no feather matches \"{name}\"")));
    };

    let data = match method {
        PipelineMethod::Patch => Some(request.json::<Value>().await?),
        _ => None,
    };

    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    let payload = Payload {
        method,
        name: feather.name,
        id: Some(id),
        data,
        filter: Filter::default(),
        subscription: None,
        event_key,
        show_deleted,
        is_hard_delete,
    };

    let result = state.pipeline.request(&mut conn, payload, user).await?;
    Response::builder().json(&result)
}
