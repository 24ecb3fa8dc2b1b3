//! `/do/subscribe`, `/do/unsubscribe`, `/do/lock`, `/do/unlock`: thin POST
//! actions whose parameters travel entirely in the query string, per the
//! documented `POST /do/lock?id=<id>&sessionId=S&eventKey=K` shape. None of
//! these carry a request body.

use http::Method;
use serde::Serialize;

use crate::error::Result;
use crate::events::{self, SubscribeRequest, UnsubscribeScope};
use crate::http::{Next, Request, Response};
use crate::locks::{self, UnlockCriteria};
use crate::state::AppState;

use super::auth::current_user;

#[derive(Serialize)]
struct Ok1 {
    ok: bool,
}

fn required_query(request: &Request<AppState>, name: &str) -> Result<String> {
    request
        .query(name)
        .ok_or_else(|| crate::err!(400, message = format!("missing required query parameter \"{name}\"")))
}

pub async fn subscribe(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::POST {
        return next.call(request).await;
    }
    let _user = current_user(&request)?;

    let node_id = required_query(&request, "nodeId")?;
    let session_id = required_query(&request, "sessionId")?;
    let subscription_id = required_query(&request, "subscriptionId")?;
    let merge = request.query("merge").as_deref() == Some("true");
    let feather = request.query("feather");
    let ids = request
        .query("id")
        .map(|raw| raw.split(',').map(str::to_owned).collect::<Vec<_>>())
        .unwrap_or_default();

    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    events::subscribe(
        &mut conn,
        SubscribeRequest {
            node_id: &node_id,
            session_id: &session_id,
            subscription_id: &subscription_id,
            merge,
        },
        &ids,
        feather.as_deref(),
    )
    .await?;

    Response::builder().json(&Ok1 { ok: true })
}

pub async fn unsubscribe(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::POST {
        return next.call(request).await;
    }
    let _user = current_user(&request)?;

    let (id, scope) = if let Some(subscription_id) = request.query("subscriptionId") {
        (subscription_id, UnsubscribeScope::Subscription)
    } else if let Some(session_id) = request.query("sessionId") {
        (session_id, UnsubscribeScope::Session)
    } else if let Some(node_id) = request.query("nodeId") {
        (node_id, UnsubscribeScope::Node)
    } else {
        return Err(crate::err!(400, message = "unsubscribe requires subscriptionId, sessionId, or nodeId"));
    };

    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    events::unsubscribe(&mut conn, &id, scope).await?;
    Response::builder().json(&Ok1 { ok: true })
}

pub async fn lock(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::POST {
        return next.call(request).await;
    }
    let user = current_user(&request)?;

    let id = required_query(&request, "id")?;
    let session_id = required_query(&request, "sessionId")?;
    let event_key = request.query("eventKey").unwrap_or_else(|| session_id.clone());

    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    let acquired = locks::lock(&mut conn, &state.node_id, &id, &user.username, &event_key).await?;
    Response::builder().json(&Ok1 { ok: acquired })
}

pub async fn unlock(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::POST {
        return next.call(request).await;
    }
    let _user = current_user(&request)?;

    let id = request.query("id");
    let username = request.query("username");
    let event_key = request.query("eventKey");
    let node_id = request.query("nodeId");

    let state = request.shared_state();
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    locks::unlock(
        &mut conn,
        UnlockCriteria {
            id: id.as_deref(),
            username: username.as_deref(),
            event_key: event_key.as_deref(),
            node_id: node_id.as_deref(),
        },
    )
    .await?;

    Response::builder().json(&Ok1 { ok: true })
}
