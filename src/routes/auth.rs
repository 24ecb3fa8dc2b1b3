//! Session restoration: verifies the signed cookie and, if it names a known
//! account, inserts a resolved [`CurrentUser`] into the request's
//! extensions. Grounded in the teacher's `Verify`/`restore` pair
//! (`examples/chat/src/util/session/mod.rs`): a private type wraps the
//! principal so nothing outside this module can forge one by hand.
//!
//! Issuing the session cookie itself (a login route, password hashing) is
//! not part of this server; it is assumed an upstream identity provider
//! authenticates the browser and sets the cookie before the first request
//! reaches here (see `DESIGN.md`).

use diesel::sql_types::{Bool, Text};
use diesel::{OptionalExtension, QueryableByName};
use diesel_async::RunQueryDsl as AsyncRunQueryDsl;

use crate::error::Result;
use crate::http::session;
use crate::http::{Next, Request, Response};
use crate::model::CurrentUser;
use crate::state::AppState;

#[derive(Clone)]
struct Verify(CurrentUser);

#[derive(QueryableByName)]
struct UserRow {
    #[diesel(sql_type = Text)]
    username: String,
    #[diesel(sql_type = Bool)]
    is_super_user: bool,
}

/// Runs first in the middleware stack: looks up the signed cookie, resolves
/// the account it names, and stashes a `CurrentUser` for downstream
/// handlers. A missing or tampered cookie is not itself an error - routes
/// that require a principal call [`current_user`], which 401s.
pub async fn restore(mut request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    let state = request.shared_state();

    if let Some(session) = session::restore(&state.session_key, request.cookies()) {
        let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

        let row: Option<UserRow> = diesel::sql_query("SELECT username, is_super_user FROM user_account WHERE user_id::text = $1")
            .bind::<Text, _>(session.user_id.to_string())
            .get_result(&mut conn)
            .await
            .optional()
            .map_err(|error| crate::err!(500, message = format!("failed to resolve session user: {error}")))?;

        if let Some(row) = row {
            request.extensions_mut().insert(Verify(CurrentUser {
                username: row.username,
                is_super_user: row.is_super_user,
            }));
        }
    }

    next.call(request).await
}

/// Returns the request's authenticated principal, or 401 if none was
/// restored.
pub fn current_user(request: &Request<AppState>) -> Result<CurrentUser> {
    request
        .extensions()
        .get::<Verify>()
        .map(|verify| verify.0.clone())
        .ok_or_else(|| crate::err!(401, message = "authentication is required"))
}
