//! `/feather/:name`: read, save, or drop a feather descriptor. Saving and
//! dropping reshape physical tables, so both require the super-user bypass
//! the same way `auth::is_authorized` does for CRUD.

use http::Method;

use crate::error::Result;
use crate::http::{Next, Request, Response};
use crate::model::{CurrentUser, Feather};
use crate::state::AppState;

use super::auth::current_user;

pub async fn by_name(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    let mut request = request;
    let method = request.method().clone();
    if !matches!(method, Method::GET | Method::PUT | Method::DELETE) {
        return next.call(request).await;
    }

    let name = request.param("name")?.to_owned();
    let user = current_user(&request)?;
    let state = request.shared_state();

    if method == Method::GET {
        let feather = state.catalog.get_feather(&name, true)?;
        return Response::builder().json(&feather);
    }

    require_super_user(&user)?;
    let mut conn = state.pool.get().await.map_err(|error| crate::err!(500, message = format!("failed to acquire connection: {error}")))?;

    match method {
        Method::PUT => {
            let feather: Feather = request.json().await?;
            let saved = state.catalog.save_feather(&mut conn, feather).await?;
            Response::builder().json(&saved)
        }
        Method::DELETE => {
            state.catalog.delete_feather(&mut conn, &name).await?;
            Response::builder().finish()
        }
        _ => unreachable!("method was matched above"),
    }
}

fn require_super_user(user: &CurrentUser) -> Result<()> {
    if user.is_super_user {
        Ok(())
    } else {
        Err(crate::err!(401, message = "only a super user may change the feather catalog"))
    }
}
