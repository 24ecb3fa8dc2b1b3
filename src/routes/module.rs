//! `/module`, `/modules`: lists the modules bundled into this server.
//! Module packaging and installation are out of scope (see `DESIGN.md`); a
//! running server exposes exactly the one module it was built with.

use http::Method;
use serde::Serialize;

use crate::error::Result;
use crate::http::{Next, Request, Response};
use crate::state::AppState;

#[derive(Serialize)]
struct ModuleInfo {
    name: &'static str,
    version: &'static str,
}

pub async fn list(request: Request<AppState>, next: Next<AppState>) -> Result<Response> {
    if *request.method() != Method::GET {
        return next.call(request).await;
    }

    let modules = [ModuleInfo {
        name: "core",
        version: env!("CARGO_PKG_VERSION"),
    }];

    Response::builder().json(&modules)
}
